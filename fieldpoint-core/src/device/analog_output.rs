//! Analog output: voltage/current/resistance channel.
//!
//! Two register encodings exist in the field. Smaller boards expose one raw
//! register scaled by 2.5 mV per count; the controller-grade boards expose an
//! IEEE float pair plus a second pair carrying the resistance measurement.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use fieldpoint_common::{Error, Result};

use crate::hwdef::{ModeDef, RegisterKind, Endianness};
use crate::util::lock;

use super::decode::{f32_from_registers, f32_to_registers, round_to};
use super::{AliasSlot, Device, DeviceKind, ModbusChannel, SetRequest, kind_mismatch, with_alias};

/// Volts (or milliamps) per raw count of the scaled encoding.
const SCALED_STEP: f64 = 0.0025;
/// Raw ceiling of the scaled encoding (12-bit DAC).
const SCALED_MAX: u16 = 4095;

/// How the output value is laid out in registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogOutputEncoding {
    /// Single register, 2.5 mV per count.
    Scaled,
    /// Float32 pair at the value register, plus a dedicated resistance pair.
    Float32 { res_reg: u16 },
}

#[derive(Default)]
struct Shadow {
    mode: Option<String>,
    value: Option<f64>,
    res_value: Option<f64>,
}

pub struct AnalogOutput {
    circuit: String,
    channel: ModbusChannel,
    val_reg: u16,
    mode_reg: Option<u16>,
    modes: HashMap<String, ModeDef>,
    encoding: AnalogOutputEncoding,
    alias: AliasSlot,
    state: Mutex<Shadow>,
}

impl AnalogOutput {
    pub fn new(
        circuit: impl Into<String>,
        channel: ModbusChannel,
        val_reg: u16,
        mode_reg: Option<u16>,
        modes: HashMap<String, ModeDef>,
        encoding: AnalogOutputEncoding,
    ) -> Self {
        let mode = if modes.len() == 1 && mode_reg.is_none() {
            modes.keys().next().cloned()
        } else {
            None
        };

        Self {
            circuit: circuit.into(),
            channel,
            val_reg,
            mode_reg,
            modes,
            encoding,
            alias: AliasSlot::new(),
            state: Mutex::new(Shadow {
                mode,
                ..Shadow::default()
            }),
        }
    }

    fn read_float_pair(&self, reg: u16) -> f64 {
        // An unavailable measurement reads as 0, never as an error.
        match self.channel.register_pair(reg, RegisterKind::Holding) {
            Ok(regs) => {
                let value = f32_from_registers(regs, Endianness::Big, Endianness::Little) as f64;
                if value.is_finite() {
                    round_to(value, 3)
                } else {
                    0.0
                }
            }
            Err(_) => 0.0,
        }
    }

    fn mode_by_value(&self, raw: u16) -> Option<String> {
        self.modes
            .iter()
            .find(|(_, def)| def.value == Some(raw))
            .map(|(name, _)| name.clone())
    }

    async fn write_value(&self, value: f64) -> Result<f64> {
        match self.encoding {
            AnalogOutputEncoding::Scaled => {
                let raw = ((value / SCALED_STEP) as i64).clamp(0, SCALED_MAX as i64) as u16;
                self.channel.write_register(self.val_reg, raw).await?;
                Ok(raw as f64 * SCALED_STEP)
            }
            AnalogOutputEncoding::Float32 { .. } => {
                let value = value.max(0.0);
                let regs =
                    f32_to_registers(value as f32, Endianness::Big, Endianness::Little);
                self.channel.write_registers(self.val_reg, &regs).await?;
                Ok(value)
            }
        }
    }
}

#[async_trait]
impl Device for AnalogOutput {
    fn kind(&self) -> DeviceKind {
        DeviceKind::AnalogOutput
    }

    fn circuit(&self) -> &str {
        &self.circuit
    }

    fn alias(&self) -> Option<String> {
        self.alias.get()
    }

    fn set_alias(&self, alias: Option<String>) {
        self.alias.set(alias);
    }

    fn full(&self) -> Value {
        let state = lock(&self.state);
        let mode_def = state.mode.as_ref().and_then(|m| self.modes.get(m));
        let resistance = state.mode.as_deref() == Some("Resistance");
        let value = if resistance && matches!(self.encoding, AnalogOutputEncoding::Float32 { .. })
        {
            state.res_value
        } else {
            state.value
        };

        let snapshot = json!({
            "dev": "ao",
            "circuit": self.circuit,
            "mode": state.mode,
            "modes": self.modes,
            "value": value,
            "unit": mode_def.and_then(|d| d.unit.clone()),
            "range": mode_def.and_then(|d| d.range.clone()),
        });
        drop(state);
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        let state = lock(&self.state);
        let resistance = state.mode.as_deref() == Some("Resistance");
        let value = if resistance && matches!(self.encoding, AnalogOutputEncoding::Float32 { .. })
        {
            state.res_value
        } else {
            state.value
        };
        json!({
            "dev": "ao",
            "circuit": self.circuit,
            "value": value,
        })
    }

    fn check_new_data(&self) -> Result<bool> {
        let mode = match self.mode_reg {
            Some(reg) => {
                let raw = self.channel.register(reg)?;
                match self.encoding {
                    // Controller boards encode V/C/R as 0/1/other.
                    AnalogOutputEncoding::Float32 { .. } => Some(match raw {
                        0 => "Voltage".to_string(),
                        1 => "Current".to_string(),
                        _ => "Resistance".to_string(),
                    }),
                    AnalogOutputEncoding::Scaled => self.mode_by_value(raw),
                }
            }
            None => None,
        };

        let (value, res_value) = match self.encoding {
            AnalogOutputEncoding::Scaled => {
                let raw = self.channel.register(self.val_reg)? as f64;
                let value = round_to(raw * SCALED_STEP, 3);
                (value, value)
            }
            AnalogOutputEncoding::Float32 { res_reg } => (
                self.read_float_pair(self.val_reg),
                self.read_float_pair(res_reg),
            ),
        };

        let mut state = lock(&self.state);
        if self.mode_reg.is_some() {
            state.mode = mode;
        }
        let changed = state.value != Some(value) || state.res_value != Some(res_value);
        state.value = Some(value);
        state.res_value = Some(res_value);
        Ok(changed)
    }

    async fn set(&self, request: SetRequest) -> Result<Value> {
        let update = match request {
            SetRequest::AnalogOutput(update) => update,
            other => return Err(kind_mismatch(self, &other)),
        };

        if let Some(mode) = update.mode {
            let def = self.modes.get(&mode).ok_or_else(|| {
                Error::Validation(format!("'{}': unsupported mode '{}'", self.circuit, mode))
            })?;
            let mode_value = def.value.ok_or_else(|| {
                Error::Validation(format!("'{}': mode '{}' is not switchable", self.circuit, mode))
            })?;
            let mode_reg = self.mode_reg.ok_or_else(|| {
                Error::Validation(format!("'{}': device cannot switch modes", self.circuit))
            })?;

            let previous = lock(&self.state).value;
            self.channel.write_register(mode_reg, mode_value).await?;
            lock(&self.state).mode = Some(mode.clone());

            // Carry the magnitude over to the new unit (1.5 V becomes
            // 1.5 mA) on the float boards.
            if matches!(self.encoding, AnalogOutputEncoding::Float32 { .. })
                && (mode == "Voltage" || mode == "Current")
            {
                if let Some(previous) = previous {
                    self.write_value(previous).await?;
                }
            }
        }

        if let Some(value) = update.value {
            self.write_value(value).await?;
        }

        Ok(self.full())
    }
}
