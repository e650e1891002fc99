//! Analog input: float32 register pair with mode-selected decoding.
//!
//! A mode register (when declared) selects among the definition's modes;
//! every mode may carry its own decode transformation. Switching modes
//! re-derives the active transform applied to all subsequent reads.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use fieldpoint_common::{Error, Result};

use crate::hwdef::{ModeDef, RegisterKind, TransformDef};
use crate::util::lock;

use super::decode::apply_transform;
use super::{AliasSlot, Device, DeviceKind, ModbusChannel, SetRequest, kind_mismatch, with_alias};

struct Shadow {
    mode: Option<String>,
    mode_value: Option<u16>,
    transform: TransformDef,
    value: Value,
}

pub struct AnalogInput {
    circuit: String,
    channel: ModbusChannel,
    val_reg: u16,
    mode_reg: Option<u16>,
    modes: HashMap<String, ModeDef>,
    alias: AliasSlot,
    state: Mutex<Shadow>,
}

impl AnalogInput {
    pub fn new(
        circuit: impl Into<String>,
        channel: ModbusChannel,
        val_reg: u16,
        mode_reg: Option<u16>,
        modes: HashMap<String, ModeDef>,
    ) -> Self {
        // A single declared mode with no mode register is fixed from the
        // start, including its transformation.
        let (mode, transform) = if modes.len() == 1 && mode_reg.is_none() {
            let (name, def) = modes.iter().next().map(|(k, v)| (k.clone(), v)).unzip();
            (
                name,
                def.and_then(|d| d.transformation).unwrap_or_default(),
            )
        } else {
            (None, TransformDef::default())
        };

        Self {
            circuit: circuit.into(),
            channel,
            val_reg,
            mode_reg,
            modes,
            alias: AliasSlot::new(),
            state: Mutex::new(Shadow {
                mode,
                mode_value: None,
                transform,
                value: Value::Null,
            }),
        }
    }

    fn mode_by_value(&self, raw: u16) -> Option<(&String, &ModeDef)> {
        self.modes.iter().find(|(_, def)| def.value == Some(raw))
    }

    fn mode_field(&self, field: impl Fn(&ModeDef) -> Value) -> Value {
        lock(&self.state)
            .mode
            .as_ref()
            .and_then(|mode| self.modes.get(mode))
            .map(&field)
            .unwrap_or(Value::Null)
    }
}

#[async_trait]
impl Device for AnalogInput {
    fn kind(&self) -> DeviceKind {
        DeviceKind::AnalogInput
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
        let snapshot = json!({
            "dev": "ai",
            "circuit": self.circuit,
            "value": state.value,
            "mode": state.mode,
            "modes": self.modes,
        });
        drop(state);

        let mut snapshot = snapshot;
        if let Some(map) = snapshot.as_object_mut() {
            map.insert(
                "unit".to_string(),
                self.mode_field(|def| Value::from(def.unit.clone())),
            );
            map.insert(
                "range".to_string(),
                self.mode_field(|def| {
                    def.range
                        .as_ref()
                        .map(|r| Value::from(r.clone()))
                        .unwrap_or(Value::Null)
                }),
            );
        }
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        json!({
            "dev": "ai",
            "circuit": self.circuit,
            "value": lock(&self.state).value,
        })
    }

    fn check_new_data(&self) -> Result<bool> {
        let mut changed = false;

        if let Some(mode_reg) = self.mode_reg {
            let raw = self.channel.register(mode_reg)?;
            let mut state = lock(&self.state);
            if state.mode_value != Some(raw) {
                state.mode_value = Some(raw);
                changed = true;
                match self.mode_by_value(raw) {
                    Some((name, def)) => {
                        state.mode = Some(name.clone());
                        state.transform = def.transformation.unwrap_or_default();
                        debug!(
                            circuit = %self.circuit,
                            mode = %name,
                            "Analog input mode changed"
                        );
                    }
                    None => {
                        state.mode = None;
                        state.transform = TransformDef::default();
                    }
                }
            }
        }

        let transform = lock(&self.state).transform;
        let value = match self.channel.register_pair(self.val_reg, RegisterKind::Holding) {
            Ok(regs) => apply_transform(&transform, regs),
            Err(Error::MissingRegister { .. }) => Value::Null,
            Err(e) => return Err(e),
        };

        let mut state = lock(&self.state);
        let value_changed = state.value != value;
        state.value = value;
        Ok(changed || value_changed)
    }

    async fn set(&self, request: SetRequest) -> Result<Value> {
        let update = match request {
            SetRequest::AnalogInput(update) => update,
            other => return Err(kind_mismatch(self, &other)),
        };

        if let Some(mode) = update.mode {
            let def = self.modes.get(&mode).ok_or_else(|| {
                Error::Validation(format!("'{}': unsupported mode '{}'", self.circuit, mode))
            })?;
            let value = def.value.ok_or_else(|| {
                Error::Validation(format!("'{}': mode '{}' is not switchable", self.circuit, mode))
            })?;
            let mode_reg = self.mode_reg.ok_or_else(|| {
                Error::Validation(format!("'{}': device cannot switch modes", self.circuit))
            })?;
            self.channel.write_register(mode_reg, value).await?;
        }

        Ok(self.full())
    }
}
