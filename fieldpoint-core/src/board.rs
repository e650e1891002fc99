//! Board feature parser.
//!
//! Turns one slave's hardware definition into live device objects: the cache
//! is initialized from the declared register blocks, then every feature
//! yields `count` device instances named `{slave_circuit}_{index:02}`
//! (1-based), wired to the registers the definition declares and registered
//! into the registry. Unknown feature types are logged and skipped; anything
//! else malformed is a configuration error fatal to this board only.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{info, warn};

use fieldpoint_common::{Error, Result};

use crate::device::digital_input::DirectSwitchRegs;
use crate::device::digital_output::PwmWiring;
use crate::device::{
    AnalogInput, AnalogOutput, AnalogOutputEncoding, DataPoint, Device, DigitalInput,
    DigitalOutput, Led, ModbusChannel, Register, Relay, Watchdog,
};
use crate::hwdef::{
    AnalogInputDef, AnalogOutputDef, DataPointDef, DigitalInputDef, DigitalOutputDef,
    HardwareDefinition, LedDef, RegisterFeatureDef, RegisterKind, RelayDef, WatchdogDef,
    feature_count, feature_type,
};
use crate::registry::DeviceRegistry;
use crate::slave::Slave;

/// Parse a slave's definition, creating and registering its devices.
pub async fn parse_board(
    slave: &Arc<Slave>,
    definition: &HardwareDefinition,
    registry: &DeviceRegistry,
) -> Result<()> {
    if definition.register_blocks.is_empty() {
        return Err(Error::Config(format!(
            "Definition for model '{}' declares no register blocks",
            slave.model()
        )));
    }

    info!(
        circuit = %slave.circuit(),
        unit = slave.unit_id(),
        model = %slave.model(),
        "Initial reading of the Modbus board"
    );

    let cache = slave.init_cache(&definition.register_blocks).await?;
    let channel = ModbusChannel::new(slave.bus(), slave.unit_id(), cache);

    let board = Board {
        slave,
        registry,
        channel,
    };
    for feature in &definition.features {
        board.parse_feature(feature)?;
    }
    Ok(())
}

struct Board<'a> {
    slave: &'a Arc<Slave>,
    registry: &'a DeviceRegistry,
    channel: ModbusChannel,
}

impl Board<'_> {
    fn parse_feature(&self, feature: &Value) -> Result<()> {
        let Some(kind) = feature_type(feature) else {
            warn!(circuit = %self.slave.circuit(), "Feature without a type, skipping");
            return Ok(());
        };
        let count = feature_count(feature);

        match kind {
            "DI" => self.parse_digital_inputs(count, self.decode::<DigitalInputDef>(feature)?),
            "RO" => self.parse_relays(count, self.decode::<RelayDef>(feature)?),
            "DO" => self.parse_digital_outputs(count, self.decode::<DigitalOutputDef>(feature)?),
            "LED" => self.parse_leds(count, self.decode::<LedDef>(feature)?),
            "WD" => self.parse_watchdogs(count, self.decode::<WatchdogDef>(feature)?),
            "AI" => self.parse_analog_inputs(count, self.decode::<AnalogInputDef>(feature)?),
            "AO" => self.parse_analog_outputs(count, self.decode::<AnalogOutputDef>(feature)?, false),
            "BAO" => self.parse_analog_outputs(count, self.decode::<AnalogOutputDef>(feature)?, true),
            "REGISTER" => self.parse_registers(count, self.decode::<RegisterFeatureDef>(feature)?),
            "DATA_POINT" => self.parse_data_points(count, self.decode::<DataPointDef>(feature)?),
            other => {
                warn!(
                    circuit = %self.slave.circuit(),
                    feature = %other,
                    "Unknown feature type, skipping"
                );
                Ok(())
            }
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, feature: &Value) -> Result<T> {
        serde_json::from_value(feature.clone()).map_err(|e| {
            Error::Config(format!(
                "'{}': broken feature definition: {}",
                self.slave.circuit(),
                e
            ))
        })
    }

    fn circuit_for(&self, index: u16) -> String {
        format!("{}_{:02}", self.slave.circuit(), index)
    }

    fn add(&self, device: Arc<dyn Device>) -> Result<()> {
        if device.eventable() {
            self.slave.add_eventable(device.clone());
        }
        self.registry.register(device)
    }

    fn parse_digital_inputs(&self, count: u16, def: DigitalInputDef) -> Result<()> {
        let direct_complete = def.ds_modes.is_some()
            && def.direct_reg.is_some()
            && def.polar_reg.is_some()
            && def.toggle_reg.is_some();

        for i in 0..count {
            let direct = if direct_complete {
                Some(DirectSwitchRegs {
                    mode_reg: def.direct_reg.unwrap_or_default(),
                    polarity_reg: def.polar_reg.unwrap_or_default(),
                    toggle_reg: def.toggle_reg.unwrap_or_default(),
                    ds_modes: def.ds_modes.clone().unwrap_or_default(),
                })
            } else {
                None
            };

            let device = Arc::new(DigitalInput::new(
                self.circuit_for(i + 1 + def.start_index),
                self.channel.clone(),
                def.val_reg,
                1 << (i % 16),
                def.counter_reg.map(|reg| reg + 2 * i),
                def.debounce_reg.map(|reg| reg + i),
                def.modes.clone(),
                direct,
            ));
            self.add(device)?;
        }
        Ok(())
    }

    fn parse_relays(&self, count: u16, def: RelayDef) -> Result<()> {
        for i in 0..count {
            let device = Arc::new(Relay::new(
                self.circuit_for(i + 1),
                self.channel.clone(),
                def.val_coil + i,
                def.val_reg,
                1 << (i % 16),
            ));
            self.add(device)?;
        }
        Ok(())
    }

    fn parse_digital_outputs(&self, count: u16, def: DigitalOutputDef) -> Result<()> {
        // Hard PWM takes precedence when both register sets are declared.
        let wiring_for = |i: u16| -> Result<PwmWiring> {
            if let (Some(pwm_reg), Some(cycle), Some(prescale)) =
                (def.pwm_reg, def.pwm_c_reg, def.pwm_ps_reg)
            {
                Ok(PwmWiring::Hard {
                    duty_reg: pwm_reg + i,
                    cycle_reg: cycle,
                    prescale_reg: prescale,
                })
            } else if let (Some(pwm_reg), Some(preset), Some(prescaler)) =
                (def.pwm_reg, def.pwm_preset_reg, def.pwm_cpres_reg)
            {
                Ok(PwmWiring::Soft {
                    duty_reg: pwm_reg + i,
                    preset_reg: preset,
                    prescaler_reg: prescaler,
                })
            } else {
                Err(Error::Config(format!(
                    "'{}': DO feature declares no usable PWM register set",
                    self.slave.circuit()
                )))
            }
        };

        let mut outputs = Vec::with_capacity(count as usize);
        for i in 0..count {
            outputs.push(Arc::new(DigitalOutput::new(
                self.circuit_for(i + 1),
                self.channel.clone(),
                def.val_coil + i,
                def.val_reg,
                1 << (i % 16),
                def.modes.clone(),
                wiring_for(i)?,
            )));
        }

        // All outputs of the bank share one PWM clock.
        for output in &outputs {
            let siblings: Vec<Weak<DigitalOutput>> = outputs
                .iter()
                .filter(|other| !Arc::ptr_eq(other, output))
                .map(Arc::downgrade)
                .collect();
            output.set_siblings(siblings);
        }

        for output in outputs {
            self.add(output)?;
        }
        Ok(())
    }

    fn parse_leds(&self, count: u16, def: LedDef) -> Result<()> {
        for i in 0..count {
            let device = Arc::new(Led::new(
                self.circuit_for(i + 1),
                self.channel.clone(),
                def.val_coil + i,
                def.val_reg,
                1 << (i % 16),
            ));
            self.add(device)?;
        }
        Ok(())
    }

    fn parse_watchdogs(&self, count: u16, def: WatchdogDef) -> Result<()> {
        for i in 0..count {
            let device = Arc::new(Watchdog::new(
                self.circuit_for(i + 1),
                self.channel.clone(),
                def.val_reg + i,
                def.timeout_reg + i,
                def.nv_sav_coil,
                def.reset_coil,
            ));
            self.add(device)?;
        }
        Ok(())
    }

    fn parse_analog_inputs(&self, count: u16, def: AnalogInputDef) -> Result<()> {
        for i in 0..count {
            let device = Arc::new(AnalogInput::new(
                self.circuit_for(i + 1),
                self.channel.clone(),
                def.val_reg + 2 * i,
                def.mode_reg.map(|reg| reg + i),
                def.modes.clone(),
            ));
            self.add(device)?;
        }
        Ok(())
    }

    fn parse_analog_outputs(&self, count: u16, def: AnalogOutputDef, brain: bool) -> Result<()> {
        let encoding = if brain {
            let res_reg = def.res_val_reg.ok_or_else(|| {
                Error::Config(format!(
                    "'{}': BAO feature without res_val_reg",
                    self.slave.circuit()
                ))
            })?;
            AnalogOutputEncoding::Float32 { res_reg }
        } else {
            AnalogOutputEncoding::Scaled
        };

        for i in 0..count {
            let device = Arc::new(AnalogOutput::new(
                self.circuit_for(i + 1),
                self.channel.clone(),
                def.val_reg + i,
                def.mode_reg,
                def.modes.clone(),
                encoding,
            ));
            self.add(device)?;
        }
        Ok(())
    }

    fn parse_registers(&self, count: u16, def: RegisterFeatureDef) -> Result<()> {
        for i in 0..count {
            let address = def.start_reg + i;
            let circuit = match def.reg_type {
                RegisterKind::Input => format!("{}_{}_inp", self.slave.circuit(), address),
                RegisterKind::Holding => format!("{}_{}", self.slave.circuit(), address),
            };
            let device = Arc::new(Register::new(
                circuit,
                self.channel.clone(),
                address,
                def.reg_type,
            ));
            self.add(device)?;
        }
        Ok(())
    }

    fn parse_data_points(&self, count: u16, def: DataPointDef) -> Result<()> {
        for i in 0..count {
            let device = Arc::new(DataPoint::new(
                format!("{}_{}", self.slave.circuit(), def.value_reg + i),
                self.channel.clone(),
                &def,
                def.value_reg + i,
                1 << (i % 16),
            ));
            self.add(device)?;
        }
        Ok(())
    }
}
