//! Digital input: status bit plus optional counter, debounce and
//! DirectSwitch registers.
//!
//! DirectSwitch couples an input directly to an output on the slave itself;
//! the mode, polarity and toggle registers each carry one bit per channel, so
//! mode changes are read-modify-write on the live registers, not on the
//! cache.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use fieldpoint_common::{Error, Result};

use crate::hwdef::RegisterKind;
use crate::util::lock;

use super::{AliasSlot, Device, DeviceKind, ModbusChannel, SetRequest, kind_mismatch, with_alias};

/// DirectSwitch register block shared by all inputs of a bank.
pub struct DirectSwitchRegs {
    pub mode_reg: u16,
    pub polarity_reg: u16,
    pub toggle_reg: u16,
    pub ds_modes: Vec<String>,
}

struct Shadow {
    value: Option<u8>,
    counter: Option<u32>,
    debounce: Option<u16>,
    mode: String,
    ds_mode: String,
    counter_mode: String,
}

impl Default for Shadow {
    fn default() -> Self {
        Self {
            value: None,
            counter: None,
            debounce: None,
            mode: "Simple".to_string(),
            ds_mode: "Simple".to_string(),
            counter_mode: "Enabled".to_string(),
        }
    }
}

pub struct DigitalInput {
    circuit: String,
    channel: ModbusChannel,
    val_reg: u16,
    bitmask: u16,
    counter_reg: Option<u16>,
    debounce_reg: Option<u16>,
    direct: Option<DirectSwitchRegs>,
    modes: Vec<String>,
    counter_modes: Vec<String>,
    alias: AliasSlot,
    state: Mutex<Shadow>,
}

impl DigitalInput {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        circuit: impl Into<String>,
        channel: ModbusChannel,
        val_reg: u16,
        bitmask: u16,
        counter_reg: Option<u16>,
        debounce_reg: Option<u16>,
        modes: Vec<String>,
        direct: Option<DirectSwitchRegs>,
    ) -> Self {
        Self {
            circuit: circuit.into(),
            channel,
            val_reg,
            bitmask,
            counter_reg,
            debounce_reg,
            direct,
            modes,
            counter_modes: vec!["Enabled".to_string(), "Disabled".to_string()],
            alias: AliasSlot::new(),
            state: Mutex::new(Shadow::default()),
        }
    }

    fn read_counter(&self) -> Result<Option<u32>> {
        let Some(reg) = self.counter_reg else {
            return Ok(None);
        };
        let pair = self.channel.register_pair(reg, RegisterKind::Holding)?;
        Ok(Some(pair[0] as u32 | ((pair[1] as u32) << 16)))
    }

    fn supports_direct_switch(&self) -> bool {
        self.direct.is_some() && self.modes.iter().any(|m| m == "DirectSwitch")
    }
}

#[async_trait]
impl Device for DigitalInput {
    fn kind(&self) -> DeviceKind {
        DeviceKind::DigitalInput
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
        let counter_enabled = state.counter_mode == "Enabled";
        let mut snapshot = json!({
            "dev": "di",
            "circuit": self.circuit,
            "value": state.value,
            "debounce": state.debounce,
            "counter_modes": self.counter_modes,
            "counter_mode": state.counter_mode,
            "counter": if counter_enabled { state.counter } else { Some(0) },
            "mode": state.mode,
            "modes": self.modes,
        });
        if state.mode == "DirectSwitch" {
            if let (Some(map), Some(direct)) = (snapshot.as_object_mut(), self.direct.as_ref()) {
                map.insert("ds_mode".to_string(), Value::from(state.ds_mode.clone()));
                map.insert("ds_modes".to_string(), Value::from(direct.ds_modes.clone()));
            }
        }
        drop(state);
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        let state = lock(&self.state);
        if state.counter_mode == "Enabled" {
            json!({
                "dev": "di",
                "circuit": self.circuit,
                "value": state.value,
                "counter": state.counter,
            })
        } else {
            json!({
                "dev": "di",
                "circuit": self.circuit,
                "value": state.value,
            })
        }
    }

    fn check_new_data(&self) -> Result<bool> {
        let mut mode = None;
        let mut ds_mode = None;
        if self.supports_direct_switch() {
            let direct = self.direct.as_ref().ok_or_else(|| {
                Error::Config(format!("'{}': DirectSwitch registers missing", self.circuit))
            })?;
            let current = self.channel.register(direct.mode_reg)?;
            if current & self.bitmask != 0 {
                mode = Some("DirectSwitch".to_string());
                let polarity = self.channel.register(direct.polarity_reg)?;
                let toggle = self.channel.register(direct.toggle_reg)?;
                if polarity & self.bitmask != 0 {
                    ds_mode = Some("Inverted".to_string());
                } else if toggle & self.bitmask != 0 {
                    ds_mode = Some("Toggle".to_string());
                }
            } else {
                mode = Some("Simple".to_string());
            }
        }

        let value = u8::from(self.channel.register(self.val_reg)? & self.bitmask != 0);
        let counter = self.read_counter()?;
        let debounce = match self.debounce_reg {
            Some(reg) => Some(self.channel.register(reg)?),
            None => None,
        };

        let mut state = lock(&self.state);
        if let Some(mode) = mode {
            state.mode = mode;
        }
        if let Some(ds_mode) = ds_mode {
            state.ds_mode = ds_mode;
        }
        let changed = state.value != Some(value) || state.counter != counter;
        state.value = Some(value);
        state.counter = counter;
        state.debounce = debounce;
        Ok(changed)
    }

    async fn set(&self, request: SetRequest) -> Result<Value> {
        let update = match request {
            SetRequest::DigitalInput(update) => update,
            other => return Err(kind_mismatch(self, &other)),
        };

        if let Some(mode) = update.mode {
            let current_mode = lock(&self.state).mode.clone();
            if mode != current_mode {
                if !self.modes.iter().any(|m| *m == mode) {
                    return Err(Error::Validation(format!(
                        "'{}': unsupported mode '{}'",
                        self.circuit, mode
                    )));
                }
                let direct = self.direct.as_ref().ok_or_else(|| {
                    Error::Validation(format!(
                        "'{}': no DirectSwitch registers declared",
                        self.circuit
                    ))
                })?;

                // The mode register is shared by the whole bank; fetch the
                // live value before flipping this channel's bit.
                let current =
                    self.channel
                        .read_through(1, direct.mode_reg, RegisterKind::Holding)
                        .await?[0];
                let new = if mode == "DirectSwitch" {
                    current | self.bitmask
                } else {
                    current & !self.bitmask
                };
                self.channel.write_register(direct.mode_reg, new).await?;
                lock(&self.state).mode = mode;
            }
        }

        if let Some(ds_mode) = update.ds_mode {
            let in_direct_switch = lock(&self.state).mode == "DirectSwitch";
            if in_direct_switch {
                let direct = self.direct.as_ref().ok_or_else(|| {
                    Error::Validation(format!(
                        "'{}': no DirectSwitch registers declared",
                        self.circuit
                    ))
                })?;
                if !direct.ds_modes.iter().any(|m| *m == ds_mode) {
                    return Err(Error::Validation(format!(
                        "'{}': unsupported ds_mode '{}'",
                        self.circuit, ds_mode
                    )));
                }

                let mut polarity =
                    self.channel
                        .read_through(1, direct.polarity_reg, RegisterKind::Holding)
                        .await?[0];
                let mut toggle =
                    self.channel
                        .read_through(1, direct.toggle_reg, RegisterKind::Holding)
                        .await?[0];
                match ds_mode.as_str() {
                    "Inverted" => {
                        polarity |= self.bitmask;
                        toggle &= !self.bitmask;
                    }
                    "Toggle" => {
                        polarity &= !self.bitmask;
                        toggle |= self.bitmask;
                    }
                    _ => {
                        polarity &= !self.bitmask;
                        toggle &= !self.bitmask;
                    }
                }
                self.channel
                    .write_register(direct.polarity_reg, polarity)
                    .await?;
                self.channel.write_register(direct.toggle_reg, toggle).await?;
                lock(&self.state).ds_mode = ds_mode;
            }
        }

        if let Some(counter_mode) = update.counter_mode {
            if self.counter_modes.iter().any(|m| *m == counter_mode) {
                lock(&self.state).counter_mode = counter_mode;
            }
        }

        if let (Some(debounce), Some(reg)) = (update.debounce, self.debounce_reg) {
            self.channel.write_register(reg, debounce).await?;
        }

        if let (Some(counter), Some(reg)) = (update.counter, self.counter_reg) {
            self.channel
                .write_registers(reg, &[(counter & 0xFFFF) as u16, (counter >> 16) as u16])
                .await?;
        }

        Ok(self.full())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::RegisterCache;
    use crate::device::DigitalInputUpdate;
    use crate::hwdef::RegisterBlockDef;
    use crate::testing::MockBus;

    fn setup(direct: bool) -> (Arc<MockBus>, Arc<RegisterCache>, DigitalInput) {
        let bus = Arc::new(MockBus::new());
        let cache = Arc::new(
            RegisterCache::new(&[RegisterBlockDef {
                start_reg: 0,
                count: 16,
                frequency: 1,
                kind: RegisterKind::Holding,
            }])
            .unwrap(),
        );
        let channel = ModbusChannel::new(bus.clone(), 1, cache.clone());

        let mut modes = vec!["Simple".to_string()];
        let mut ds = None;
        if direct {
            modes.push("DirectSwitch".to_string());
            ds = Some(DirectSwitchRegs {
                mode_reg: 10,
                polarity_reg: 11,
                toggle_reg: 12,
                ds_modes: vec![
                    "Simple".to_string(),
                    "Inverted".to_string(),
                    "Toggle".to_string(),
                ],
            });
        }

        let di = DigitalInput::new(
            "plc01_01",
            channel,
            0,
            0x1,
            Some(2),
            Some(4),
            modes,
            ds,
        );
        (bus, cache, di)
    }

    #[tokio::test]
    async fn test_transitions_report_changes_only() {
        let (bus, cache, di) = setup(false);

        // Scans returning 1, 0, 1 must yield exactly two change reports
        // after the initial derivation.
        bus.set_register(RegisterKind::Holding, 0, 1);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        assert!(di.check_new_data().unwrap());
        assert_eq!(di.simple()["value"], 1);
        assert!(!di.check_new_data().unwrap());

        bus.set_register(RegisterKind::Holding, 0, 0);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        assert!(di.check_new_data().unwrap());
        assert_eq!(di.simple()["value"], 0);

        bus.set_register(RegisterKind::Holding, 0, 1);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        assert!(di.check_new_data().unwrap());
        assert_eq!(di.simple()["value"], 1);
    }

    #[tokio::test]
    async fn test_counter_change_is_a_change() {
        let (bus, cache, di) = setup(false);

        bus.set_register(RegisterKind::Holding, 0, 1);
        bus.set_registers(RegisterKind::Holding, 2, &[5, 0]);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        assert!(di.check_new_data().unwrap());

        // Counter low word wraps into the high word.
        bus.set_registers(RegisterKind::Holding, 2, &[6, 1]);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        assert!(di.check_new_data().unwrap());
        assert_eq!(di.full()["counter"], 65536 + 6);
    }

    #[tokio::test]
    async fn test_direct_switch_mode_write() {
        let (bus, cache, di) = setup(true);

        bus.set_register(RegisterKind::Holding, 10, 0x2);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        di.check_new_data().unwrap();

        di.set(SetRequest::DigitalInput(DigitalInputUpdate {
            mode: Some("DirectSwitch".to_string()),
            ..Default::default()
        }))
        .await
        .unwrap();
        // Existing bank bits survive the read-modify-write.
        assert_eq!(bus.written_register(10), Some(0x3));

        di.set(SetRequest::DigitalInput(DigitalInputUpdate {
            ds_mode: Some("Toggle".to_string()),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_register(11), Some(0x0));
        assert_eq!(bus.written_register(12), Some(0x1));
    }

    #[tokio::test]
    async fn test_counter_write_splits_words() {
        let (bus, _cache, di) = setup(false);

        di.set(SetRequest::DigitalInput(DigitalInputUpdate {
            counter: Some(0x0001_0006),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_register(2), Some(6));
        assert_eq!(bus.written_register(3), Some(1));
    }

    #[tokio::test]
    async fn test_unsupported_mode_rejected() {
        let (_bus, _cache, di) = setup(false);

        let result = di
            .set(SetRequest::DigitalInput(DigitalInputUpdate {
                mode: Some("DirectSwitch".to_string()),
                ..Default::default()
            }))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
