//! Hardware watchdog.
//!
//! The value register's two low bits encode the watchdog state: bit 0 is the
//! armed flag, bit 1 remembers that the watchdog reset the board. Reset and
//! nonvolatile-save actions pulse dedicated coils.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use fieldpoint_common::Result;

use crate::util::lock;

use super::{AliasSlot, Device, DeviceKind, ModbusChannel, SetRequest, kind_mismatch, with_alias};

#[derive(Default)]
struct Shadow {
    /// Low two bits of the value register.
    value: Option<u16>,
    timeout: Option<u16>,
    was_reset: Option<u8>,
    /// Local nv-save flag; the coil is only pulsed when it actually flips.
    nv_save: u8,
}

pub struct Watchdog {
    circuit: String,
    channel: ModbusChannel,
    val_reg: u16,
    timeout_reg: u16,
    nv_save_coil: Option<u16>,
    reset_coil: Option<u16>,
    alias: AliasSlot,
    state: Mutex<Shadow>,
}

impl Watchdog {
    pub fn new(
        circuit: impl Into<String>,
        channel: ModbusChannel,
        val_reg: u16,
        timeout_reg: u16,
        nv_save_coil: Option<u16>,
        reset_coil: Option<u16>,
    ) -> Self {
        Self {
            circuit: circuit.into(),
            channel,
            val_reg,
            timeout_reg,
            nv_save_coil,
            reset_coil,
            alias: AliasSlot::new(),
            state: Mutex::new(Shadow::default()),
        }
    }
}

#[async_trait]
impl Device for Watchdog {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Watchdog
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
            "dev": "wd",
            "circuit": self.circuit,
            "value": state.value,
            "timeout": state.timeout,
            "was_wd_reset": state.was_reset,
            "nv_save": state.nv_save,
        });
        drop(state);
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        json!({
            "dev": "wd",
            "circuit": self.circuit,
            "value": lock(&self.state).value,
        })
    }

    fn check_new_data(&self) -> Result<bool> {
        let raw = self.channel.register(self.val_reg)?;
        let timeout = self.channel.register(self.timeout_reg)?;

        let mut state = lock(&self.state);
        let new = raw & 0x03;
        let changed = state.value != Some(new);
        state.value = Some(new);
        state.timeout = Some(timeout);
        state.was_reset = Some(u8::from(raw & 0b10 != 0));
        Ok(changed)
    }

    async fn set(&self, request: SetRequest) -> Result<Value> {
        let update = match request {
            SetRequest::Watchdog(update) => update,
            other => return Err(kind_mismatch(self, &other)),
        };

        if let Some(value) = update.value {
            self.channel
                .write_register(self.val_reg, u16::from(value))
                .await?;
        }

        if let Some(timeout) = update.timeout {
            let timeout = timeout.min(u16::MAX as u32) as u16;
            self.channel.write_register(self.timeout_reg, timeout).await?;
        }

        if let (Some(coil), Some(nv_save)) = (self.nv_save_coil, update.nv_save) {
            let flag = u8::from(nv_save);
            let flipped = lock(&self.state).nv_save != flag;
            // Pulse only on an actual flag change to avoid flash wear.
            if flipped {
                lock(&self.state).nv_save = flag;
                self.channel.write_coil(coil, true).await?;
            }
        }

        if let (Some(coil), Some(true)) = (self.reset_coil, update.reset) {
            lock(&self.state).nv_save = 0;
            self.channel.write_coil(coil, true).await?;
            info!(circuit = %self.circuit, "Performed watchdog reset");
        }

        Ok(self.full())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::RegisterCache;
    use crate::device::WatchdogUpdate;
    use crate::hwdef::{RegisterBlockDef, RegisterKind};
    use crate::testing::MockBus;

    fn setup() -> (Arc<MockBus>, Arc<RegisterCache>, Watchdog) {
        let bus = Arc::new(MockBus::new());
        let cache = Arc::new(
            RegisterCache::new(&[RegisterBlockDef {
                start_reg: 0,
                count: 2,
                frequency: 1,
                kind: RegisterKind::Holding,
            }])
            .unwrap(),
        );
        let channel = ModbusChannel::new(bus.clone(), 1, cache.clone());
        let wd = Watchdog::new("plc01_01", channel, 0, 1, Some(6), Some(7));
        (bus, cache, wd)
    }

    #[tokio::test]
    async fn test_status_bits() {
        let (bus, cache, wd) = setup();

        // Armed + was-reset flags, timeout of 5000 ms.
        bus.set_registers(RegisterKind::Holding, 0, &[0b11, 5000]);
        cache.scan(bus.as_ref(), 1).await.unwrap();

        assert!(wd.check_new_data().unwrap());
        let full = wd.full();
        assert_eq!(full["value"], 3);
        assert_eq!(full["timeout"], 5000);
        assert_eq!(full["was_wd_reset"], 1);
        assert!(!wd.check_new_data().unwrap());
    }

    #[tokio::test]
    async fn test_timeout_clamped_to_u16() {
        let (bus, _cache, wd) = setup();

        wd.set(SetRequest::Watchdog(WatchdogUpdate {
            timeout: Some(100_000),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_register(1), Some(u16::MAX));
    }

    #[tokio::test]
    async fn test_nv_save_pulses_only_on_change() {
        let (bus, _cache, wd) = setup();

        wd.set(SetRequest::Watchdog(WatchdogUpdate {
            nv_save: Some(true),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.writes().len(), 1);
        assert_eq!(bus.written_coil(6), Some(true));

        // Same flag again: no further coil write.
        wd.set(SetRequest::Watchdog(WatchdogUpdate {
            nv_save: Some(true),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.writes().len(), 1);

        // Clearing the flag pulses once more.
        wd.set(SetRequest::Watchdog(WatchdogUpdate {
            nv_save: Some(false),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_pulses_coil() {
        let (bus, _cache, wd) = setup();

        wd.set(SetRequest::Watchdog(WatchdogUpdate {
            reset: Some(true),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_coil(7), Some(true));
    }
}
