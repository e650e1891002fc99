//! User LED: coil-driven indicator with its state bit in a shared register.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use fieldpoint_common::Result;

use crate::util::lock;

use super::{AliasSlot, Device, DeviceKind, ModbusChannel, SetRequest, kind_mismatch, with_alias};

pub struct Led {
    circuit: String,
    channel: ModbusChannel,
    coil: u16,
    val_reg: u16,
    bitmask: u16,
    alias: AliasSlot,
    value: Mutex<Option<u8>>,
}

impl Led {
    pub fn new(
        circuit: impl Into<String>,
        channel: ModbusChannel,
        coil: u16,
        val_reg: u16,
        bitmask: u16,
    ) -> Self {
        Self {
            circuit: circuit.into(),
            channel,
            coil,
            val_reg,
            bitmask,
            alias: AliasSlot::new(),
            value: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Device for Led {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Led
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
        let snapshot = json!({
            "dev": "led",
            "circuit": self.circuit,
            "value": *lock(&self.value),
        });
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        json!({
            "dev": "led",
            "circuit": self.circuit,
            "value": *lock(&self.value),
        })
    }

    fn check_new_data(&self) -> Result<bool> {
        let raw = self.channel.register(self.val_reg)?;
        let new = u8::from(raw & self.bitmask != 0);

        let mut value = lock(&self.value);
        let changed = *value != Some(new);
        *value = Some(new);
        Ok(changed)
    }

    async fn set(&self, request: SetRequest) -> Result<Value> {
        let update = match request {
            SetRequest::Led(update) => update,
            other => return Err(kind_mismatch(self, &other)),
        };

        if let Some(value) = update.value {
            self.channel.write_coil(self.coil, value).await?;
        }

        Ok(self.full())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::RegisterCache;
    use crate::device::BinaryUpdate;
    use crate::hwdef::{RegisterBlockDef, RegisterKind};
    use crate::testing::MockBus;

    #[tokio::test]
    async fn test_led_bit_and_coil() {
        let bus = Arc::new(MockBus::new());
        let cache = Arc::new(
            RegisterCache::new(&[RegisterBlockDef {
                start_reg: 20,
                count: 1,
                frequency: 1,
                kind: RegisterKind::Holding,
            }])
            .unwrap(),
        );
        let channel = ModbusChannel::new(bus.clone(), 1, cache.clone());
        // Third LED of the bank: bit 2, coil 10.
        let led = Led::new("plc01_03", channel, 10, 20, 0x4);

        bus.set_register(RegisterKind::Holding, 20, 0x4);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        assert!(led.check_new_data().unwrap());
        assert_eq!(led.full()["value"], 1);

        led.set(SetRequest::Led(BinaryUpdate { value: Some(false) }))
            .await
            .unwrap();
        assert_eq!(bus.written_coil(10), Some(false));
    }
}
