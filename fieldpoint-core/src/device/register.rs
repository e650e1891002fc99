//! Raw register passthrough device.
//!
//! Registers expose one cached holding or input register as-is. They carry no
//! shadow state and are not eventable; reads always go to the cache.

use async_trait::async_trait;
use serde_json::{Value, json};

use fieldpoint_common::Result;

use crate::hwdef::RegisterKind;

use super::{AliasSlot, Device, DeviceKind, ModbusChannel, SetRequest, kind_mismatch, with_alias};

pub struct Register {
    circuit: String,
    channel: ModbusChannel,
    index: u16,
    reg_kind: RegisterKind,
    alias: AliasSlot,
}

impl Register {
    pub fn new(
        circuit: impl Into<String>,
        channel: ModbusChannel,
        index: u16,
        reg_kind: RegisterKind,
    ) -> Self {
        Self {
            circuit: circuit.into(),
            channel,
            index,
            reg_kind,
            alias: AliasSlot::new(),
        }
    }

    /// Cached register value; `None` until the register was scanned.
    fn value(&self) -> Option<u16> {
        self.channel.register_of(self.index, self.reg_kind).ok()
    }
}

#[async_trait]
impl Device for Register {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Register
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

    fn eventable(&self) -> bool {
        false
    }

    fn full(&self) -> Value {
        let snapshot = json!({
            "dev": "register",
            "circuit": self.circuit,
            "value": self.value(),
        });
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        json!({
            "dev": "register",
            "circuit": self.circuit,
            "value": self.value(),
        })
    }

    fn check_new_data(&self) -> Result<bool> {
        Ok(false)
    }

    async fn set(&self, request: SetRequest) -> Result<Value> {
        let update = match request {
            SetRequest::Register(update) => update,
            other => return Err(kind_mismatch(self, &other)),
        };

        if let Some(value) = update.value {
            self.channel.write_register(self.index, value).await?;
        }

        Ok(self.full())
    }
}
