//! Relay output: one coil, status read back from a shared register bit.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use fieldpoint_common::Result;

use crate::util::lock;

use super::{AliasSlot, Device, DeviceKind, ModbusChannel, SetRequest, kind_mismatch, with_alias};

pub struct Relay {
    circuit: String,
    channel: ModbusChannel,
    coil: u16,
    val_reg: u16,
    bitmask: u16,
    alias: AliasSlot,
    /// Last derived on/off state; `None` until the first scan.
    value: Mutex<Option<u8>>,
}

impl Relay {
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
impl Device for Relay {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Relay
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
            "dev": "ro",
            "circuit": self.circuit,
            "value": *lock(&self.value),
        });
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        json!({
            "dev": "ro",
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
            SetRequest::Relay(update) => update,
            other => return Err(kind_mismatch(self, &other)),
        };

        if let Some(value) = update.value {
            self.channel.write_coil(self.coil, value).await?;
        }

        Ok(self.full())
    }
}
