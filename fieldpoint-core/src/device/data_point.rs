//! Derived data point: a scaled register value with an optional validity bit.
//!
//! Data points are read-only. A cache miss renders the value `null` instead
//! of failing the snapshot, since data points often sit in slow-polled blocks
//! that are not populated yet.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use fieldpoint_common::{Error, Result};

use crate::hwdef::{DataPointDef, DataPointType, RegisterKind, Endianness};
use crate::util::lock;

use super::decode::{f32_from_registers, json_number};
use super::{AliasSlot, Device, DeviceKind, ModbusChannel, SetRequest, kind_mismatch, with_alias};

#[derive(Default)]
struct Shadow {
    value: Value,
    valid: Option<bool>,
}

pub struct DataPoint {
    circuit: String,
    channel: ModbusChannel,
    value_reg: u16,
    reg_kind: RegisterKind,
    datatype: DataPointType,
    offset: f64,
    factor: f64,
    unit: Option<String>,
    name: Option<String>,
    valid_mask_reg: Option<u16>,
    valid_mask: u16,
    alias: AliasSlot,
    state: Mutex<Shadow>,
}

impl DataPoint {
    pub fn new(
        circuit: impl Into<String>,
        channel: ModbusChannel,
        def: &DataPointDef,
        value_reg: u16,
        valid_mask: u16,
    ) -> Self {
        Self {
            circuit: circuit.into(),
            channel,
            value_reg,
            reg_kind: def.reg_type,
            datatype: def.datatype,
            offset: def.offset,
            factor: def.factor,
            unit: def.unit.clone(),
            name: def.name.clone(),
            valid_mask_reg: def.valid_mask_reg,
            valid_mask,
            alias: AliasSlot::new(),
            state: Mutex::new(Shadow::default()),
        }
    }

    fn read_value(&self) -> Value {
        let raw = match self.datatype {
            DataPointType::Signed16 => {
                match self.channel.register_of(self.value_reg, self.reg_kind) {
                    Ok(raw) => raw as f64,
                    Err(_) => return Value::Null,
                }
            }
            DataPointType::Float32 => {
                let regs = match self.channel.register_pair(self.value_reg, self.reg_kind) {
                    Ok(regs) => regs,
                    Err(_) => return Value::Null,
                };
                let value = f32_from_registers(regs, Endianness::Big, Endianness::Big);
                if value.is_nan() {
                    return Value::String("NaN".to_string());
                }
                value as f64
            }
        };

        if self.factor == 1.0 && self.offset == 0.0 {
            // Raw passthrough keeps integers integral.
            match self.datatype {
                DataPointType::Signed16 => Value::from(raw as u16),
                DataPointType::Float32 => json_number(raw),
            }
        } else {
            json_number(raw * self.factor + self.offset)
        }
    }

    fn read_valid(&self) -> bool {
        let Some(reg) = self.valid_mask_reg else {
            return false;
        };
        match self.channel.register_of(reg, self.reg_kind) {
            Ok(raw) => raw & self.valid_mask != 0,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Device for DataPoint {
    fn kind(&self) -> DeviceKind {
        DeviceKind::DataPoint
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
        let mut snapshot = json!({
            "dev": "data_point",
            "circuit": self.circuit,
            "value": state.value,
        });
        drop(state);

        if let Some(map) = snapshot.as_object_mut() {
            if let Some(name) = &self.name {
                map.insert("name".to_string(), Value::from(name.clone()));
            }
            if self.valid_mask_reg.is_some() {
                map.insert("valid".to_string(), Value::from(lock(&self.state).valid));
            }
            if let Some(unit) = &self.unit {
                map.insert("unit".to_string(), Value::from(unit.clone()));
            }
        }
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        json!({
            "dev": "data_point",
            "circuit": self.circuit,
            "value": self.read_value(),
        })
    }

    fn check_new_data(&self) -> Result<bool> {
        let value = self.read_value();
        let valid = self.read_valid();

        let mut state = lock(&self.state);
        let changed = state.value != value || state.valid != Some(valid);
        state.value = value;
        state.valid = Some(valid);
        Ok(changed)
    }

    async fn set(&self, request: SetRequest) -> Result<Value> {
        if !matches!(request, SetRequest::DataPoint) {
            return Err(kind_mismatch(self, &request));
        }
        Err(Error::Validation(format!(
            "Data point '{}' is read-only",
            self.circuit
        )))
    }
}
