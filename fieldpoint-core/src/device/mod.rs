//! The device family: one object per physical capability of a slave.
//!
//! Devices are created once by the board parser, live for the process
//! lifetime and share a uniform contract: [`Device::full`] and
//! [`Device::simple`] snapshots, scan-driven [`Device::check_new_data`]
//! change detection against shadow state, and validated write-through
//! [`Device::set`] taking the typed update record of the device's kind.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use fieldpoint_common::{Error, Result};

use crate::bus::BusHandle;
use crate::cache::RegisterCache;
use crate::hwdef::RegisterKind;
use crate::util::{lock, read_lock, write_lock};

pub mod decode;

pub mod analog_input;
pub mod analog_output;
pub mod data_point;
pub mod digital_input;
pub mod digital_output;
pub mod led;
pub mod register;
pub mod relay;
pub mod watchdog;

pub use analog_input::AnalogInput;
pub use analog_output::{AnalogOutput, AnalogOutputEncoding};
pub use data_point::DataPoint;
pub use digital_input::DigitalInput;
pub use digital_output::DigitalOutput;
pub use led::Led;
pub use register::Register;
pub use relay::Relay;
pub use watchdog::Watchdog;

/// Closed set of device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    DigitalInput,
    Relay,
    DigitalOutput,
    AnalogInput,
    AnalogOutput,
    Led,
    Watchdog,
    Register,
    DataPoint,
}

impl DeviceKind {
    /// Canonical short name, as used in snapshots and the alias file.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::DigitalInput => "di",
            DeviceKind::Relay => "ro",
            DeviceKind::DigitalOutput => "do",
            DeviceKind::AnalogInput => "ai",
            DeviceKind::AnalogOutput => "ao",
            DeviceKind::Led => "led",
            DeviceKind::Watchdog => "watchdog",
            DeviceKind::Register => "register",
            DeviceKind::DataPoint => "data_point",
        }
    }

    /// Resolve a kind from its canonical name or an accepted alternative.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "di" | "digitalinput" | "input" => Some(DeviceKind::DigitalInput),
            "ro" | "relay" => Some(DeviceKind::Relay),
            "do" | "digitaloutput" | "output" => Some(DeviceKind::DigitalOutput),
            "ai" | "analoginput" => Some(DeviceKind::AnalogInput),
            "ao" | "analogoutput" => Some(DeviceKind::AnalogOutput),
            "led" => Some(DeviceKind::Led),
            "watchdog" | "wd" => Some(DeviceKind::Watchdog),
            "register" => Some(DeviceKind::Register),
            "data_point" => Some(DeviceKind::DataPoint),
            _ => None,
        }
    }

    /// Resolve a kind from the numeric ids of old alias files.
    pub fn from_legacy_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(DeviceKind::Relay),
            1 => Some(DeviceKind::DigitalInput),
            2 => Some(DeviceKind::AnalogInput),
            3 => Some(DeviceKind::AnalogOutput),
            17 => Some(DeviceKind::DigitalOutput),
            18 => Some(DeviceKind::Led),
            19 => Some(DeviceKind::Watchdog),
            20 => Some(DeviceKind::Register),
            24 => Some(DeviceKind::DataPoint),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device's line to its slave: shared bus handle, unit address and the
/// slave's register cache. Cached reads are explicit accessor calls by
/// register index; writes go straight to the bus, bypassing the cache.
#[derive(Clone)]
pub struct ModbusChannel {
    bus: BusHandle,
    unit: u8,
    cache: Arc<RegisterCache>,
}

impl ModbusChannel {
    pub fn new(bus: BusHandle, unit: u8, cache: Arc<RegisterCache>) -> Self {
        Self { bus, unit, cache }
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn cache(&self) -> &RegisterCache {
        &self.cache
    }

    /// Cached read of one holding register.
    pub fn register(&self, index: u16) -> Result<u16> {
        self.cache.get_one(index, RegisterKind::Holding)
    }

    /// Cached read of one register of the given kind.
    pub fn register_of(&self, index: u16, kind: RegisterKind) -> Result<u16> {
        self.cache.get_one(index, kind)
    }

    /// Cached read of a register pair.
    pub fn register_pair(&self, index: u16, kind: RegisterKind) -> Result<[u16; 2]> {
        self.cache.get_pair(index, kind)
    }

    /// Live read of the exact range, refreshing overlapping cache slots.
    pub async fn read_through(&self, count: u16, index: u16, kind: RegisterKind) -> Result<Vec<u16>> {
        self.cache
            .read_through(self.bus.as_ref(), self.unit, count, index, kind)
            .await
    }

    pub async fn write_coil(&self, addr: u16, value: bool) -> Result<()> {
        self.bus.write_coil(self.unit, addr, value).await
    }

    pub async fn write_register(&self, addr: u16, value: u16) -> Result<()> {
        self.bus.write_register(self.unit, addr, value).await
    }

    pub async fn write_registers(&self, addr: u16, values: &[u16]) -> Result<()> {
        self.bus.write_registers(self.unit, addr, values).await
    }
}

/// Alias storage shared by all device kinds.
#[derive(Default)]
pub struct AliasSlot(RwLock<Option<String>>);

impl AliasSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        read_lock(&self.0).clone()
    }

    pub fn set(&self, alias: Option<String>) {
        *write_lock(&self.0) = alias;
    }
}

/// Cancellable one-shot timer for delayed-off writes.
///
/// Arming replaces (and cancels) any previously armed timer; devices cancel
/// on every overwrite so a stale delayed write can never fire.
#[derive(Default)]
pub struct PendingTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PendingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer with a future; a previously armed one is cancelled.
    pub fn arm<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handle = lock(&self.handle);
        if let Some(previous) = handle.take() {
            previous.abort();
        }
        *handle = Some(tokio::spawn(future));
    }

    /// Cancel the armed timer, if any.
    pub fn cancel(&self) {
        if let Some(handle) = lock(&self.handle).take() {
            handle.abort();
        }
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// Binary on/off update (relays, LEDs).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BinaryUpdate {
    pub value: Option<bool>,
}

/// Digital input update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DigitalInputUpdate {
    pub debounce: Option<u16>,
    pub counter: Option<u32>,
    pub counter_mode: Option<String>,
    pub mode: Option<String>,
    pub ds_mode: Option<String>,
}

/// Digital output update: binary value with optional delayed-off, or PWM
/// frequency/duty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DigitalOutputUpdate {
    pub value: Option<bool>,
    /// Delayed-off timeout in seconds; only meaningful together with `value`.
    pub timeout: Option<f64>,
    pub pwm_freq: Option<f64>,
    pub pwm_duty: Option<f64>,
}

/// Analog input update (mode switch only; inputs are not writable).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalogInputUpdate {
    pub mode: Option<String>,
}

/// Analog output update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalogOutputUpdate {
    pub value: Option<f64>,
    pub mode: Option<String>,
}

/// Watchdog update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchdogUpdate {
    pub value: Option<bool>,
    pub timeout: Option<u32>,
    pub reset: Option<bool>,
    pub nv_save: Option<bool>,
}

/// Raw register update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterUpdate {
    pub value: Option<u16>,
}

/// Typed per-kind update record for [`Device::set`].
///
/// The API boundary builds the record matching the target device's kind;
/// a mismatched record is rejected as a validation error, never silently
/// reinterpreted.
#[derive(Debug, Clone)]
pub enum SetRequest {
    DigitalInput(DigitalInputUpdate),
    Relay(BinaryUpdate),
    DigitalOutput(DigitalOutputUpdate),
    AnalogInput(AnalogInputUpdate),
    AnalogOutput(AnalogOutputUpdate),
    Led(BinaryUpdate),
    Watchdog(WatchdogUpdate),
    Register(RegisterUpdate),
    /// Data points are read-only; there is nothing to update.
    DataPoint,
}

pub(crate) fn kind_mismatch(device: &dyn Device, request: &SetRequest) -> Error {
    Error::Validation(format!(
        "Update record {:?} does not match device '{}' of kind '{}'",
        request,
        device.circuit(),
        device.kind()
    ))
}

/// Uniform contract of every device.
#[async_trait]
pub trait Device: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Stable generated identifier (board circuit + index).
    fn circuit(&self) -> &str;

    fn alias(&self) -> Option<String>;

    /// Update the alias slot. Called by the registry, which owns alias
    /// validation and persistence.
    fn set_alias(&self, alias: Option<String>);

    /// Whether change detection runs for this device after every scan.
    fn eventable(&self) -> bool {
        true
    }

    /// Full serializable snapshot, including the alias when set.
    fn full(&self) -> Value;

    /// Value-only view.
    fn simple(&self) -> Value;

    /// Re-derive state from the register cache and report whether anything
    /// actually changed since the previous call. Side-effect-free besides
    /// the device's own shadow state.
    fn check_new_data(&self) -> Result<bool>;

    /// Validate the update, write it through to the bus and return the
    /// post-write [`Device::full`] snapshot.
    async fn set(&self, request: SetRequest) -> Result<Value>;
}

/// Insert the alias field into a snapshot when one is set.
pub(crate) fn with_alias(mut snapshot: Value, alias: &AliasSlot) -> Value {
    if let Some(alias) = alias.get() {
        if let Some(map) = snapshot.as_object_mut() {
            map.insert("alias".to_string(), Value::String(alias));
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in [
            DeviceKind::DigitalInput,
            DeviceKind::Relay,
            DeviceKind::DigitalOutput,
            DeviceKind::AnalogInput,
            DeviceKind::AnalogOutput,
            DeviceKind::Led,
            DeviceKind::Watchdog,
            DeviceKind::Register,
            DeviceKind::DataPoint,
        ] {
            assert_eq!(DeviceKind::from_name(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_kind_altnames() {
        assert_eq!(DeviceKind::from_name("relay"), Some(DeviceKind::Relay));
        assert_eq!(DeviceKind::from_name("input"), Some(DeviceKind::DigitalInput));
        assert_eq!(DeviceKind::from_name("wd"), Some(DeviceKind::Watchdog));
        assert_eq!(DeviceKind::from_name("sensor"), None);
    }

    #[test]
    fn test_legacy_ids() {
        assert_eq!(DeviceKind::from_legacy_id(0), Some(DeviceKind::Relay));
        assert_eq!(DeviceKind::from_legacy_id(17), Some(DeviceKind::DigitalOutput));
        assert_eq!(DeviceKind::from_legacy_id(99), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_timer_rearm_cancels() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let fired = Arc::new(AtomicU32::new(0));
        let timer = PendingTimer::new();

        let counter = fired.clone();
        timer.arm(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_armed());

        // Re-arming replaces the first timer before it fires.
        let counter = fired.clone();
        timer.arm(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            counter.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert!(!timer.is_armed());

        let counter = fired.clone();
        timer.arm(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            counter.fetch_add(100, Ordering::SeqCst);
        });
        timer.cancel();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
