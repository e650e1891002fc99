//! Fieldpoint device-management core.
//!
//! Mirrors the I/O features of Modbus slaves (TCP or RTU) into a stable,
//! named, continuously-scanned in-memory device model:
//!
//! - [`hwdef`] - Hardware definition store (register blocks + features)
//! - [`bus`] - Shared per-bus Modbus transport
//! - [`cache`] - Per-slave register cache and scan scheduler
//! - [`slave`] - Slave scan loop with exponential backoff
//! - [`board`] - Feature parser building devices from definitions
//! - [`device`] - The device family (inputs, relays, PWM outputs, ...)
//! - [`registry`] - Device registry and persisted aliases
//! - [`notify`] - Changed-devices notification hook
//! - [`controller`] - Topology assembly and lifecycle

pub mod board;
pub mod bus;
pub mod cache;
pub mod config;
pub mod controller;
pub mod device;
pub mod hwdef;
pub mod notify;
pub mod registry;
pub mod slave;
pub mod testing;

mod util;

// Re-export commonly used types at the crate root
pub use bus::{BusHandle, BusTransport, ModbusBus};
pub use cache::RegisterCache;
pub use config::{ConnectionConfig, ControllerConfig};
pub use controller::Controller;
pub use device::{Device, DeviceKind, SetRequest};
pub use hwdef::{DefinitionStore, HardwareDefinition, RegisterKind};
pub use notify::{ChangeBatch, ChangeNotifier, LogNotifier};
pub use registry::{AliasRecord, DeviceRegistry, load_aliases, save_aliases};
pub use slave::Slave;
