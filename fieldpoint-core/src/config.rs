//! Configuration for the Fieldpoint controller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fieldpoint_common::LoggingConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Physical buses, keyed by bus name.
    pub buses: HashMap<String, BusConfig>,

    /// Hardware definition directory.
    #[serde(default)]
    pub definitions: DefinitionsConfig,

    /// Alias persistence settings.
    #[serde(default)]
    pub aliases: AliasesConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where hardware definitions are loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionsConfig {
    #[serde(default = "default_definitions_dir")]
    pub dir: PathBuf,
}

fn default_definitions_dir() -> PathBuf {
    PathBuf::from("./definitions")
}

impl Default for DefinitionsConfig {
    fn default() -> Self {
        Self {
            dir: default_definitions_dir(),
        }
    }
}

/// Alias file settings. With no file configured, aliases are kept only
/// in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasesConfig {
    pub file: Option<PathBuf>,
}

/// Configuration for a single physical bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Connection type and address.
    pub connection: ConnectionConfig,

    /// Disabled buses are skipped entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Per-operation timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Slaves attached to this bus, keyed by device name (the slave circuit).
    #[serde(default)]
    pub devices: HashMap<String, SlaveConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// Configuration for a single Modbus slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    /// Hardware model name; must match a loaded definition.
    pub model: String,

    /// Scan frequency in Hz. 0 is clamped to a minimal interval.
    #[serde(default = "default_scan_frequency")]
    pub scan_frequency: f64,

    /// Whether the scan loop runs for this slave.
    #[serde(default = "default_enabled")]
    pub scan_enabled: bool,

    /// Disabled slaves are skipped entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_slave_id() -> u8 {
    1
}

fn default_scan_frequency() -> f64 {
    50.0
}

impl ControllerConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buses.is_empty() {
            return Err(ConfigError::Validation(
                "At least one bus must be configured".to_string(),
            ));
        }

        for (bus_name, bus) in &self.buses {
            if bus_name.is_empty() {
                return Err(ConfigError::Validation(
                    "Bus name cannot be empty".to_string(),
                ));
            }

            // Validate RTU parity
            if let ConnectionConfig::Rtu { parity, .. } = &bus.connection {
                match parity.to_lowercase().as_str() {
                    "none" | "even" | "odd" => {}
                    _ => {
                        return Err(ConfigError::Validation(format!(
                            "Bus '{}': invalid parity '{}' (use none, even, or odd)",
                            bus_name, parity
                        )));
                    }
                }
            }

            for (device_name, device) in &bus.devices {
                if device.slave_id == 0 {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': slave_id must be 1-247",
                        device_name
                    )));
                }
                if device.model.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': model cannot be empty",
                        device_name
                    )));
                }
                if device.scan_frequency < 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': scan_frequency cannot be negative",
                        device_name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_config() {
        let json = r#"{
            buses: {
                local: {
                    connection: { type: "tcp", host: "192.168.1.10" },
                    devices: {
                        plc01: { slave_id: 1, model: "M203" }
                    }
                }
            }
        }"#;

        let config: ControllerConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();
        let bus = &config.buses["local"];
        assert_eq!(bus.devices.len(), 1);
        assert!(bus.enabled);

        if let ConnectionConfig::Tcp { host, port } = &bus.connection {
            assert_eq!(host, "192.168.1.10");
            assert_eq!(*port, 502); // default
        } else {
            panic!("Expected TCP connection");
        }

        let device = &bus.devices["plc01"];
        assert_eq!(device.model, "M203");
        assert_eq!(device.scan_frequency, 50.0);
        assert!(device.scan_enabled);
    }

    #[test]
    fn test_parse_rtu_config() {
        let json = r#"{
            buses: {
                rs485: {
                    connection: {
                        type: "rtu",
                        port: "/dev/ttyUSB0",
                        baud_rate: 19200,
                        parity: "even"
                    },
                    devices: {
                        ext01: { slave_id: 5, model: "xS11", scan_frequency: 10 }
                    }
                }
            }
        }"#;

        let config: ControllerConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        let bus = &config.buses["rs485"];
        if let ConnectionConfig::Rtu {
            port,
            baud_rate,
            parity,
            ..
        } = &bus.connection
        {
            assert_eq!(port, "/dev/ttyUSB0");
            assert_eq!(*baud_rate, 19200);
            assert_eq!(parity, "even");
        } else {
            panic!("Expected RTU connection");
        }

        assert_eq!(bus.devices["ext01"].slave_id, 5);
    }

    #[test]
    fn test_validate_empty_buses() {
        let config: ControllerConfig = json5::from_str(r#"{ buses: {} }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_slave_id() {
        let json = r#"{
            buses: {
                local: {
                    connection: { type: "tcp", host: "10.0.0.2" },
                    devices: {
                        plc01: { slave_id: 0, model: "M203" }
                    }
                }
            }
        }"#;

        let config: ControllerConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_parity() {
        let json = r#"{
            buses: {
                rs485: {
                    connection: { type: "rtu", port: "/dev/ttyUSB0", parity: "mark" },
                }
            }
        }"#;

        let config: ControllerConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
