//! Hardware definition store.
//!
//! A hardware definition describes one device model: the register blocks the
//! scanner keeps cached and the features (relays, inputs, PWM outputs, ...)
//! wired on top of those registers. Definitions are pure data, loaded once at
//! startup and immutable afterwards.
//!
//! Field names follow the established definition-file format; renaming them
//! would break every shipped model file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use fieldpoint_common::{Error, Result};

/// Modbus register kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Holding registers (read/write, 16-bit).
    #[default]
    Holding,
    /// Input registers (read-only, 16-bit).
    Input,
}

impl RegisterKind {
    /// Return the string name for this register kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, RegisterKind::Input)
    }
}

/// One contiguous run of registers scanned together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBlockDef {
    /// First register address of the block.
    pub start_reg: u16,

    /// Number of registers in the block.
    pub count: u16,

    /// Poll divisor: the block is read once every `frequency` scan cycles.
    #[serde(default = "default_frequency")]
    pub frequency: u32,

    /// Register kind ("holding" or "input").
    #[serde(rename = "type", default)]
    pub kind: RegisterKind,
}

fn default_frequency() -> u32 {
    1
}

/// A complete model definition: register blocks plus feature descriptors.
///
/// Features are kept as raw values here; the board parser decodes each one
/// into its typed form based on the `type` field, so a file carrying an
/// unknown feature type still loads (the unknown feature is skipped later).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HardwareDefinition {
    #[serde(default)]
    pub register_blocks: Vec<RegisterBlockDef>,

    #[serde(default)]
    pub features: Vec<Value>,
}

/// In-memory index of all loaded hardware definitions, keyed by model name.
#[derive(Debug, Default)]
pub struct DefinitionStore {
    definitions: HashMap<String, Arc<HardwareDefinition>>,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json5` definition file from a directory.
    ///
    /// The file stem is the model name. Unreadable or unparsable files are
    /// logged and skipped so one broken definition cannot take down the
    /// whole store.
    pub fn load_dir(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::Config(format!(
                "Definition path is not a directory: '{}'",
                path.display()
            )));
        }

        let mut store = Self::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some("json5") {
                continue;
            }
            let Some(model) = file_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let content = match std::fs::read_to_string(&file_path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %file_path.display(), error = %e, "Skipping unreadable definition file");
                    continue;
                }
            };
            match json5::from_str::<HardwareDefinition>(&content) {
                Ok(definition) => {
                    debug!(model = %model, file = %file_path.display(), "Loaded hardware definition");
                    store.insert(model, definition);
                }
                Err(e) => {
                    warn!(file = %file_path.display(), error = %e, "Skipping broken definition file");
                }
            }
        }

        if store.definitions.is_empty() {
            warn!(dir = %path.display(), "No hardware definitions loaded");
        }
        Ok(store)
    }

    pub fn insert(&mut self, model: impl Into<String>, definition: HardwareDefinition) {
        self.definitions.insert(model.into(), Arc::new(definition));
    }

    pub fn get(&self, model: &str) -> Option<Arc<HardwareDefinition>> {
        self.definitions.get(model).cloned()
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

/// Feature type tag, as written in definition files.
pub fn feature_type(feature: &Value) -> Option<&str> {
    feature.get("type").and_then(Value::as_str)
}

/// Instance count of a feature (defaults to 1).
pub fn feature_count(feature: &Value) -> u16 {
    feature
        .get("count")
        .and_then(Value::as_u64)
        .map(|c| c as u16)
        .unwrap_or(1)
}

fn default_modes_simple() -> Vec<String> {
    vec!["Simple".to_string()]
}

/// Digital input wiring: value bit plus optional counter/debounce and
/// DirectSwitch register blocks.
#[derive(Debug, Clone, Deserialize)]
pub struct DigitalInputDef {
    pub val_reg: u16,
    pub counter_reg: Option<u16>,
    pub debounce_reg: Option<u16>,
    #[serde(default)]
    pub start_index: u16,
    #[serde(default = "default_modes_simple")]
    pub modes: Vec<String>,
    pub ds_modes: Option<Vec<String>>,
    pub direct_reg: Option<u16>,
    pub polar_reg: Option<u16>,
    pub toggle_reg: Option<u16>,
}

/// Relay wiring: one coil per instance plus a shared status register.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayDef {
    pub val_reg: u16,
    pub val_coil: u16,
}

/// Digital output wiring: coil + status bit, plus one of the two PWM
/// register blocks (hard timer or soft preset).
#[derive(Debug, Clone, Deserialize)]
pub struct DigitalOutputDef {
    pub val_reg: u16,
    pub val_coil: u16,
    #[serde(default = "default_modes_simple")]
    pub modes: Vec<String>,
    pub pwm_reg: Option<u16>,
    pub pwm_c_reg: Option<u16>,
    pub pwm_ps_reg: Option<u16>,
    pub pwm_preset_reg: Option<u16>,
    pub pwm_cpres_reg: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedDef {
    pub val_reg: u16,
    pub val_coil: u16,
}

/// Watchdog wiring: value + timeout registers, optional reset and
/// nonvolatile-save coils.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogDef {
    pub val_reg: u16,
    pub timeout_reg: u16,
    pub nv_sav_coil: Option<u16>,
    pub reset_coil: Option<u16>,
}

/// Analog input wiring: float32 register pair per channel, optional
/// per-channel mode register selecting among declared modes.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalogInputDef {
    pub val_reg: u16,
    pub mode_reg: Option<u16>,
    #[serde(default)]
    pub modes: HashMap<String, ModeDef>,
}

/// Analog output wiring. The `BAO` feature variant adds a dedicated
/// resistance-value register and uses float32 pair encoding.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalogOutputDef {
    pub val_reg: u16,
    pub mode_reg: Option<u16>,
    #[serde(default)]
    pub modes: HashMap<String, ModeDef>,
    pub res_val_reg: Option<u16>,
}

/// Raw register passthrough.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterFeatureDef {
    pub start_reg: u16,
    #[serde(default)]
    pub reg_type: RegisterKind,
}

/// Decode datatype of a data point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataPointType {
    #[default]
    Signed16,
    Float32,
}

/// Derived data point: scaled register value with optional validity mask.
#[derive(Debug, Clone, Deserialize)]
pub struct DataPointDef {
    pub value_reg: u16,
    #[serde(default)]
    pub reg_type: RegisterKind,
    #[serde(default)]
    pub datatype: DataPointType,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    pub unit: Option<String>,
    pub name: Option<String>,
    pub valid_mask_reg: Option<u16>,
}

fn default_factor() -> f64 {
    1.0
}

/// One selectable mode of an analog channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDef {
    /// Raw value written to / matched against the mode register.
    pub value: Option<u16>,
    pub unit: Option<String>,
    pub range: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformation: Option<TransformDef>,
}

/// Word order of a two-register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[serde(alias = "Big")]
    Big,
    #[serde(alias = "Little")]
    Little,
}

/// Decode datatype of an analog transformation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformType {
    #[default]
    Float32,
    Int32,
    Uint32,
}

/// Declarative decode transformation applied to an analog register pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransformDef {
    #[serde(default = "default_byteorder")]
    pub byteorder: Endianness,
    #[serde(default = "default_wordorder")]
    pub wordorder: Endianness,
    #[serde(default)]
    pub datatype: TransformType,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
}

fn default_byteorder() -> Endianness {
    Endianness::Big
}

fn default_wordorder() -> Endianness {
    Endianness::Little
}

fn default_decimals() -> u32 {
    3
}

fn default_ratio() -> f64 {
    1.0
}

impl Default for TransformDef {
    fn default() -> Self {
        Self {
            byteorder: default_byteorder(),
            wordorder: default_wordorder(),
            datatype: TransformType::default(),
            decimals: default_decimals(),
            ratio: default_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_definition() {
        let json5 = r#"{
            register_blocks: [
                { start_reg: 0, count: 10 },
                { start_reg: 1000, count: 4, frequency: 10, type: "input" },
            ],
            features: [
                { type: "DI", count: 4, val_reg: 0, counter_reg: 8, debounce_reg: 1010 },
                { type: "RO", count: 4, val_reg: 1, val_coil: 0 },
            ],
        }"#;

        let def: HardwareDefinition = json5::from_str(json5).unwrap();
        assert_eq!(def.register_blocks.len(), 2);
        assert_eq!(def.register_blocks[0].frequency, 1);
        assert_eq!(def.register_blocks[0].kind, RegisterKind::Holding);
        assert_eq!(def.register_blocks[1].kind, RegisterKind::Input);
        assert_eq!(def.features.len(), 2);
        assert_eq!(feature_type(&def.features[0]), Some("DI"));
        assert_eq!(feature_count(&def.features[0]), 4);
        assert_eq!(feature_count(&def.features[1]), 4);
    }

    #[test]
    fn test_typed_feature_decode() {
        let json5 = r#"{
            type: "DI",
            count: 4,
            val_reg: 0,
            counter_reg: 8,
            debounce_reg: 1010,
            modes: ["Simple", "DirectSwitch"],
            ds_modes: ["Simple", "Inverted", "Toggle"],
            direct_reg: 1016,
            polar_reg: 1017,
            toggle_reg: 1018,
        }"#;

        let raw: Value = json5::from_str(json5).unwrap();
        let def: DigitalInputDef = serde_json::from_value(raw).unwrap();
        assert_eq!(def.val_reg, 0);
        assert_eq!(def.counter_reg, Some(8));
        assert_eq!(def.direct_reg, Some(1016));
        assert_eq!(def.modes, vec!["Simple", "DirectSwitch"]);
    }

    #[test]
    fn test_transformation_defaults() {
        let raw: Value = json5::from_str(r#"{ datatype: "uint32", ratio: 0.1 }"#).unwrap();
        let t: TransformDef = serde_json::from_value(raw).unwrap();
        assert_eq!(t.byteorder, Endianness::Big);
        assert_eq!(t.wordorder, Endianness::Little);
        assert_eq!(t.datatype, TransformType::Uint32);
        assert_eq!(t.decimals, 3);
        assert!((t.ratio - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_feature_type_still_loads() {
        let json5 = r#"{
            register_blocks: [{ start_reg: 0, count: 2 }],
            features: [{ type: "FROBNICATOR", val_reg: 0 }],
        }"#;

        let def: HardwareDefinition = json5::from_str(json5).unwrap();
        assert_eq!(feature_type(&def.features[0]), Some("FROBNICATOR"));
    }
}
