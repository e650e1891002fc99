//! Device registry and the persisted alias layer.
//!
//! One registry instance is owned per controller; nothing here is global.
//! Devices are indexed by kind and circuit; aliases are a second, flat
//! namespace resolving to exactly one live device each. Alias mutations are
//! pushed out through the dirty (batched) or force-save (immediate)
//! persistence callbacks the embedder wires in.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use fieldpoint_common::{Error, Result};

use crate::device::{Device, DeviceKind};
use crate::util::{read_lock, write_lock};

type Callback = Box<dyn Fn() + Send + Sync>;

/// Persisted form of one alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub circuit: String,
    pub devtype: String,
}

/// Alias table: live alias → device bindings plus the persisted records
/// whose devices have not (yet) registered.
pub struct Aliases {
    entries: RwLock<HashMap<String, Arc<dyn Device>>>,
    seeds: RwLock<HashMap<String, AliasRecord>>,
    dirty_cb: RwLock<Option<Callback>>,
    save_cb: RwLock<Option<Callback>>,
}

impl Aliases {
    pub fn new(initial: HashMap<String, AliasRecord>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            seeds: RwLock::new(initial),
            dirty_cb: RwLock::new(None),
            save_cb: RwLock::new(None),
        }
    }

    /// Register the batched-persistence callback.
    pub fn on_dirty(&self, callback: impl Fn() + Send + Sync + 'static) {
        *write_lock(&self.dirty_cb) = Some(Box::new(callback));
    }

    /// Register the immediate-persistence callback.
    pub fn on_force_save(&self, callback: impl Fn() + Send + Sync + 'static) {
        *write_lock(&self.save_cb) = Some(Box::new(callback));
    }

    fn set_dirty(&self) {
        if let Some(callback) = read_lock(&self.dirty_cb).as_ref() {
            callback();
        }
    }

    fn set_force_save(&self) {
        if let Some(callback) = read_lock(&self.save_cb).as_ref() {
            callback();
        }
    }

    fn persist(&self, file_update: bool) {
        if file_update {
            self.set_force_save();
        } else {
            self.set_dirty();
        }
    }

    /// Check the alias charset. Uniqueness is handled by reassignment, not
    /// rejection: adding an existing alias moves it.
    pub fn validate(&self, alias: &str) -> Result<()> {
        let valid = !alias.is_empty()
            && alias
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
        if !valid {
            return Err(Error::Validation(format!("Invalid alias '{}'", alias)));
        }
        Ok(())
    }

    /// Bind an alias to a device. A previous holder of the alias is
    /// detached first, as is the device's previous alias; an alias never
    /// resolves to two devices.
    pub fn add(&self, alias: &str, device: &Arc<dyn Device>, file_update: bool) -> Result<()> {
        self.validate(alias)?;

        {
            let mut entries = write_lock(&self.entries);

            if let Some(previous_holder) = entries.get(alias) {
                if !Arc::ptr_eq(previous_holder, device) {
                    previous_holder.set_alias(None);
                }
            }
            if let Some(previous_alias) = device.alias() {
                entries.remove(&previous_alias);
                write_lock(&self.seeds).remove(&previous_alias);
            }

            write_lock(&self.seeds).remove(alias);
            entries.insert(alias.to_string(), device.clone());
        }
        device.set_alias(Some(alias.to_string()));

        self.persist(file_update);
        Ok(())
    }

    /// Drop an alias from the live table and the persisted seeds.
    pub fn delete(&self, alias: &str, file_update: bool) {
        let removed_entry = write_lock(&self.entries).remove(alias);
        if let Some(device) = &removed_entry {
            device.set_alias(None);
        }
        let removed_seed = write_lock(&self.seeds).remove(alias).is_some();

        if removed_entry.is_some() || removed_seed {
            self.persist(file_update);
        }
    }

    /// Resolve a live alias.
    pub fn resolve(&self, alias: &str) -> Option<Arc<dyn Device>> {
        read_lock(&self.entries).get(alias).cloned()
    }

    /// Persisted aliases recorded for the given kind and circuit.
    fn seeds_for(&self, kind: DeviceKind, circuit: &str) -> Vec<String> {
        read_lock(&self.seeds)
            .iter()
            .filter(|(_, record)| record.devtype == kind.as_str() && record.circuit == circuit)
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// The complete alias map to persist: unbound seeds plus live bindings.
    pub fn to_save_map(&self) -> HashMap<String, AliasRecord> {
        let mut map = read_lock(&self.seeds).clone();
        for (alias, device) in read_lock(&self.entries).iter() {
            map.insert(
                alias.clone(),
                AliasRecord {
                    circuit: device.circuit().to_string(),
                    devtype: device.kind().as_str().to_string(),
                },
            );
        }
        map
    }

    /// Serializable view of the live alias table.
    pub fn full(&self) -> Value {
        let aliases: HashMap<String, AliasRecord> = read_lock(&self.entries)
            .iter()
            .map(|(alias, device)| {
                (
                    alias.clone(),
                    AliasRecord {
                        circuit: device.circuit().to_string(),
                        devtype: device.kind().as_str().to_string(),
                    },
                )
            })
            .collect();
        json!({ "aliases": aliases })
    }
}

/// Process-wide device index for one controller.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceKind, HashMap<String, Arc<dyn Device>>>>,
    aliases: Aliases,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::with_aliases(HashMap::new())
    }

    /// Create a registry pre-seeded with persisted alias records.
    pub fn with_aliases(initial: HashMap<String, AliasRecord>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            aliases: Aliases::new(initial),
        }
    }

    pub fn aliases(&self) -> &Aliases {
        &self.aliases
    }

    /// Insert a device, keyed by its circuit. A duplicate circuit within a
    /// kind is a logic error, never a silent overwrite. Any persisted alias
    /// recorded for this (kind, circuit) is attached.
    pub fn register(&self, device: Arc<dyn Device>) -> Result<()> {
        let kind = device.kind();
        let circuit = device.circuit().to_string();

        {
            let mut devices = write_lock(&self.devices);
            let by_circuit = devices.entry(kind).or_default();
            if by_circuit.contains_key(&circuit) {
                return Err(Error::Config(format!(
                    "Duplicate circuit '{}' for device type '{}'",
                    circuit, kind
                )));
            }
            by_circuit.insert(circuit.clone(), device.clone());
        }

        for alias in self.aliases.seeds_for(kind, &circuit) {
            match self.aliases.add(&alias, &device, false) {
                Ok(()) => info!(alias = %alias, kind = %kind, circuit = %circuit, "Restored saved alias"),
                Err(e) => warn!(alias = %alias, error = %e, "Error restoring saved alias"),
            }
        }

        debug!(kind = %kind, circuit = %circuit, "Registered new device");
        Ok(())
    }

    /// Look a device up by circuit, falling back to alias resolution.
    pub fn by_name(&self, kind: DeviceKind, name: &str) -> Result<Arc<dyn Device>> {
        if let Some(device) = read_lock(&self.devices)
            .get(&kind)
            .and_then(|by_circuit| by_circuit.get(name))
        {
            return Ok(device.clone());
        }

        match self.aliases.resolve(name) {
            Some(device) if device.kind() == kind => Ok(device),
            Some(device) => Err(Error::DeviceNotFound(format!(
                "'{}' is a {}, not a {}",
                name,
                device.kind(),
                kind
            ))),
            None => Err(Error::DeviceNotFound(format!(
                "No {} device with circuit or alias '{}'",
                kind, name
            ))),
        }
    }

    /// All devices of one kind.
    pub fn by_kind(&self, kind: DeviceKind) -> Vec<Arc<dyn Device>> {
        read_lock(&self.devices)
            .get(&kind)
            .map(|by_circuit| by_circuit.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every registered device.
    pub fn all(&self) -> Vec<Arc<dyn Device>> {
        read_lock(&self.devices)
            .values()
            .flat_map(|by_circuit| by_circuit.values().cloned())
            .collect()
    }

    /// Assign, move or clear a device's alias. `file_update` selects the
    /// immediate force-save callback over the batched dirty one.
    pub fn set_alias(
        &self,
        device: &Arc<dyn Device>,
        alias: Option<&str>,
        file_update: bool,
    ) -> Result<()> {
        match alias {
            None | Some("") => {
                if let Some(current) = device.alias() {
                    self.aliases.delete(&current, file_update);
                    debug!(kind = %device.kind(), circuit = %device.circuit(), "Cleared alias");
                }
                Ok(())
            }
            Some(alias) => {
                if device.alias().as_deref() == Some(alias) {
                    return Ok(());
                }
                self.aliases.add(alias, device, file_update)?;
                debug!(
                    alias = %alias,
                    kind = %device.kind(),
                    circuit = %device.circuit(),
                    "Set alias"
                );
                Ok(())
            }
        }
    }
}

/// Load the version-tagged alias file. A missing file is an empty table.
///
/// Version 2.0 stores `alias -> {circuit, devtype}`; version 1.0 stored a
/// record list with numeric device types, upgraded here on the fly.
pub fn load_aliases(path: impl AsRef<Path>) -> Result<HashMap<String, AliasRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(file = %path.display(), "Alias file not found, starting empty");
        return Ok(HashMap::new());
    }

    let content = std::fs::read_to_string(path)?;
    let raw: Value = json5::from_str(&content)
        .map_err(|e| Error::Config(format!("Broken alias file '{}': {}", path.display(), e)))?;

    let version = raw
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut result = HashMap::new();
    match version.as_str() {
        "2.0" => {
            if let Some(aliases) = raw.get("aliases").and_then(Value::as_object) {
                for (alias, record) in aliases {
                    let Some(circuit) = record.get("circuit").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(devtype) = parse_devtype(record.get("devtype")) else {
                        warn!(alias = %alias, "Alias with unknown devtype, skipping");
                        continue;
                    };
                    result.insert(
                        alias.clone(),
                        AliasRecord {
                            circuit: circuit.to_string(),
                            devtype,
                        },
                    );
                }
            }
        }
        "1.0" => {
            if let Some(records) = raw.get("aliases").and_then(Value::as_array) {
                for record in records {
                    let Some(name) = record.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(circuit) = record.get("circuit").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(devtype) = parse_devtype(record.get("dev_type")) else {
                        warn!(alias = %name, "Alias with unknown devtype, skipping");
                        continue;
                    };
                    info!(alias = %name, "Upgrading alias record from version 1.0");
                    result.insert(
                        name.to_string(),
                        AliasRecord {
                            circuit: circuit.to_string(),
                            devtype,
                        },
                    );
                }
            }
        }
        other => {
            warn!(file = %path.display(), version = %other, "Unsupported alias file version");
        }
    }

    debug!(file = %path.display(), count = result.len(), "Loaded aliases");
    Ok(result)
}

/// Accept both the canonical kind names and the old numeric ids.
fn parse_devtype(raw: Option<&Value>) -> Option<String> {
    match raw {
        Some(Value::String(name)) => {
            DeviceKind::from_name(name).map(|kind| kind.as_str().to_string())
        }
        Some(Value::Number(id)) => id
            .as_u64()
            .and_then(|id| DeviceKind::from_legacy_id(id as u32))
            .map(|kind| kind.as_str().to_string()),
        _ => None,
    }
}

/// Write the alias file (version 2.0, pretty JSON).
pub fn save_aliases(aliases: &HashMap<String, AliasRecord>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    info!(file = %path.display(), count = aliases.len(), "Saving alias file");
    let content = serde_json::to_string_pretty(&json!({
        "version": "2.0",
        "aliases": aliases,
    }))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::device::{AliasSlot, SetRequest};

    /// Minimal device for registry tests.
    struct FakeDevice {
        kind: DeviceKind,
        circuit: String,
        alias: AliasSlot,
    }

    impl FakeDevice {
        fn new(kind: DeviceKind, circuit: &str) -> Arc<dyn Device> {
            Arc::new(Self {
                kind,
                circuit: circuit.to_string(),
                alias: AliasSlot::new(),
            })
        }
    }

    #[async_trait]
    impl Device for FakeDevice {
        fn kind(&self) -> DeviceKind {
            self.kind
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
            json!({ "circuit": self.circuit })
        }
        fn simple(&self) -> Value {
            self.full()
        }
        fn check_new_data(&self) -> Result<bool> {
            Ok(false)
        }
        async fn set(&self, _request: SetRequest) -> Result<Value> {
            Ok(self.full())
        }
    }

    #[test]
    fn test_duplicate_circuit_rejected() {
        let registry = DeviceRegistry::new();
        registry
            .register(FakeDevice::new(DeviceKind::Relay, "plc01_01"))
            .unwrap();
        let result = registry.register(FakeDevice::new(DeviceKind::Relay, "plc01_01"));
        assert!(matches!(result, Err(Error::Config(_))));

        // Same circuit under another kind is fine.
        registry
            .register(FakeDevice::new(DeviceKind::DigitalOutput, "plc01_01"))
            .unwrap();
    }

    #[test]
    fn test_by_name_circuit_alias_and_kind_mismatch() {
        let registry = DeviceRegistry::new();
        let relay = FakeDevice::new(DeviceKind::Relay, "plc01_01");
        registry.register(relay.clone()).unwrap();
        registry
            .set_alias(&relay, Some("pump"), false)
            .unwrap();

        assert!(registry.by_name(DeviceKind::Relay, "plc01_01").is_ok());
        assert!(registry.by_name(DeviceKind::Relay, "pump").is_ok());
        assert!(matches!(
            registry.by_name(DeviceKind::Relay, "nope"),
            Err(Error::DeviceNotFound(_))
        ));
        assert!(matches!(
            registry.by_name(DeviceKind::Led, "pump"),
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_alias_reassignment_detaches() {
        let registry = DeviceRegistry::new();
        let a = FakeDevice::new(DeviceKind::Relay, "plc01_01");
        let b = FakeDevice::new(DeviceKind::Relay, "plc01_02");
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        registry.set_alias(&a, Some("pump"), false).unwrap();
        assert_eq!(a.alias().as_deref(), Some("pump"));

        registry.set_alias(&b, Some("pump"), false).unwrap();
        assert_eq!(a.alias(), None);
        assert_eq!(b.alias().as_deref(), Some("pump"));

        let resolved = registry.by_name(DeviceKind::Relay, "pump").unwrap();
        assert_eq!(resolved.circuit(), "plc01_02");
    }

    #[test]
    fn test_alias_charset_validation() {
        let registry = DeviceRegistry::new();
        let device = FakeDevice::new(DeviceKind::Relay, "plc01_01");
        registry.register(device.clone()).unwrap();

        assert!(registry.set_alias(&device, Some("ok-name_1.2"), false).is_ok());
        assert!(matches!(
            registry.set_alias(&device, Some("bad name"), false),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            registry.set_alias(&device, Some("bad/name"), false),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_saved_alias_restored_on_register() {
        let mut initial = HashMap::new();
        initial.insert(
            "pump".to_string(),
            AliasRecord {
                circuit: "plc01_01".to_string(),
                devtype: "ro".to_string(),
            },
        );
        let registry = DeviceRegistry::with_aliases(initial);

        let relay = FakeDevice::new(DeviceKind::Relay, "plc01_01");
        registry.register(relay.clone()).unwrap();
        assert_eq!(relay.alias().as_deref(), Some("pump"));
    }

    #[test]
    fn test_persistence_callbacks() {
        let registry = DeviceRegistry::new();
        let device = FakeDevice::new(DeviceKind::Relay, "plc01_01");
        registry.register(device.clone()).unwrap();

        let dirty = Arc::new(AtomicU32::new(0));
        let saved = Arc::new(AtomicU32::new(0));
        {
            let dirty = dirty.clone();
            registry.aliases().on_dirty(move || {
                dirty.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let saved = saved.clone();
            registry.aliases().on_force_save(move || {
                saved.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.set_alias(&device, Some("pump"), false).unwrap();
        assert_eq!(dirty.load(Ordering::SeqCst), 1);
        assert_eq!(saved.load(Ordering::SeqCst), 0);

        registry.set_alias(&device, Some("pump2"), true).unwrap();
        assert_eq!(saved.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_alias_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.json5");

        let mut map = HashMap::new();
        map.insert(
            "pump".to_string(),
            AliasRecord {
                circuit: "plc01_01".to_string(),
                devtype: "ro".to_string(),
            },
        );
        save_aliases(&map, &path).unwrap();

        let loaded = load_aliases(&path).unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_alias_file_v1_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.json5");
        std::fs::write(
            &path,
            r#"{
                version: "1.0",
                aliases: [
                    { name: "pump", circuit: "plc01_01", dev_type: 0 },
                    { name: "light", circuit: "plc01_02", dev_type: "do" },
                    { circuit: "plc01_03", dev_type: 0 },
                ],
            }"#,
        )
        .unwrap();

        let loaded = load_aliases(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["pump"].devtype, "ro");
        assert_eq!(loaded["light"].devtype, "do");
    }

    #[test]
    fn test_missing_alias_file_is_empty() {
        let loaded = load_aliases("/nonexistent/aliases.json5").unwrap();
        assert!(loaded.is_empty());
    }
}
