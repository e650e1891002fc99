//! Outbound change notification hook.
//!
//! The core does not own a transport; whoever embeds it (the API layer, a
//! message bus bridge) supplies a [`ChangeNotifier`] and receives one batch
//! of changed-device snapshots per completed scan per slave.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// One batch of changed devices from a single scan pass.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeBatch {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Circuit of the slave that was scanned.
    pub source: String,
    /// `full()` snapshots of every device that reported a change.
    pub devices: Vec<Value>,
}

impl ChangeBatch {
    pub fn new(source: impl Into<String>, devices: Vec<Value>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: source.into(),
            devices,
        }
    }
}

/// Hook invoked with changed devices, at most once per completed scan.
pub trait ChangeNotifier: Send + Sync {
    fn devices_changed(&self, batch: ChangeBatch);
}

/// Default notifier: logs batches at debug level.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl ChangeNotifier for LogNotifier {
    fn devices_changed(&self, batch: ChangeBatch) {
        debug!(
            source = %batch.source,
            devices = batch.devices.len(),
            "Devices changed"
        );
    }
}
