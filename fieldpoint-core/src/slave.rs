//! Modbus slave: cache ownership and the scan-loop state machine.
//!
//! Every slave runs one independent loop: scan the cache, run change
//! detection over the eventable devices, deliver the changeset, sleep. A
//! failing slave backs off exponentially (capped at two minutes) without
//! ever touching its neighbours; one good scan collapses the backoff.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use fieldpoint_common::{Error, Result};

use crate::bus::BusHandle;
use crate::cache::RegisterCache;
use crate::device::Device;
use crate::hwdef::RegisterBlockDef;
use crate::notify::{ChangeBatch, ChangeNotifier};
use crate::util::{read_lock, write_lock};

/// Backoff ceiling in seconds.
const MAX_BACKOFF_SECS: f64 = 120.0;

/// Sleep interval after `errors` consecutive scan failures.
///
/// `min(scan_interval * 2^errors, 120 s)`; zero errors is the nominal
/// interval.
pub fn backoff_interval(scan_interval: f64, errors: u32) -> Duration {
    let factor = 2f64.powi(errors.min(64) as i32);
    Duration::from_secs_f64((scan_interval * factor).min(MAX_BACKOFF_SECS))
}

pub struct Slave {
    circuit: String,
    unit_id: u8,
    model: String,
    bus: BusHandle,
    /// Transport label for snapshots ("TCP" or "RTU").
    transport: String,
    /// Endpoint (host or serial port) for snapshots.
    spec: String,
    scan_interval: f64,
    scan_enabled: bool,
    cache: OnceLock<Arc<RegisterCache>>,
    eventable: RwLock<Vec<Arc<dyn Device>>>,
    scan_errors: AtomicU32,
    do_scanning: AtomicBool,
    is_scanning: AtomicBool,
    notifier: Arc<dyn ChangeNotifier>,
}

impl Slave {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        circuit: impl Into<String>,
        unit_id: u8,
        model: impl Into<String>,
        bus: BusHandle,
        transport: impl Into<String>,
        spec: impl Into<String>,
        scan_frequency: f64,
        scan_enabled: bool,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        // The interval must never be zero; a zero frequency means "as fast
        // as the bus allows", floored here.
        let scan_interval = if scan_frequency == 0.0 {
            0.0001
        } else {
            1.0 / scan_frequency
        };

        Self {
            circuit: circuit.into(),
            unit_id,
            model: model.into(),
            bus,
            transport: transport.into(),
            spec: spec.into(),
            scan_interval,
            scan_enabled,
            cache: OnceLock::new(),
            eventable: RwLock::new(Vec::new()),
            scan_errors: AtomicU32::new(0),
            do_scanning: AtomicBool::new(false),
            is_scanning: AtomicBool::new(false),
            notifier,
        }
    }

    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn bus(&self) -> BusHandle {
        self.bus.clone()
    }

    pub fn scan_interval(&self) -> f64 {
        self.scan_interval
    }

    pub fn scan_enabled(&self) -> bool {
        self.scan_enabled
    }

    /// Create the register cache from the definition's blocks and run the
    /// guarded initial scan. Called once by the board parser.
    pub async fn init_cache(&self, blocks: &[RegisterBlockDef]) -> Result<Arc<RegisterCache>> {
        let cache = Arc::new(RegisterCache::new(blocks)?);
        self.cache
            .set(cache.clone())
            .map_err(|_| Error::Config(format!("'{}': cache initialized twice", self.circuit)))?;

        if let Err(e) = cache.scan_initial(self.bus.as_ref(), self.unit_id).await {
            // The slave may simply be offline right now; the scan loop will
            // reach it eventually.
            warn!(circuit = %self.circuit, error = %e, "Initial scan failed");
        }
        Ok(cache)
    }

    pub fn cache(&self) -> Option<Arc<RegisterCache>> {
        self.cache.get().cloned()
    }

    /// Register a device for per-scan change detection.
    pub fn add_eventable(&self, device: Arc<dyn Device>) {
        write_lock(&self.eventable).push(device);
    }

    pub fn eventable_devices(&self) -> Vec<Arc<dyn Device>> {
        read_lock(&self.eventable).clone()
    }

    /// One scan pass: refresh due cache blocks, then run change detection
    /// and deliver at most one changeset.
    pub async fn scan_once(&self) -> Result<bool> {
        let Some(cache) = self.cache.get() else {
            return Ok(false);
        };

        let scanned = cache.scan(self.bus.as_ref(), self.unit_id).await?;
        if scanned {
            self.dispatch_changes();
        }
        Ok(scanned)
    }

    fn dispatch_changes(&self) {
        let mut changed = Vec::new();
        for device in self.eventable_devices() {
            match device.check_new_data() {
                Ok(true) => changed.push(device.full()),
                Ok(false) => {}
                Err(e) => {
                    error!(
                        device = %format!("{}_{}", device.kind(), device.circuit()),
                        error = %e,
                        "Error while checking new data"
                    );
                }
            }
        }
        if !changed.is_empty() {
            self.notifier
                .devices_changed(ChangeBatch::new(self.circuit.clone(), changed));
        }
    }

    /// Spawn the scan loop, unless it is already running or scanning is
    /// disabled for this slave.
    pub fn start_scanning(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.scan_enabled {
            return None;
        }
        self.do_scanning.store(true, Ordering::SeqCst);
        if self.is_scanning.swap(true, Ordering::SeqCst) {
            // Another loop is already active for this slave.
            return None;
        }

        let slave = self.clone();
        Some(tokio::spawn(async move { slave.scan_loop().await }))
    }

    /// Request a cooperative stop; takes effect at the next iteration top.
    pub fn stop_scanning(&self) {
        self.do_scanning.store(false, Ordering::SeqCst);
    }

    async fn scan_loop(&self) {
        info!(circuit = %self.circuit, interval = self.scan_interval, "Scan loop started");

        while self.do_scanning.load(Ordering::SeqCst) {
            match self.scan_once().await {
                Ok(true) => {
                    if self.scan_errors.swap(0, Ordering::SeqCst) > 0 {
                        info!(circuit = %self.circuit, "Communication with device is back");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    let errors = self.scan_errors.fetch_add(1, Ordering::SeqCst);
                    if errors == 0 {
                        error!(circuit = %self.circuit, error = %e, "Error while scanning");
                        warn!(circuit = %self.circuit, "Slowing down device");
                    }
                }
            }

            let errors = self.scan_errors.load(Ordering::SeqCst);
            tokio::time::sleep(backoff_interval(self.scan_interval, errors)).await;
        }

        self.is_scanning.store(false, Ordering::SeqCst);
        info!(circuit = %self.circuit, "Scan loop stopped");
    }

    /// Serializable snapshot of the slave itself.
    pub fn full(&self) -> Value {
        let last_comm = self
            .cache
            .get()
            .and_then(|cache| cache.last_comm_secs())
            .map(Value::from)
            .unwrap_or_else(|| Value::from(i32::MAX));

        json!({
            "dev": "modbus_slave",
            "circuit": self.circuit,
            "slave_id": self.unit_id,
            "modbus_type": self.transport,
            "modbus_spec": self.spec,
            "scan_interval": self.scan_interval,
            "last_comm": last_comm,
        })
    }
}
