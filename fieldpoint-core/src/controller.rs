//! Controller assembly: config + definitions in, running scan loops out.
//!
//! A failing bus or slave never takes the rest of the topology down:
//! disabled entries are skipped, a missing model definition or a broken
//! board parse is logged and isolated to that slave.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::board::parse_board;
use crate::bus::{BusHandle, ModbusBus};
use crate::config::ControllerConfig;
use crate::hwdef::DefinitionStore;
use crate::notify::ChangeNotifier;
use crate::registry::DeviceRegistry;
use crate::slave::Slave;

pub struct Controller {
    registry: Arc<DeviceRegistry>,
    slaves: Vec<Arc<Slave>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Build buses, slaves and their devices from the topology config.
    pub async fn from_config(
        config: &ControllerConfig,
        definitions: &DefinitionStore,
        registry: Arc<DeviceRegistry>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        let mut slaves = Vec::new();

        for (bus_name, bus_config) in &config.buses {
            if !bus_config.enabled {
                info!(bus = %bus_name, "Skipping disabled bus");
                continue;
            }

            let modbus = ModbusBus::new(
                bus_name.clone(),
                bus_config.connection.clone(),
                Duration::from_millis(bus_config.timeout_ms),
            );
            let transport = modbus.transport();
            let spec = modbus.spec();
            let bus: BusHandle = Arc::new(modbus);

            info!(bus = %bus_name, transport = %transport, spec = %spec, "Creating bus");

            for (device_name, slave_config) in &bus_config.devices {
                if !slave_config.enabled {
                    info!(device = %device_name, "Skipping disabled device");
                    continue;
                }

                let Some(definition) = definitions.get(&slave_config.model) else {
                    error!(
                        device = %device_name,
                        model = %slave_config.model,
                        "Model not found in loaded hardware definitions"
                    );
                    continue;
                };

                info!(device = %device_name, model = %slave_config.model, "Creating device");
                let slave = Arc::new(Slave::new(
                    device_name.clone(),
                    slave_config.slave_id,
                    slave_config.model.clone(),
                    bus.clone(),
                    transport,
                    spec.clone(),
                    slave_config.scan_frequency,
                    slave_config.scan_enabled,
                    notifier.clone(),
                ));

                match parse_board(&slave, &definition, &registry).await {
                    Ok(()) => slaves.push(slave),
                    Err(e) => {
                        error!(
                            device = %device_name,
                            error = %e,
                            "Board parse failed, slave will not be scanned"
                        );
                    }
                }
            }
        }

        Self {
            registry,
            slaves,
            tasks: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn slaves(&self) -> &[Arc<Slave>] {
        &self.slaves
    }

    /// Start the scan loop of every scan-enabled slave.
    pub fn start(&mut self) {
        for slave in &self.slaves {
            if let Some(task) = slave.start_scanning() {
                self.tasks.push(task);
            }
        }
        info!(slaves = self.tasks.len(), "Controller scanning");
    }

    /// Stop all scan loops: cooperative flag first, then abort whatever is
    /// still sleeping out its interval.
    pub async fn stop(&mut self) {
        for slave in &self.slaves {
            slave.stop_scanning();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::hwdef::HardwareDefinition;
    use crate::notify::LogNotifier;

    fn definitions() -> DefinitionStore {
        let mut store = DefinitionStore::new();
        let def: HardwareDefinition = json5::from_str(
            r#"{
                register_blocks: [{ start_reg: 0, count: 4 }],
                features: [{ type: "RO", count: 2, val_reg: 0, val_coil: 0 }],
            }"#,
        )
        .unwrap();
        store.insert("M203", def);
        store
    }

    #[tokio::test]
    async fn test_topology_isolation() {
        // One good slave, one with an unknown model, one disabled; plus a
        // whole disabled bus. Only the good slave survives.
        let config: ControllerConfig = json5::from_str(
            r#"{
                buses: {
                    local: {
                        connection: { type: "tcp", host: "127.0.0.1", port: 1 },
                        timeout_ms: 50,
                        devices: {
                            plc01: { slave_id: 1, model: "M203" },
                            ghost: { slave_id: 2, model: "NOPE" },
                            off: { slave_id: 3, model: "M203", enabled: false },
                        }
                    },
                    dark: {
                        connection: { type: "tcp", host: "127.0.0.1", port: 1 },
                        enabled: false,
                        devices: {
                            plc09: { slave_id: 9, model: "M203" },
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        let registry = Arc::new(DeviceRegistry::new());
        let controller = Controller::from_config(
            &config,
            &definitions(),
            registry.clone(),
            Arc::new(LogNotifier),
        )
        .await;

        assert_eq!(controller.slaves().len(), 1);
        assert_eq!(controller.slaves()[0].circuit(), "plc01");
        assert_eq!(registry.all().len(), 2);
    }
}
