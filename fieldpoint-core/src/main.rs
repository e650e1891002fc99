//! Fieldpoint controller daemon.
//!
//! Loads the topology config, hardware definitions and the alias file, builds
//! the controller and scans until Ctrl+C. Alias persistence is wired here:
//! force-saves write immediately, dirty marks are flushed periodically and on
//! shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use fieldpoint_common::LoggingConfig;
use fieldpoint_core::config::ControllerConfig;
use fieldpoint_core::hwdef::DefinitionStore;
use fieldpoint_core::notify::LogNotifier;
use fieldpoint_core::registry::{DeviceRegistry, load_aliases, save_aliases};
use fieldpoint_core::Controller;

/// Flush interval for batched ("dirty") alias changes.
const ALIAS_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Fieldpoint Modbus I/O controller.
#[derive(Parser, Debug)]
#[command(name = "fieldpointd")]
#[command(about = "Scans Modbus I/O devices into a live device model")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "fieldpoint.json5")]
    config: PathBuf,

    /// Override the hardware definition directory.
    #[arg(long)]
    definitions: Option<PathBuf>,

    /// Override the alias file path.
    #[arg(long)]
    aliases: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ControllerConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    fieldpoint_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting fieldpointd");
    info!("Loaded configuration from {:?}", args.config);

    // Load hardware definitions
    let definitions_dir = args
        .definitions
        .clone()
        .unwrap_or_else(|| config.definitions.dir.clone());
    let definitions = DefinitionStore::load_dir(&definitions_dir)
        .with_context(|| format!("Failed to load definitions from {:?}", definitions_dir))?;
    info!(
        "Loaded hardware definitions: {}",
        definitions.models().collect::<Vec<_>>().join(", ")
    );

    // Load aliases and build the registry
    let alias_file = args.aliases.clone().or_else(|| config.aliases.file.clone());
    let registry = match &alias_file {
        Some(path) => {
            let initial = load_aliases(path)
                .with_context(|| format!("Failed to load aliases from {:?}", path))?;
            Arc::new(DeviceRegistry::with_aliases(initial))
        }
        None => Arc::new(DeviceRegistry::new()),
    };

    // Wire alias persistence: force-save writes now, dirty is batched.
    let alias_dirty = Arc::new(AtomicBool::new(false));
    if let Some(path) = alias_file.clone() {
        {
            let dirty = alias_dirty.clone();
            registry.aliases().on_dirty(move || {
                dirty.store(true, Ordering::SeqCst);
            });
        }
        {
            let weak = Arc::downgrade(&registry);
            let path = path.clone();
            registry.aliases().on_force_save(move || {
                if let Some(registry) = weak.upgrade() {
                    if let Err(e) = save_aliases(&registry.aliases().to_save_map(), &path) {
                        error!(error = %e, "Failed to save alias file");
                    }
                }
            });
        }

        let dirty = alias_dirty.clone();
        let flush_registry = registry.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ALIAS_FLUSH_INTERVAL).await;
                if dirty.swap(false, Ordering::SeqCst) {
                    if let Err(e) =
                        save_aliases(&flush_registry.aliases().to_save_map(), &path)
                    {
                        error!(error = %e, "Failed to flush alias file");
                        dirty.store(true, Ordering::SeqCst);
                    }
                }
            }
        });
    }

    // Build the topology and start scanning
    let mut controller = Controller::from_config(
        &config,
        &definitions,
        registry.clone(),
        Arc::new(LogNotifier),
    )
    .await;

    if controller.slaves().is_empty() {
        info!("No scannable slaves configured");
    }
    controller.start();

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    controller.stop().await;

    // Flush pending alias changes before exiting.
    if alias_dirty.load(Ordering::SeqCst) {
        if let Some(path) = &alias_file {
            if let Err(e) = save_aliases(&registry.aliases().to_save_map(), path) {
                error!(error = %e, "Failed to save alias file on shutdown");
            }
        }
    }

    info!("fieldpointd stopped");
    Ok(())
}
