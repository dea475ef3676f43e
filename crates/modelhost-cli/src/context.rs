//! CLI context: effective configuration and a started model service.

use crate::cli::Cli;
use crate::error::CliResult;
use crate::output::OutputFormat;
use modelhost_backend::{DeviceInventory, SimulatedBackend};
use modelhost_foundation::ModelService;
use modelhost_kernel::ServiceConfig;
use std::sync::Arc;
use tracing::debug;

/// Resolve the configuration: `--config` file (with env overrides) or
/// defaults plus env overrides, then CLI flags on top.
pub fn load_config(cli: &Cli) -> CliResult<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            debug!(path = %path.display(), "loading configuration file");
            ServiceConfig::load(path)?
        }
        None => ServiceConfig::from_env()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.paths.data_dir = dir.clone();
    }
    Ok(config)
}

/// Shared context for commands that talk to a running service
pub struct CliContext {
    pub service: ModelService,
    pub format: OutputFormat,
}

impl CliContext {
    /// Build and start a service backed by the simulated backend.
    pub async fn start(cli: &Cli) -> CliResult<Self> {
        let config = load_config(cli)?;
        let inventory = if cli.cpu_only {
            DeviceInventory::cpu_only()
        } else {
            tokio::task::spawn_blocking(DeviceInventory::detect).await?
        };
        debug!(devices = ?inventory.devices(), "device inventory ready");

        let service = ModelService::builder(config)
            .with_backend(Arc::new(SimulatedBackend::new()))
            .with_inventory(inventory)
            .build()?;
        service.start().await?;

        Ok(Self {
            service,
            format: cli.output.unwrap_or_default(),
        })
    }

    pub async fn shutdown(self) {
        self.service.stop().await;
    }
}
