//! Started services over a scripted backend.

use crate::backend::ScriptedBackend;
use modelhost_backend::DeviceInventory;
use modelhost_foundation::ModelService;
use modelhost_kernel::{ManualClock, ServiceConfig, ServiceResult, WorkerPoolConfig};
use std::sync::Arc;
use tempfile::TempDir;

/// CPU-only configuration with `num_workers` general workers and short
/// timeouts suited to tests.
pub fn service_config(num_workers: usize) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.worker_pool = WorkerPoolConfig {
        enabled: num_workers > 0,
        num_workers,
        devices: vec!["cpu".to_string()],
        queue_timeout: 0.05,
        task_timeout: 10.0,
        shutdown_grace_period: 2.0,
        max_workers: 8,
        ..WorkerPoolConfig::default()
    };
    config.lifecycle.release_poll_interval_ms = 10;
    config
}

pub struct ServiceFixture {
    pub service: Arc<ModelService>,
    pub backend: ScriptedBackend,
    pub clock: Arc<ManualClock>,
    data_dir: TempDir,
}

impl ServiceFixture {
    /// Build and start a service on a fresh data directory.
    pub async fn start(config: ServiceConfig) -> ServiceResult<Self> {
        Self::start_with(config, ScriptedBackend::new()).await
    }

    pub async fn start_with(
        mut config: ServiceConfig,
        backend: ScriptedBackend,
    ) -> ServiceResult<Self> {
        let data_dir = tempfile::tempdir()
            .map_err(|e| modelhost_kernel::ServiceError::internal(e.to_string()))?;
        config.paths.data_dir = data_dir.path().to_path_buf();
        let clock = ManualClock::shared(1_000_000);

        let service = ModelService::builder(config)
            .with_backend(Arc::new(backend.clone()))
            .with_inventory(DeviceInventory::cpu_only())
            .with_clock(clock.clone())
            .build()?;
        service.start().await?;

        Ok(Self {
            service: Arc::new(service),
            backend,
            clock,
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &std::path::Path {
        self.data_dir.path()
    }

    pub async fn stop(self) {
        self.service.stop().await;
    }
}
