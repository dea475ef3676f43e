//! The model service facade.
//!
//! [`ModelService`] is constructed once per process and owns the pool, the
//! direct-load fallback, the lifecycle manager and the embedding cache.
//! Every public operation returns a [`ServiceResponse`].
//!
//! ```rust,ignore
//! let service = ModelServiceBuilder::new(config)
//!     .with_backend(Arc::new(SimulatedBackend::new()))
//!     .build()?;
//! service.start().await?;
//! service.register_model("m1", "embedding", 2, "cpu", None).await;
//! let resp = service.generate_embeddings(&["hello".into()], "m1").await;
//! ```

use crate::cache::{CacheStats, EmbeddingCache};
use crate::direct::{DirectModelManager, ReferenceSnapshot};
use crate::estimator::{MemoryEstimator, StaticMemoryTable};
use crate::lifecycle::{
    LifecycleManager, QueueDropOutcome, ReferenceOutcome, RegistrationOutcome, ReleaseOutcome,
};
use crate::pool::{PoolStatus, ScaleOutcome, WorkerPool};
use crate::registration::ModelRegistration;
use modelhost_backend::{
    DeviceInventory, DownloadStatus, LoaderFactory, ModelBackend, SimulatedBackend,
};
use modelhost_kernel::{
    DataPathProvider, Device, ErrorCode, GenerationParams, ModelType, ServiceConfig, ServiceError,
    ServiceResponse, ServiceResult, SharedClock, StaticDataPaths, SystemClock, TaskInput,
    TaskOutput, TaskTiming, WorkerTask,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub dimension: usize,
    pub model_id: String,
    pub cached: bool,
    /// Seconds.
    pub processing_time: f64,
    pub worker_id: Option<String>,
    pub device: Option<Device>,
    pub timing: Option<TaskTiming>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
    pub model_id: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub processing_time: f64,
    pub worker_id: Option<String>,
    pub device: Option<Device>,
    pub timing: TaskTiming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub started: bool,
    pub execution_mode: ExecutionMode,
    pub models: Vec<ModelRegistration>,
    pub cache: CacheStats,
    pub worker_pool: PoolStatus,
    pub direct_models: Vec<ReferenceSnapshot>,
    pub inventory: DeviceInventory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    WorkerPool,
    Direct,
}

struct Execution {
    output: TaskOutput,
    worker_id: Option<String>,
    device: Option<Device>,
    timing: TaskTiming,
}

pub struct ModelServiceBuilder {
    config: ServiceConfig,
    backend: Option<Arc<dyn ModelBackend>>,
    inventory: Option<DeviceInventory>,
    clock: Option<SharedClock>,
    estimator: Option<Arc<dyn MemoryEstimator>>,
    paths: Option<Arc<dyn DataPathProvider>>,
}

impl ModelServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            backend: None,
            inventory: None,
            clock: None,
            estimator: None,
            paths: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Skip hardware detection.
    pub fn with_inventory(mut self, inventory: DeviceInventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn MemoryEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_paths(mut self, paths: Arc<dyn DataPathProvider>) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Validate the configuration and wire the components together.
    ///
    /// Hardware detection runs here when no inventory was given.
    pub fn build(self) -> ServiceResult<ModelService> {
        self.config.validate()?;

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(SimulatedBackend::new()));
        let inventory = Arc::new(self.inventory.unwrap_or_else(DeviceInventory::detect));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(StaticMemoryTable::new()));
        let paths = self.paths.unwrap_or_else(|| {
            Arc::new(StaticDataPaths::new(self.config.paths.data_dir.clone()))
        });

        let factory = Arc::new(LoaderFactory::with_defaults(backend, paths.models_dir()));
        let pool = WorkerPool::new(
            self.config.worker_pool.clone(),
            Arc::clone(&factory),
            Arc::clone(&inventory),
            Arc::clone(&clock),
        );
        let direct = Arc::new(DirectModelManager::new(
            Arc::clone(&factory),
            Arc::clone(&inventory),
            Arc::clone(&clock),
            self.config.worker_pool.require_gpu,
        ));
        let lifecycle = LifecycleManager::new(
            self.config.lifecycle.clone(),
            pool.clone(),
            Arc::clone(&direct),
            estimator,
            Arc::clone(&clock),
        );
        let cache = EmbeddingCache::new(self.config.embedding_cache.clone(), Arc::clone(&clock));

        Ok(ModelService {
            config: self.config,
            factory,
            inventory,
            paths,
            clock,
            pool,
            direct,
            lifecycle,
            cache,
            started: AtomicBool::new(false),
        })
    }
}

pub struct ModelService {
    config: ServiceConfig,
    factory: Arc<LoaderFactory>,
    inventory: Arc<DeviceInventory>,
    paths: Arc<dyn DataPathProvider>,
    clock: SharedClock,
    pool: WorkerPool,
    direct: Arc<DirectModelManager>,
    lifecycle: LifecycleManager,
    cache: EmbeddingCache,
    started: AtomicBool,
}

impl ModelService {
    pub fn builder(config: ServiceConfig) -> ModelServiceBuilder {
        ModelServiceBuilder::new(config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Bring the pool up and start the idle scanner.
    ///
    /// A pool that cannot start (no usable device) is disabled with a
    /// warning; requests then run through direct loading.
    pub async fn start(&self) -> ServiceResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let models_dir = self.paths.models_dir();
        if let Err(e) = std::fs::create_dir_all(&models_dir) {
            warn!(path = %models_dir.display(), error = %e, "Could not create model cache directory");
        }

        match self.pool.initialize().await {
            Ok(workers) => info!(workers, "Worker pool ready"),
            Err(err) => warn!(
                code = %err.code,
                error = %err.message,
                "Worker pool unavailable, falling back to direct loading"
            ),
        }

        let pool_config = &self.config.worker_pool;
        if pool_config.preload_embeddings && self.pool.is_usable() {
            self.lifecycle.register_preloaded(
                &pool_config.default_embedding_model,
                ModelType::Embedding,
                self.pool.live_worker_count(),
            );
        }

        self.lifecycle.start_idle_scanner();
        info!(mode = ?self.execution_mode(), "Model service started");
        Ok(())
    }

    /// Stop the scanner and the pool and free directly loaded models.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.lifecycle.stop_idle_scanner().await;
        self.pool.shutdown().await;
        for reference in self.direct.snapshots() {
            self.direct.remove(&reference.model_id).await;
        }
        info!("Model service stopped");
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.pool.is_usable() {
            ExecutionMode::WorkerPool
        } else {
            ExecutionMode::Direct
        }
    }

    fn ensure_started(&self) -> ServiceResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ServiceError::new(
                ErrorCode::ServiceNotStarted,
                "model service has not been started",
            ))
        }
    }

    pub async fn register_model(
        &self,
        model_name: &str,
        model_type: &str,
        num_workers: usize,
        device: &str,
        requester: Option<&str>,
    ) -> ServiceResponse<RegistrationOutcome> {
        if let Err(err) = self.ensure_started() {
            return ServiceResponse::err(err);
        }
        self.lifecycle
            .register_model(model_name, model_type, num_workers, device, requester)
            .await
    }

    pub async fn release_model(
        &self,
        model_name: &str,
        wait_for_tasks: bool,
        timeout: Option<Duration>,
    ) -> ServiceResponse<ReleaseOutcome> {
        if let Err(err) = self.ensure_started() {
            return ServiceResponse::err(err);
        }
        self.lifecycle
            .release_model(model_name, wait_for_tasks, timeout)
            .await
            .into()
    }

    pub fn drop_model_queue(
        &self,
        model_name: &str,
        reason: &str,
    ) -> ServiceResponse<QueueDropOutcome> {
        if let Err(err) = self.ensure_started() {
            return ServiceResponse::err(err);
        }
        ServiceResponse::ok(self.lifecycle.drop_model_queue(model_name, reason))
    }

    pub fn release_reference(
        &self,
        model_name: &str,
        requester: Option<&str>,
    ) -> ServiceResponse<ReferenceOutcome> {
        self.lifecycle.release_reference(model_name, requester).into()
    }

    pub async fn scale_workers(&self, target: usize) -> ServiceResponse<ScaleOutcome> {
        if let Err(err) = self.ensure_started() {
            return ServiceResponse::err(err);
        }
        self.pool.scale_workers(target).await.into()
    }

    async fn execute(
        &self,
        model_id: &str,
        model_type: ModelType,
        input: TaskInput,
    ) -> ServiceResult<Execution> {
        self.lifecycle.ensure_ready(model_id, model_type).await?;

        let execution = if self.pool.is_usable() {
            let task = WorkerTask::new(model_id, input, self.clock.now_millis());
            let result = self.pool.submit_task(task).await?;
            let worker_id = result.worker_id.clone();
            let timing = result.timing;
            let device = result
                .metadata
                .get("device")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok());
            Execution {
                output: result.into_output()?,
                worker_id: Some(worker_id),
                device,
                timing,
            }
        } else {
            let preference = self
                .lifecycle
                .registration(model_id)
                .map(|r| r.device)
                .unwrap_or_default();
            let out = self
                .direct
                .execute(model_id, model_type, preference, input)
                .await?;
            Execution {
                output: out.output,
                worker_id: None,
                device: Some(out.device),
                timing: out.timing,
            }
        };

        self.lifecycle.record_served(model_id);
        Ok(execution)
    }

    /// Embed `texts`, serving whole batches from the cache when possible.
    pub async fn generate_embeddings(
        &self,
        texts: &[String],
        model_id: &str,
    ) -> ServiceResponse<EmbeddingResponse> {
        self.embeddings(texts, model_id).await.into()
    }

    async fn embeddings(
        &self,
        texts: &[String],
        model_id: &str,
    ) -> ServiceResult<EmbeddingResponse> {
        self.ensure_started()?;
        let started = Instant::now();
        if texts.is_empty() {
            return Ok(EmbeddingResponse {
                embeddings: Vec::new(),
                dimension: 0,
                model_id: model_id.to_string(),
                cached: false,
                processing_time: 0.0,
                worker_id: None,
                device: None,
                timing: None,
            });
        }

        if let Some(embeddings) = self.cache.get_embeddings(texts, model_id) {
            self.lifecycle.touch(model_id);
            let dimension = embeddings.first().map_or(0, Vec::len);
            return Ok(EmbeddingResponse {
                embeddings,
                dimension,
                model_id: model_id.to_string(),
                cached: true,
                processing_time: started.elapsed().as_secs_f64(),
                worker_id: None,
                device: None,
                timing: None,
            });
        }

        let input = TaskInput::Embedding {
            texts: texts.to_vec(),
        };
        let execution = self.execute(model_id, ModelType::Embedding, input).await?;
        let TaskOutput::Embeddings {
            embeddings,
            dimension,
        } = execution.output
        else {
            return Err(ServiceError::internal(format!(
                "'{model_id}' returned a non-embedding output"
            )));
        };
        self.cache.cache_embeddings(texts, model_id, &embeddings);

        Ok(EmbeddingResponse {
            embeddings,
            dimension,
            model_id: model_id.to_string(),
            cached: false,
            processing_time: started.elapsed().as_secs_f64(),
            worker_id: execution.worker_id,
            device: execution.device,
            timing: Some(execution.timing),
        })
    }

    pub async fn generate_text(
        &self,
        prompt: &str,
        model_id: &str,
        params: GenerationParams,
    ) -> ServiceResponse<TextResponse> {
        self.text(prompt, model_id, params).await.into()
    }

    async fn text(
        &self,
        prompt: &str,
        model_id: &str,
        params: GenerationParams,
    ) -> ServiceResult<TextResponse> {
        self.ensure_started()?;
        let started = Instant::now();
        let input = TaskInput::TextGeneration {
            prompt: prompt.to_string(),
            params,
        };
        let execution = self
            .execute(model_id, ModelType::TextGeneration, input)
            .await?;
        let TaskOutput::Text {
            text,
            prompt_tokens,
            completion_tokens,
        } = execution.output
        else {
            return Err(ServiceError::internal(format!(
                "'{model_id}' returned a non-text output"
            )));
        };

        Ok(TextResponse {
            text,
            model_id: model_id.to_string(),
            prompt_tokens,
            completion_tokens,
            processing_time: started.elapsed().as_secs_f64(),
            worker_id: execution.worker_id,
            device: execution.device,
            timing: execution.timing,
        })
    }

    /// Fetch model files into the local cache without loading them.
    pub async fn download_model(
        &self,
        model_id: &str,
        model_type: Option<ModelType>,
    ) -> ServiceResponse<DownloadStatus> {
        let factory = Arc::clone(&self.factory);
        let id = model_id.to_string();
        match tokio::task::spawn_blocking(move || factory.download_only(&id, model_type)).await {
            Ok(result) => result.into(),
            Err(e) => ServiceResponse::err(ServiceError::new(
                ErrorCode::DownloadFailed,
                format!("download task for '{model_id}' failed: {e}"),
            )),
        }
    }

    pub fn get_service_status(&self) -> ServiceResponse<ServiceStatus> {
        ServiceResponse::ok(ServiceStatus {
            started: self.is_started(),
            execution_mode: self.execution_mode(),
            models: self.lifecycle.registrations(),
            cache: self.cache.stats(),
            worker_pool: self.pool.status(),
            direct_models: self.direct.snapshots(),
            inventory: (*self.inventory).clone(),
        })
    }

    pub fn get_worker_pool_status(&self) -> ServiceResponse<PoolStatus> {
        ServiceResponse::ok(self.pool.status())
    }
}
