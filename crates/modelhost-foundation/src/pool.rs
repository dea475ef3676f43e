//! Worker pool: owns the worker set and the shared task queue.
//!
//! Routing is affinity-first. An idle worker already holding the model wins,
//! then an idle worker on the model's affinity device, then the configured
//! policy (`round_robin` or `least_busy`). Tasks no worker can take right
//! away go to the shared priority queue, where any worker may claim them.
//!
//! Each submission carries its own `oneshot` channel. The worker that runs
//! the task, or the operation that drops it, resolves that channel directly.

use crate::placement::{Affinity, AffinityMap, expand_devices, resolve_device};
use crate::queue::{QueuedTask, TaskQueue};
use crate::worker::{ModelWorker, WorkerContext, WorkerState, WorkerStatus};
use futures::future::join_all;
use modelhost_backend::{DeviceInventory, LoaderFactory};
use modelhost_kernel::{
    Device, DevicePreference, ErrorCode, LoadBalancing, ModelType, ServiceError, ServiceResult,
    SharedClock, WorkerPoolConfig, WorkerResult, WorkerTask,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of [`WorkerPool::ensure_workers`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureOutcome {
    pub model_id: String,
    pub device: Device,
    pub worker_ids: Vec<String>,
    pub workers_created: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleOutcome {
    pub previous: usize,
    pub current: usize,
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachOutcome {
    pub workers_stopped: usize,
    pub models_unloaded: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounts {
    pub tasks_dropped: usize,
    pub futures_cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub enabled: bool,
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<ServiceError>,
    pub load_balancing: LoadBalancing,
    pub devices: Vec<Device>,
    pub total_workers: usize,
    pub max_workers: usize,
    pub workers_by_state: BTreeMap<String, usize>,
    pub global_queue_depth: usize,
    pub workers: Vec<WorkerStatus>,
    pub models: BTreeMap<String, Affinity>,
}

struct PoolInner {
    config: WorkerPoolConfig,
    ctx: Arc<WorkerContext>,
    workers: RwLock<Vec<Arc<ModelWorker>>>,
    devices: RwLock<Vec<Device>>,
    rr_cursor: AtomicUsize,
    worker_seq: AtomicUsize,
    enabled: AtomicBool,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    disabled_reason: RwLock<Option<ServiceError>>,
    /// Serialises changes to the worker set.
    structure: tokio::sync::Mutex<()>,
}

/// Cheaply cloneable; all clones share the same workers and queues.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        factory: Arc<LoaderFactory>,
        inventory: Arc<DeviceInventory>,
        clock: SharedClock,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            factory,
            global_queue: Arc::new(TaskQueue::priority()),
            affinity: Arc::new(AffinityMap::new()),
            inventory,
            clock,
            queue_timeout: config.queue_timeout(),
            model_idle_timeout: config.model_idle_timeout(),
            require_gpu: config.require_gpu,
        });
        Self {
            inner: Arc::new(PoolInner {
                enabled: AtomicBool::new(config.enabled),
                config,
                ctx,
                workers: RwLock::new(Vec::new()),
                devices: RwLock::new(Vec::new()),
                rr_cursor: AtomicUsize::new(0),
                worker_seq: AtomicUsize::new(0),
                initialized: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                disabled_reason: RwLock::new(None),
                structure: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Enabled, initialised, not shutting down and with at least one live worker.
    pub fn is_usable(&self) -> bool {
        self.is_enabled()
            && self.is_initialized()
            && !self.inner.shutting_down.load(Ordering::SeqCst)
            && self.live_worker_count() > 0
    }

    pub fn disabled_reason(&self) -> Option<ServiceError> {
        self.inner.disabled_reason.read().clone()
    }

    pub fn workers(&self) -> Vec<Arc<ModelWorker>> {
        self.inner.workers.read().clone()
    }

    fn live_workers(&self) -> Vec<Arc<ModelWorker>> {
        self.inner
            .workers
            .read()
            .iter()
            .filter(|w| w.state() != WorkerState::Shutdown)
            .cloned()
            .collect()
    }

    pub fn live_worker_count(&self) -> usize {
        self.live_workers().len()
    }

    pub fn affinity(&self, model_id: &str) -> Option<Affinity> {
        self.inner.ctx.affinity.get(model_id)
    }

    fn disable(&self, reason: ServiceError) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        *self.inner.disabled_reason.write() = Some(reason);
    }

    fn disabled_error(&self) -> ServiceError {
        let err = ServiceError::new(ErrorCode::WorkerPoolDisabled, "worker pool is disabled");
        match self.disabled_reason() {
            Some(reason) => err.with_detail("reason", reason.to_string()),
            None => err,
        }
    }

    fn spawn_worker(&self, device: Device, assigned_model: Option<&str>) -> Arc<ModelWorker> {
        let seq = self.inner.worker_seq.fetch_add(1, Ordering::SeqCst);
        let worker = ModelWorker::spawn(
            format!("worker-{seq}"),
            device,
            assigned_model.map(str::to_string),
            Arc::clone(&self.inner.ctx),
        );
        self.inner.workers.write().push(Arc::clone(&worker));
        worker
    }

    /// Validate devices and create the initial general-purpose workers.
    ///
    /// Device problems disable the pool and are returned as errors; the
    /// caller is expected to fall back to direct loading rather than abort.
    pub async fn initialize(&self) -> ServiceResult<usize> {
        let config = &self.inner.config;
        if !config.enabled {
            info!("Worker pool disabled by configuration");
            self.disable(ServiceError::new(
                ErrorCode::WorkerPoolDisabled,
                "worker pool disabled by configuration",
            ));
            return Ok(0);
        }

        let _guard = self.inner.structure.lock().await;
        if self.is_initialized() {
            return Ok(self.live_worker_count());
        }

        let devices = match expand_devices(
            &config.devices,
            &self.inner.ctx.inventory,
            config.require_gpu,
        ) {
            Ok(devices) => devices,
            Err(err) => {
                warn!(code = %err.code, error = %err.message, "Disabling worker pool");
                self.disable(err.clone());
                return Err(err);
            }
        };

        let count = config
            .num_workers
            .min(devices.len())
            .min(config.max_workers);
        let workers: Vec<_> = (0..count)
            .map(|i| self.spawn_worker(devices[i % devices.len()], None))
            .collect();
        *self.inner.devices.write() = devices.clone();
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        info!(
            workers = count,
            devices = ?devices,
            load_balancing = ?config.load_balancing,
            "Worker pool initialized"
        );

        if config.preload_embeddings && !workers.is_empty() {
            let model_id = config.default_embedding_model.clone();
            self.inner.ctx.affinity.insert(
                model_id.clone(),
                Affinity {
                    model_type: ModelType::Embedding,
                    preference: DevicePreference::Auto,
                    device: devices[0],
                },
            );
            let loads = workers
                .iter()
                .map(|w| w.load(&model_id, Some(ModelType::Embedding), true));
            for (worker, result) in workers.iter().zip(join_all(loads).await) {
                if let Err(err) = result {
                    warn!(
                        worker_id = worker.id(),
                        model_id = %model_id,
                        error = %err,
                        "Preload failed"
                    );
                }
            }
        }

        Ok(count)
    }

    /// Pick a worker for `model_id`, or `None` to use the shared queue.
    pub fn get_optimal_worker(&self, model_id: &str) -> Option<Arc<ModelWorker>> {
        let live = self.live_workers();
        if live.is_empty() {
            return None;
        }

        let assigned: Vec<_> = live
            .iter()
            .filter(|w| w.assigned_model() == Some(model_id))
            .cloned()
            .collect();
        let candidates = if !assigned.is_empty() {
            assigned
        } else {
            let general: Vec<_> = live
                .iter()
                .filter(|w| w.assigned_model().is_none())
                .cloned()
                .collect();
            if general.is_empty() { live } else { general }
        };

        if let Some(worker) = candidates
            .iter()
            .find(|w| w.state() == WorkerState::Idle && w.holds_model(model_id))
        {
            return Some(Arc::clone(worker));
        }
        if let Some(affinity) = self.inner.ctx.affinity.get(model_id) {
            if let Some(worker) = candidates
                .iter()
                .find(|w| w.state() == WorkerState::Idle && w.device() == affinity.device)
            {
                return Some(Arc::clone(worker));
            }
        }

        match self.inner.config.load_balancing {
            LoadBalancing::RoundRobin => {
                let n = candidates.len();
                let start = self.inner.rr_cursor.fetch_add(1, Ordering::SeqCst) % n;
                (0..n)
                    .map(|offset| &candidates[(start + offset) % n])
                    .find(|w| w.state() == WorkerState::Idle)
                    .cloned()
            }
            LoadBalancing::LeastBusy => candidates
                .iter()
                .filter(|w| w.state() != WorkerState::Error)
                .min_by_key(|w| w.pending_load())
                .cloned(),
        }
    }

    /// Route a task and wait for its result, bounded by `task_timeout`.
    ///
    /// A task the worker ran but that failed is `Ok` with `success == false`;
    /// `Err` means the pool could not get a result at all.
    pub async fn submit_task(&self, task: WorkerTask) -> ServiceResult<WorkerResult> {
        self.submit_task_with_timeout(task, self.inner.config.task_timeout())
            .await
    }

    pub async fn submit_task_with_timeout(
        &self,
        task: WorkerTask,
        timeout: Duration,
    ) -> ServiceResult<WorkerResult> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ServiceError::new(
                ErrorCode::PoolShutdown,
                "worker pool is shutting down",
            ));
        }
        if !self.is_enabled() {
            return Err(self.disabled_error());
        }
        if self.live_worker_count() == 0 {
            return Err(ServiceError::new(
                ErrorCode::WorkerPoolProcessingFailed,
                "worker pool has no running workers",
            ));
        }

        let task_id = task.task_id.clone();
        let model_id = task.model_id.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let entry = QueuedTask::new(task, tx);
        match self.get_optimal_worker(&model_id) {
            Some(worker) => {
                debug!(task_id = %task_id, model_id = %model_id, worker_id = worker.id(), "Routed task");
                worker.enqueue(entry);
            }
            None => {
                debug!(task_id = %task_id, model_id = %model_id, "Queued task on shared queue");
                self.inner.ctx.global_queue.push(entry);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ServiceError::new(
                ErrorCode::WorkerPoolProcessingFailed,
                "worker exited before producing a result",
            )
            .with_details(json!({ "task_id": task_id, "model_id": model_id }))),
            Err(_) => {
                self.remove_queued(&task_id);
                warn!(
                    task_id = %task_id,
                    model_id = %model_id,
                    timeout_s = timeout.as_secs_f64(),
                    "Task timed out"
                );
                Err(ServiceError::new(
                    ErrorCode::TaskTimeout,
                    format!("task did not complete within {:.1}s", timeout.as_secs_f64()),
                )
                .with_details(json!({
                    "task_id": task_id,
                    "model_id": model_id,
                    "timeout_seconds": timeout.as_secs_f64(),
                })))
            }
        }
    }

    fn remove_queued(&self, task_id: &str) -> bool {
        if self.inner.ctx.global_queue.remove_task(task_id).is_some() {
            return true;
        }
        self.workers()
            .iter()
            .any(|w| w.remove_task(task_id).is_some())
    }

    /// Make sure `count` workers are dedicated to `model_id` and have it loaded.
    ///
    /// Idempotent: existing dedicated workers count toward `count`.
    pub async fn ensure_workers(
        &self,
        model_id: &str,
        model_type: ModelType,
        preference: DevicePreference,
        count: usize,
    ) -> ServiceResult<EnsureOutcome> {
        if !self.is_enabled() {
            return Err(self.disabled_error());
        }
        let max_workers = self.inner.config.max_workers;
        if count == 0 || count > max_workers {
            return Err(ServiceError::new(
                ErrorCode::InvalidWorkerCount,
                format!("worker count must be between 1 and {max_workers}, got {count}"),
            )
            .with_details(json!({ "requested": count, "max_workers": max_workers })));
        }

        let guard = self.inner.structure.lock().await;
        let inventory = &self.inner.ctx.inventory;
        let first_device = self.inner.devices.read().first().copied();
        let device = match (preference, first_device) {
            (DevicePreference::Auto, Some(first)) => first,
            _ => resolve_device(preference, None, inventory, self.inner.config.require_gpu)?,
        };
        if !inventory.is_available(&device) {
            return Err(ServiceError::new(
                ErrorCode::NoDevicesAvailable,
                format!("device {device} is not available"),
            )
            .with_details(json!({ "model_id": model_id, "device": device.to_string() })));
        }

        self.inner.ctx.affinity.insert(
            model_id,
            Affinity {
                model_type,
                preference,
                device,
            },
        );

        let existing: Vec<_> = self
            .live_workers()
            .into_iter()
            .filter(|w| w.assigned_model() == Some(model_id))
            .collect();
        let missing = count.saturating_sub(existing.len());
        let live = self.live_worker_count();
        if live + missing > max_workers {
            return Err(ServiceError::new(
                ErrorCode::WorkerCreationFailed,
                format!("creating {missing} workers would exceed max_workers {max_workers}"),
            )
            .with_details(json!({
                "model_id": model_id,
                "live_workers": live,
                "requested": missing,
                "max_workers": max_workers,
            })));
        }

        let created: Vec<_> = (0..missing)
            .map(|_| self.spawn_worker(device, Some(model_id)))
            .collect();
        drop(guard);
        if !created.is_empty() {
            info!(model_id, %device, created = created.len(), "Created model workers");
        }

        let targets: Vec<_> = existing.iter().chain(created.iter()).cloned().collect();
        let loads = targets
            .iter()
            .map(|w| w.load(model_id, Some(model_type), false));
        let failure = join_all(loads).await.into_iter().find_map(Result::err);

        if let Some(cause) = failure {
            let ids: Vec<String> = created.iter().map(|w| w.id().to_string()).collect();
            self.retire_workers(&ids).await;
            return Err(ServiceError::new(
                ErrorCode::WorkerCreationFailed,
                format!("failed to start workers for '{model_id}'"),
            )
            .with_details(json!({
                "model_id": model_id,
                "device": device.to_string(),
                "cause_code": cause.code,
                "cause": cause.message,
                "cause_details": cause.details,
            })));
        }

        Ok(EnsureOutcome {
            model_id: model_id.to_string(),
            device,
            worker_ids: targets.iter().map(|w| w.id().to_string()).collect(),
            workers_created: created.len(),
        })
    }

    /// Remove workers from the set, stop them and hand their queued tasks
    /// back to the shared queue.
    async fn retire_workers(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let retired: Vec<Arc<ModelWorker>> = {
            let mut workers = self.inner.workers.write();
            let (retired, kept) = workers
                .drain(..)
                .partition(|w| ids.iter().any(|id| id == w.id()));
            *workers = kept;
            retired
        };

        let grace = self.inner.config.shutdown_grace_period();
        join_all(retired.iter().map(|w| w.stop(grace))).await;

        for worker in &retired {
            for entry in worker.drain_queue_where(|_| true) {
                self.inner.ctx.global_queue.push(entry);
            }
        }
        retired.len()
    }

    /// Add or remove workers until `target` are live.
    ///
    /// Added workers are general-purpose. Removal prefers general, idle,
    /// lightly loaded workers.
    pub async fn scale_workers(&self, target: usize) -> ServiceResult<ScaleOutcome> {
        if !self.is_enabled() {
            return Err(self.disabled_error());
        }
        let max_workers = self.inner.config.max_workers;
        if target > max_workers {
            return Err(ServiceError::new(
                ErrorCode::InvalidWorkerCount,
                format!("target {target} exceeds max_workers {max_workers}"),
            ));
        }

        let _guard = self.inner.structure.lock().await;
        let live = self.live_workers();
        let previous = live.len();
        let mut outcome = ScaleOutcome {
            previous,
            current: previous,
            added: 0,
            removed: 0,
        };

        if target > previous {
            let devices = self.inner.devices.read().clone();
            let devices = if devices.is_empty() {
                vec![Device::Cpu]
            } else {
                devices
            };
            for i in previous..target {
                self.spawn_worker(devices[i % devices.len()], None);
            }
            outcome.added = target - previous;
        } else if target < previous {
            let mut ranked = live;
            ranked.sort_by_key(|w| {
                (
                    w.assigned_model().is_some(),
                    w.state() != WorkerState::Idle,
                    w.pending_load(),
                )
            });
            let ids: Vec<String> = ranked
                .iter()
                .take(previous - target)
                .map(|w| w.id().to_string())
                .collect();
            outcome.removed = self.retire_workers(&ids).await;
        }

        outcome.current = self.live_worker_count();
        info!(
            previous = outcome.previous,
            current = outcome.current,
            added = outcome.added,
            removed = outcome.removed,
            "Scaled worker pool"
        );
        Ok(outcome)
    }

    async fn detach_model(&self, model_id: &str, forget: bool) -> DetachOutcome {
        let _guard = self.inner.structure.lock().await;
        let dedicated: Vec<String> = self
            .workers()
            .iter()
            .filter(|w| w.assigned_model() == Some(model_id))
            .map(|w| w.id().to_string())
            .collect();
        let workers_stopped = self.retire_workers(&dedicated).await;

        let holders: Vec<_> = self
            .live_workers()
            .into_iter()
            .filter(|w| w.holds_model(model_id))
            .collect();
        let models_unloaded = join_all(holders.iter().map(|w| w.unload(Some(model_id))))
            .await
            .into_iter()
            .filter(|unloaded| *unloaded)
            .count();

        if forget {
            self.inner.ctx.affinity.remove(model_id);
        }
        DetachOutcome {
            workers_stopped,
            models_unloaded,
        }
    }

    /// Stop the model's dedicated workers, unload it elsewhere and forget
    /// its placement.
    pub async fn release_model_workers(&self, model_id: &str) -> DetachOutcome {
        let outcome = self.detach_model(model_id, true).await;
        info!(
            model_id,
            workers_stopped = outcome.workers_stopped,
            models_unloaded = outcome.models_unloaded,
            "Released model workers"
        );
        outcome
    }

    /// Like [`release_model_workers`](Self::release_model_workers) but keeps
    /// the placement so the model can be provisioned again.
    pub async fn evict_model(&self, model_id: &str) -> DetachOutcome {
        self.detach_model(model_id, false).await
    }

    /// Fail every queued task for `model_id` with `TASK_DROPPED`.
    pub fn drop_model_tasks(&self, model_id: &str, reason: &str) -> DropCounts {
        let mut drained = self
            .inner
            .ctx
            .global_queue
            .drain_where(|q| q.task.model_id == model_id);
        for worker in self.workers() {
            drained.extend(worker.drain_queue_where(|q| q.task.model_id == model_id));
        }

        let mut counts = DropCounts {
            tasks_dropped: drained.len(),
            futures_cancelled: 0,
        };
        for entry in drained {
            let task_id = entry.task.task_id.clone();
            if entry.fail("pool", ServiceError::task_dropped(&task_id, reason)) {
                counts.futures_cancelled += 1;
            }
        }
        if counts.tasks_dropped > 0 {
            info!(
                model_id,
                reason,
                tasks_dropped = counts.tasks_dropped,
                futures_cancelled = counts.futures_cancelled,
                "Dropped queued tasks"
            );
        }
        counts
    }

    /// Queued plus in-flight tasks for `model_id`.
    pub fn pending_for_model(&self, model_id: &str) -> usize {
        self.inner.ctx.global_queue.len_for_model(model_id)
            + self
                .workers()
                .iter()
                .map(|w| w.pending_for_model(model_id))
                .sum::<usize>()
    }

    /// Stop every worker and fail whatever is still queued.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.inner.structure.lock().await;
        let workers = std::mem::take(&mut *self.inner.workers.write());
        let grace = self.inner.config.shutdown_grace_period();
        join_all(workers.iter().map(|w| w.stop(grace))).await;

        let mut leftovers = self.inner.ctx.global_queue.drain_all();
        for worker in &workers {
            leftovers.extend(worker.drain_queue_where(|_| true));
        }
        let failed = leftovers.len();
        for entry in leftovers {
            entry.fail(
                "pool",
                ServiceError::new(ErrorCode::PoolShutdown, "worker pool shut down"),
            );
        }

        self.inner.initialized.store(false, Ordering::SeqCst);
        info!(workers = workers.len(), tasks_failed = failed, "Worker pool shut down");
    }

    pub fn status(&self) -> PoolStatus {
        let workers: Vec<WorkerStatus> = self.workers().iter().map(|w| w.status()).collect();
        let mut workers_by_state = BTreeMap::new();
        for worker in &workers {
            *workers_by_state
                .entry(worker.state.to_string())
                .or_insert(0) += 1;
        }
        PoolStatus {
            enabled: self.is_enabled(),
            initialized: self.is_initialized(),
            disabled_reason: self.disabled_reason(),
            load_balancing: self.inner.config.load_balancing,
            devices: self.inner.devices.read().clone(),
            total_workers: workers.len(),
            max_workers: self.inner.config.max_workers,
            workers_by_state,
            global_queue_depth: self.inner.ctx.global_queue.len(),
            workers,
            models: self.inner.ctx.affinity.snapshot().into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelhost_backend::SimulatedBackend;
    use modelhost_kernel::ManualClock;

    struct Fixture {
        pool: WorkerPool,
        backend: SimulatedBackend,
        _dir: tempfile::TempDir,
    }

    fn fixture(
        config: WorkerPoolConfig,
        backend: SimulatedBackend,
        inventory: DeviceInventory,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(LoaderFactory::with_defaults(
            Arc::new(backend.clone()),
            dir.path(),
        ));
        let pool = WorkerPool::new(
            config,
            factory,
            Arc::new(inventory),
            ManualClock::shared(1_000_000),
        );
        Fixture {
            pool,
            backend,
            _dir: dir,
        }
    }

    fn config(num_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers,
            queue_timeout: 0.02,
            task_timeout: 5.0,
            shutdown_grace_period: 1.0,
            ..Default::default()
        }
    }

    fn embed(model: &str) -> WorkerTask {
        WorkerTask::embedding(model, vec!["hello".into()], 0)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn initialize_caps_workers_at_device_count() {
        let f = fixture(
            WorkerPoolConfig {
                devices: vec!["auto".into()],
                ..config(4)
            },
            SimulatedBackend::new(),
            DeviceInventory::with_accelerators(2),
        );
        assert_eq!(f.pool.initialize().await.unwrap(), 2);
        let status = f.pool.status();
        assert_eq!(status.total_workers, 2);
        assert_eq!(status.devices, vec![Device::Cuda(0), Device::Cuda(1)]);
        assert_eq!(status.workers[0].device, Device::Cuda(0));
        assert_eq!(status.workers[1].device, Device::Cuda(1));
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn require_gpu_without_accelerator_disables_pool() {
        let f = fixture(
            WorkerPoolConfig {
                require_gpu: true,
                ..config(1)
            },
            SimulatedBackend::new(),
            DeviceInventory::cpu_only(),
        );
        let err = f.pool.initialize().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoDevicesAvailable);
        assert!(!f.pool.is_enabled());
        assert!(!f.pool.is_usable());

        let err = f.pool.submit_task(embed("bge")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkerPoolDisabled);
    }

    #[tokio::test]
    async fn disabled_by_config() {
        let f = fixture(
            WorkerPoolConfig {
                enabled: false,
                ..config(2)
            },
            SimulatedBackend::new(),
            DeviceInventory::cpu_only(),
        );
        assert_eq!(f.pool.initialize().await.unwrap(), 0);
        assert!(!f.pool.is_enabled());
        assert_eq!(f.pool.live_worker_count(), 0);
    }

    #[tokio::test]
    async fn every_task_gets_exactly_its_own_result() {
        let f = fixture(config(1), SimulatedBackend::new(), DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();
        f.pool.scale_workers(3).await.unwrap();

        let tasks: Vec<WorkerTask> = (0..20)
            .map(|i| WorkerTask::embedding(format!("bge-{}", i % 3), vec![format!("t{i}")], 0))
            .collect();
        let ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
        let results = join_all(tasks.into_iter().map(|t| {
            let pool = f.pool.clone();
            async move { pool.submit_task(t).await }
        }))
        .await;

        for (id, result) in ids.iter().zip(results) {
            let result = result.unwrap();
            assert!(result.success);
            assert_eq!(&result.task_id, id);
        }
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn round_robin_cycles_and_skips_unavailable_workers() {
        let f = fixture(config(1), SimulatedBackend::new(), DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();
        f.pool.scale_workers(3).await.unwrap();
        let ids: Vec<String> = f.pool.workers().iter().map(|w| w.id().to_string()).collect();

        let picks: Vec<String> = (0..6)
            .map(|_| f.pool.get_optimal_worker("unplaced").unwrap().id().to_string())
            .collect();
        for id in &ids {
            assert_eq!(picks.iter().filter(|p| *p == id).count(), 2);
        }
        assert_ne!(picks[0], picks[1]);
        assert_ne!(picks[1], picks[2]);

        let stopped = f.pool.workers()[1].clone();
        stopped.stop(Duration::from_secs(1)).await;
        for _ in 0..6 {
            let pick = f.pool.get_optimal_worker("unplaced").unwrap();
            assert_ne!(pick.id(), stopped.id());
        }
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn round_robin_skips_busy_workers() {
        let backend = SimulatedBackend::new().with_inference_latency(Duration::from_millis(400));
        let f = fixture(config(1), backend, DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();
        f.pool.scale_workers(2).await.unwrap();

        let pool = f.pool.clone();
        let busy = tokio::spawn(async move { pool.submit_task(embed("bge-a")).await });
        wait_until(|| {
            f.pool
                .workers()
                .iter()
                .any(|w| w.state() == WorkerState::Busy)
        })
        .await;

        let busy_id = f
            .pool
            .workers()
            .iter()
            .find(|w| w.state() == WorkerState::Busy)
            .map(|w| w.id().to_string())
            .unwrap();
        for _ in 0..4 {
            let pick = f.pool.get_optimal_worker("bge-b").unwrap();
            assert_ne!(pick.id(), busy_id);
        }
        assert!(busy.await.unwrap().unwrap().success);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn least_busy_prefers_fewest_pending() {
        let backend = SimulatedBackend::new().with_inference_latency(Duration::from_millis(400));
        let f = fixture(
            WorkerPoolConfig {
                load_balancing: LoadBalancing::LeastBusy,
                ..config(1)
            },
            backend,
            DeviceInventory::cpu_only(),
        );
        f.pool.initialize().await.unwrap();
        f.pool.scale_workers(2).await.unwrap();

        let pool = f.pool.clone();
        let busy = tokio::spawn(async move { pool.submit_task(embed("bge-a")).await });
        wait_until(|| f.pool.workers().iter().any(|w| w.pending_load() == 1)).await;

        let loaded = f
            .pool
            .workers()
            .iter()
            .find(|w| w.pending_load() == 1)
            .map(|w| w.id().to_string())
            .unwrap();
        let pick = f.pool.get_optimal_worker("bge-b").unwrap();
        assert_ne!(pick.id(), loaded);
        busy.await.unwrap().unwrap();
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn affinity_prefers_worker_holding_model() {
        let f = fixture(config(1), SimulatedBackend::new(), DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();
        f.pool.scale_workers(3).await.unwrap();

        let first = f.pool.submit_task(embed("bge-a")).await.unwrap();
        for _ in 0..3 {
            let pick = f.pool.get_optimal_worker("bge-a").unwrap();
            assert_eq!(pick.id(), first.worker_id);
        }
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn ensure_workers_is_idempotent() {
        let f = fixture(config(1), SimulatedBackend::new(), DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();

        let first = f
            .pool
            .ensure_workers("m1", ModelType::Embedding, DevicePreference::Cpu, 2)
            .await
            .unwrap();
        assert_eq!(first.workers_created, 2);
        assert_eq!(first.device, Device::Cpu);

        let second = f
            .pool
            .ensure_workers("m1", ModelType::Embedding, DevicePreference::Cpu, 2)
            .await
            .unwrap();
        assert_eq!(second.workers_created, 0);
        assert_eq!(second.worker_ids, first.worker_ids);
        assert_eq!(f.pool.live_worker_count(), 3);

        for id in &first.worker_ids {
            let worker = f.pool.workers().into_iter().find(|w| w.id() == id).unwrap();
            assert_eq!(worker.current_model().as_deref(), Some("m1"));
        }

        let result = f.pool.submit_task(embed("m1")).await.unwrap();
        assert!(first.worker_ids.contains(&result.worker_id));
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn ensure_workers_validates_count_and_device() {
        let f = fixture(config(1), SimulatedBackend::new(), DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();

        let err = f
            .pool
            .ensure_workers("m1", ModelType::Embedding, DevicePreference::Cpu, 0)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidWorkerCount);

        let err = f
            .pool
            .ensure_workers(
                "m1",
                ModelType::Embedding,
                DevicePreference::Explicit(Device::Cuda(0)),
                1,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NoDevicesAvailable);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn failed_warm_up_retires_new_workers() {
        let f = fixture(
            config(1),
            SimulatedBackend::new().with_failing_model("broken"),
            DeviceInventory::cpu_only(),
        );
        f.pool.initialize().await.unwrap();

        let err = f
            .pool
            .ensure_workers("broken", ModelType::Embedding, DevicePreference::Cpu, 2)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkerCreationFailed);
        assert_eq!(
            err.details.unwrap()["cause_code"],
            "EMBEDDING_MODEL_LOAD_ERROR"
        );
        assert_eq!(f.pool.live_worker_count(), 1);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn drop_model_tasks_cancels_every_waiter() {
        let backend = SimulatedBackend::new().with_inference_latency(Duration::from_millis(300));
        let f = fixture(config(1), backend, DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();

        let submit = |model: &str| {
            let pool = f.pool.clone();
            let task = embed(model);
            tokio::spawn(async move { pool.submit_task(task).await })
        };
        let running = submit("bge-a");
        wait_until(|| f.pool.pending_for_model("bge-a") == 1).await;
        let queued: Vec<_> = (0..3).map(|_| submit("bge-a")).collect();
        wait_until(|| f.pool.pending_for_model("bge-a") == 4).await;

        let counts = f.pool.drop_model_tasks("bge-a", "test");
        assert_eq!(counts.tasks_dropped, 3);
        assert_eq!(counts.futures_cancelled, 3);

        for handle in queued {
            let result = handle.await.unwrap().unwrap();
            assert!(!result.success);
            assert_eq!(result.error.unwrap().code, ErrorCode::TaskDropped);
        }
        assert!(running.await.unwrap().unwrap().success);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn result_wait_is_bounded() {
        let backend = SimulatedBackend::new().with_inference_latency(Duration::from_millis(500));
        let f = fixture(config(1), backend, DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();

        let err = f
            .pool
            .submit_task_with_timeout(embed("bge-a"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskTimeout);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn scale_up_and_down() {
        let f = fixture(config(1), SimulatedBackend::new(), DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();

        let up = f.pool.scale_workers(4).await.unwrap();
        assert_eq!((up.previous, up.current, up.added), (1, 4, 3));
        let down = f.pool.scale_workers(2).await.unwrap();
        assert_eq!((down.current, down.removed), (2, 2));

        let err = f.pool.scale_workers(99).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidWorkerCount);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn release_stops_dedicated_workers_and_forgets_placement() {
        let f = fixture(config(1), SimulatedBackend::new(), DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();
        f.pool
            .ensure_workers("m1", ModelType::Embedding, DevicePreference::Cpu, 2)
            .await
            .unwrap();

        let outcome = f.pool.release_model_workers("m1").await;
        assert_eq!(outcome.workers_stopped, 2);
        assert_eq!(f.pool.live_worker_count(), 1);
        assert!(f.pool.affinity("m1").is_none());
        assert_eq!(f.backend.live_handles(), 0);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_workers_and_rejects_new_work() {
        let f = fixture(config(1), SimulatedBackend::new(), DeviceInventory::cpu_only());
        f.pool.initialize().await.unwrap();
        assert!(f.pool.submit_task(embed("bge-a")).await.unwrap().success);

        f.pool.shutdown().await;
        assert_eq!(f.pool.live_worker_count(), 0);
        assert_eq!(f.backend.live_handles(), 0);
        let err = f.pool.submit_task(embed("bge-a")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PoolShutdown);
    }
}
