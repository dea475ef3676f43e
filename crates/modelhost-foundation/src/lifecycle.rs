//! Model registration, release and idle eviction.
//!
//! The registry holds at most one [`ModelRegistration`] per model name. It is
//! guarded by a lock that is never held across an await. Registration,
//! release, re-provisioning and idle eviction of one model are serialized by
//! a per-model async lock held across the whole operation, so a caller that
//! arrives while a model is being evicted or released waits for it to finish
//! and then sees the settled registry.

use crate::direct::DirectModelManager;
use crate::estimator::MemoryEstimator;
use crate::pool::WorkerPool;
use crate::registration::ModelRegistration;
use modelhost_kernel::{
    DevicePreference, ErrorCode, LifecycleConfig, ModelType, ServiceError, ServiceResponse,
    ServiceResult, SharedClock,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    pub model_name: String,
    pub model_type: ModelType,
    pub device: DevicePreference,
    pub new_registration: bool,
    pub reference_count: u32,
    pub workers: usize,
    pub workers_created: usize,
    pub loaded: bool,
    pub model_memory_gb: f64,
    pub worker_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub model_name: String,
    /// False when the drain wait timed out.
    pub drained: bool,
    pub waited_ms: u64,
    pub workers_stopped: usize,
    pub models_unloaded: usize,
    pub tasks_dropped: usize,
    pub futures_cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDropOutcome {
    pub model_name: String,
    pub tasks_dropped: usize,
    pub futures_cancelled: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceOutcome {
    pub model_name: String,
    pub reference_count: u32,
    pub requesters: Vec<String>,
}

struct Provisioned {
    worker_ids: Vec<String>,
    workers_created: usize,
}

struct LifecycleInner {
    config: LifecycleConfig,
    pool: WorkerPool,
    direct: Arc<DirectModelManager>,
    estimator: Arc<dyn MemoryEstimator>,
    clock: SharedClock,
    registry: RwLock<HashMap<String, ModelRegistration>>,
    model_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    scanner: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<LifecycleInner>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        pool: WorkerPool,
        direct: Arc<DirectModelManager>,
        estimator: Arc<dyn MemoryEstimator>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                pool,
                direct,
                estimator,
                clock,
                registry: RwLock::new(HashMap::new()),
                model_locks: Mutex::new(HashMap::new()),
                scanner: Mutex::new(None),
            }),
        }
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    pub fn estimate_model_memory(&self, model_name: &str, model_type: ModelType) -> f64 {
        self.inner.estimator.estimate_gb(model_name, model_type)
    }

    pub fn registration(&self, model_name: &str) -> Option<ModelRegistration> {
        self.inner.registry.read().get(model_name).cloned()
    }

    /// Every registration, sorted by name.
    pub fn registrations(&self) -> Vec<ModelRegistration> {
        let mut regs: Vec<_> = self.inner.registry.read().values().cloned().collect();
        regs.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        regs
    }

    pub fn is_registered(&self, model_name: &str) -> bool {
        self.inner.registry.read().contains_key(model_name)
    }

    /// Take the per-model lock that serializes registry changes for one
    /// model.
    async fn lock_model(&self, model_name: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.inner
                .model_locks
                .lock()
                .entry(model_name.to_string())
                .or_default(),
        );
        lock.lock_owned().await
    }

    /// Forget the lock of a released model unless someone is waiting on it.
    fn forget_model_lock(&self, model_name: &str) {
        let mut locks = self.inner.model_locks.lock();
        if locks
            .get(model_name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(model_name);
        }
    }

    fn pool_active(&self) -> bool {
        self.inner.pool.is_enabled() && self.inner.pool.is_initialized()
    }

    fn worker_ids_for(&self, model_name: &str) -> Vec<String> {
        self.inner
            .pool
            .workers()
            .iter()
            .filter(|w| w.assigned_model() == Some(model_name))
            .map(|w| w.id().to_string())
            .collect()
    }

    fn outcome(
        &self,
        reg: &ModelRegistration,
        new_registration: bool,
        provisioned: Option<&Provisioned>,
    ) -> RegistrationOutcome {
        RegistrationOutcome {
            model_name: reg.model_name.clone(),
            model_type: reg.model_type,
            device: reg.device,
            new_registration,
            reference_count: reg.reference_count,
            workers: reg.workers,
            workers_created: provisioned.map_or(0, |p| p.workers_created),
            loaded: reg.loaded,
            model_memory_gb: reg.model_memory_gb,
            worker_ids: provisioned
                .map(|p| p.worker_ids.clone())
                .unwrap_or_else(|| self.worker_ids_for(&reg.model_name)),
        }
    }

    /// Start `workers` workers for a model, or load it directly when the
    /// pool is not active. Directly loaded models keep one reference for
    /// the registration.
    async fn provision(
        &self,
        model_name: &str,
        model_type: ModelType,
        device: DevicePreference,
        workers: usize,
    ) -> ServiceResult<Provisioned> {
        if self.pool_active() {
            let outcome = self
                .inner
                .pool
                .ensure_workers(model_name, model_type, device, workers)
                .await?;
            Ok(Provisioned {
                worker_ids: outcome.worker_ids,
                workers_created: outcome.workers_created,
            })
        } else {
            self.inner
                .direct
                .acquire(model_name, model_type, device)
                .await?;
            Ok(Provisioned {
                worker_ids: Vec::new(),
                workers_created: 0,
            })
        }
    }

    /// Record the provisioning result on the registration.
    fn settle(
        &self,
        model_name: &str,
        result: &ServiceResult<Provisioned>,
    ) -> Option<ModelRegistration> {
        let now = self.now();
        let mut registry = self.inner.registry.write();
        let reg = registry.get_mut(model_name)?;
        reg.provisioning = false;
        match result {
            Ok(_) => reg.mark_loaded(now),
            Err(_) => reg.loaded = false,
        }
        Some(reg.clone())
    }

    /// Register a model, or add a reference to an existing registration.
    ///
    /// A repeat registration never creates workers. If provisioning fails the
    /// registration is kept with `loaded = false` and the response carries
    /// it alongside a `WORKER_CREATION_FAILED` error.
    pub async fn register_model(
        &self,
        model_name: &str,
        model_type: &str,
        num_workers: usize,
        device: &str,
        requester: Option<&str>,
    ) -> ServiceResponse<RegistrationOutcome> {
        let model_type: ModelType = match model_type.parse() {
            Ok(t) => t,
            Err(err) => return ServiceResponse::err(err),
        };
        let preference: DevicePreference = match device.parse() {
            Ok(p) => p,
            Err(err) => return ServiceResponse::err(err),
        };
        let max_workers = self.inner.pool.config().max_workers;
        if num_workers == 0 || (self.pool_active() && num_workers > max_workers) {
            return ServiceResponse::err(
                ServiceError::new(
                    ErrorCode::InvalidWorkerCount,
                    format!("num_workers must be between 1 and {max_workers}, got {num_workers}"),
                )
                .with_details(json!({ "model_name": model_name, "num_workers": num_workers })),
            );
        }

        let _guard = self.lock_model(model_name).await;
        let now = self.now();
        let (snapshot, new_registration, needs_provisioning) = {
            let mut registry = self.inner.registry.write();
            match registry.get_mut(model_name) {
                Some(reg) => {
                    reg.add_reference(requester, now);
                    let retry = !reg.loaded && !reg.provisioning;
                    if retry {
                        reg.provisioning = true;
                    }
                    (reg.clone(), false, retry)
                }
                None => {
                    let mut reg = ModelRegistration::new(
                        model_name,
                        model_type,
                        preference,
                        num_workers,
                        self.inner.config.default_keep_alive,
                        self.estimate_model_memory(model_name, model_type),
                        now,
                    );
                    reg.add_reference(requester, now);
                    reg.provisioning = true;
                    registry.insert(model_name.to_string(), reg.clone());
                    (reg, true, true)
                }
            }
        };

        if !needs_provisioning {
            debug!(
                model_name,
                reference_count = snapshot.reference_count,
                "Model already registered"
            );
            return ServiceResponse::ok(self.outcome(&snapshot, false, None));
        }

        info!(
            model_name,
            model_type = %snapshot.model_type,
            device = %snapshot.device,
            workers = snapshot.workers,
            memory_gb = snapshot.model_memory_gb,
            new_registration,
            "Provisioning model"
        );
        let result = self
            .provision(model_name, snapshot.model_type, snapshot.device, snapshot.workers)
            .await;

        if let Err(err) = &result {
            if new_registration && err.code.is_validation() {
                self.inner.registry.write().remove(model_name);
                return ServiceResponse::err(err.clone());
            }
        }

        let Some(settled) = self.settle(model_name, &result) else {
            return ServiceResponse::err(ServiceError::model_not_found(model_name));
        };
        match result {
            Ok(provisioned) => {
                info!(
                    model_name,
                    workers_created = provisioned.workers_created,
                    "Model registered"
                );
                ServiceResponse::ok(self.outcome(&settled, new_registration, Some(&provisioned)))
            }
            Err(cause) => {
                warn!(
                    model_name,
                    code = %cause.code,
                    error = %cause.message,
                    "Model provisioning failed, registration kept as not loaded"
                );
                let error = if cause.code == ErrorCode::WorkerCreationFailed {
                    cause
                } else {
                    ServiceError::new(
                        ErrorCode::WorkerCreationFailed,
                        format!("failed to provision '{model_name}'"),
                    )
                    .with_details(json!({
                        "model_name": model_name,
                        "device": settled.device.to_string(),
                        "cause_code": cause.code,
                        "cause": cause.message,
                    }))
                };
                ServiceResponse::partial(self.outcome(&settled, new_registration, None), error)
            }
        }
    }

    /// Register a model the service keeps resident for its whole lifetime.
    pub fn register_preloaded(&self, model_name: &str, model_type: ModelType, workers: usize) {
        let now = self.now();
        let mut reg = ModelRegistration::new(
            model_name,
            model_type,
            DevicePreference::Auto,
            workers,
            self.inner.config.default_keep_alive,
            self.estimate_model_memory(model_name, model_type),
            now,
        );
        reg.preloaded = true;
        reg.mark_loaded(now);
        self.inner
            .registry
            .write()
            .insert(model_name.to_string(), reg);
        info!(model_name, "Registered preloaded model");
    }

    /// Release a model entirely.
    ///
    /// With `wait_for_tasks`, waits for the model's queued and running tasks
    /// to finish, at most `timeout` (the configured default when `None`).
    /// Then stops its workers, drops whatever is still queued and deletes
    /// the registration.
    pub async fn release_model(
        &self,
        model_name: &str,
        wait_for_tasks: bool,
        timeout: Option<Duration>,
    ) -> ServiceResult<ReleaseOutcome> {
        let guard = self.lock_model(model_name).await;
        if !self.is_registered(model_name) {
            return Err(ServiceError::model_not_found(model_name));
        }

        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_release_timeout());
        let poll = self.inner.config.release_poll_interval();
        let started = Instant::now();
        let mut drained = true;
        if wait_for_tasks {
            loop {
                let pending = self.inner.pool.pending_for_model(model_name);
                if pending == 0 {
                    break;
                }
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    warn!(
                        model_name,
                        pending,
                        timeout_s = timeout.as_secs_f64(),
                        "Drain timed out, releasing model anyway"
                    );
                    drained = false;
                    break;
                }
                tokio::time::sleep(poll.min(timeout - elapsed)).await;
            }
        }
        let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let reason = "model released";
        let early = self.inner.pool.drop_model_tasks(model_name, reason);
        let detached = self.inner.pool.release_model_workers(model_name).await;
        let late = self.inner.pool.drop_model_tasks(model_name, reason);
        self.inner.direct.remove(model_name).await;
        self.inner.registry.write().remove(model_name);
        drop(guard);
        self.forget_model_lock(model_name);

        let outcome = ReleaseOutcome {
            model_name: model_name.to_string(),
            drained,
            waited_ms,
            workers_stopped: detached.workers_stopped,
            models_unloaded: detached.models_unloaded,
            tasks_dropped: early.tasks_dropped + late.tasks_dropped,
            futures_cancelled: early.futures_cancelled + late.futures_cancelled,
        };
        info!(
            model_name,
            drained,
            waited_ms,
            workers_stopped = outcome.workers_stopped,
            tasks_dropped = outcome.tasks_dropped,
            "Model released"
        );
        Ok(outcome)
    }

    /// Fail every queued task for the model with `TASK_DROPPED`.
    pub fn drop_model_queue(&self, model_name: &str, reason: &str) -> QueueDropOutcome {
        let counts = self.inner.pool.drop_model_tasks(model_name, reason);
        QueueDropOutcome {
            model_name: model_name.to_string(),
            tasks_dropped: counts.tasks_dropped,
            futures_cancelled: counts.futures_cancelled,
            reason: reason.to_string(),
        }
    }

    /// Drop one reference without deleting the registration.
    pub fn release_reference(
        &self,
        model_name: &str,
        requester: Option<&str>,
    ) -> ServiceResult<ReferenceOutcome> {
        let now = self.now();
        let mut registry = self.inner.registry.write();
        let reg = registry
            .get_mut(model_name)
            .ok_or_else(|| ServiceError::model_not_found(model_name))?;
        if !reg.remove_reference(requester, now) {
            debug!(model_name, "Reference count already zero");
        }
        Ok(ReferenceOutcome {
            model_name: model_name.to_string(),
            reference_count: reg.reference_count,
            requesters: reg.requesters.iter().cloned().collect(),
        })
    }

    pub fn touch(&self, model_name: &str) {
        let now = self.now();
        if let Some(reg) = self.inner.registry.write().get_mut(model_name) {
            reg.touch(now);
        }
    }

    fn implicit_registration(
        &self,
        model_name: &str,
        model_type: ModelType,
        now: u64,
    ) -> ModelRegistration {
        debug!(model_name, model_type = %model_type, "Implicit registration");
        ModelRegistration::new(
            model_name,
            model_type,
            DevicePreference::Auto,
            0,
            self.inner.config.default_keep_alive,
            self.estimate_model_memory(model_name, model_type),
            now,
        )
    }

    /// Make a model ready to serve a request.
    ///
    /// Unknown models get an unreferenced registration served by general
    /// workers. Evicted models with dedicated workers are provisioned again.
    pub async fn ensure_ready(&self, model_name: &str, model_type: ModelType) -> ServiceResult<()> {
        let now = self.now();
        let reprovision = {
            let mut registry = self.inner.registry.write();
            match registry.get_mut(model_name) {
                Some(reg) => {
                    reg.touch(now);
                    if reg.model_type != model_type {
                        return Err(ServiceError::invalid_model_type(model_type.as_str())
                            .with_detail("registered_type", reg.model_type.as_str()));
                    }
                    !reg.loaded && !reg.provisioning && reg.workers > 0
                }
                None => {
                    registry.insert(
                        model_name.to_string(),
                        self.implicit_registration(model_name, model_type, now),
                    );
                    false
                }
            }
        };

        if !reprovision {
            return Ok(());
        }

        let _guard = self.lock_model(model_name).await;
        let settled = {
            let mut registry = self.inner.registry.write();
            match registry.get_mut(model_name) {
                Some(reg) if !reg.loaded && !reg.provisioning && reg.workers > 0 => {
                    reg.provisioning = true;
                    Some((reg.device, reg.workers))
                }
                // Reloaded by someone else while we waited.
                Some(_) => None,
                // Released while we waited; general workers serve it from here.
                None => {
                    registry.insert(
                        model_name.to_string(),
                        self.implicit_registration(model_name, model_type, self.now()),
                    );
                    None
                }
            }
        };
        let Some((device, workers)) = settled else {
            return Ok(());
        };
        info!(model_name, "Reloading evicted model");
        let result = self.provision(model_name, model_type, device, workers).await;
        self.settle(model_name, &result);
        result.map(|_| ())
    }

    /// Note a successful request against a model.
    pub fn record_served(&self, model_name: &str) {
        let now = self.now();
        if let Some(reg) = self.inner.registry.write().get_mut(model_name) {
            if !reg.loaded && !reg.provisioning && reg.workers == 0 {
                reg.mark_loaded(now);
            } else {
                reg.touch(now);
            }
        }
    }

    /// Evict every loaded, unreferenced, non-preloaded model idle past its
    /// keep-alive window. Returns the evicted names.
    pub async fn scan_idle_models(&self) -> Vec<String> {
        let candidates: Vec<String> = {
            let now = self.now();
            self.inner
                .registry
                .read()
                .values()
                .filter(|reg| reg.is_evictable(now))
                .map(|reg| reg.model_name.clone())
                .collect()
        };

        let mut evicted = Vec::with_capacity(candidates.len());
        for model_name in candidates {
            let _guard = self.lock_model(&model_name).await;
            // Re-check under the model lock: a registration may have taken a
            // reference since the candidates were collected.
            let idle_ms = {
                let now = self.now();
                let mut registry = self.inner.registry.write();
                match registry.get_mut(&model_name) {
                    Some(reg) if reg.is_evictable(now) => {
                        reg.provisioning = true;
                        reg.idle_millis(now)
                    }
                    _ => continue,
                }
            };

            let detached = if self.inner.pool.is_enabled() {
                self.inner.pool.evict_model(&model_name).await
            } else {
                Default::default()
            };
            self.inner.direct.remove(&model_name).await;

            if let Some(reg) = self.inner.registry.write().get_mut(&model_name) {
                reg.provisioning = false;
                reg.loaded = false;
            }
            info!(
                model_name = %model_name,
                idle_ms,
                workers_stopped = detached.workers_stopped,
                models_unloaded = detached.models_unloaded,
                "Evicted idle model"
            );
            evicted.push(model_name);
        }

        let direct_idle = Duration::from_secs(self.inner.config.direct_idle_timeout);
        let cleaned = self.inner.direct.cleanup_idle(direct_idle).await;
        if !cleaned.is_empty() {
            debug!(models = ?cleaned, "Cleaned idle direct models");
        }
        evicted
    }

    /// Run [`scan_idle_models`](Self::scan_idle_models) every
    /// `idle_scan_interval` until stopped.
    pub fn start_idle_scanner(&self) {
        let mut scanner = self.inner.scanner.lock();
        if scanner.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let period = self.inner.config.idle_scan_interval();
        let weak: Weak<LifecycleInner> = Arc::downgrade(&self.inner);
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let manager = LifecycleManager { inner };
                        let evicted = manager.scan_idle_models().await;
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "Idle scan evicted models");
                        }
                    }
                }
            }
        });
        info!(interval_s = period.as_secs(), "Idle scanner started");
        *scanner = Some((token, handle));
    }

    pub async fn stop_idle_scanner(&self) {
        let running = self.inner.scanner.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Idle scanner did not stop in time");
            }
            info!("Idle scanner stopped");
        }
    }

    pub fn is_scanner_running(&self) -> bool {
        self.inner.scanner.lock().is_some()
    }
}
