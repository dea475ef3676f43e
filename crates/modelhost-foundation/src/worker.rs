//! Device-pinned model worker.
//!
//! A worker owns at most one loaded model. Its loop takes tasks from its own
//! FIFO queue first, then from the pool's shared queue. Between tasks it
//! waits up to `queue_timeout`; when that wait expires it unloads a model
//! left idle longer than `model_idle_timeout` unless the model was pinned.
//!
//! ```text
//! IDLE -> LOADING -> IDLE      model switch
//! IDLE -> BUSY -> IDLE         task execution
//! *    -> ERROR                backend panic (recovers via LOADING)
//! *    -> UNLOADING -> IDLE    model release
//! *    -> SHUTDOWN             stop (terminal)
//! ```
//!
//! Backend calls run on the blocking pool. Every task gets exactly one
//! result, and a failing task never ends the loop.

use crate::placement::{AffinityMap, resolve_device};
use crate::queue::{QueuedTask, TaskQueue};
use modelhost_backend::{BackendError, DeviceInventory, LoadedModel, LoaderFactory, ModelHandle};
use modelhost_kernel::{
    Device, ErrorCode, ModelType, ServiceError, ServiceResult, SharedClock, TaskInput, TaskOutput,
    TaskTiming, WorkerResult,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Loading,
    Busy,
    Error,
    Unloading,
    Shutdown,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) | (_, Error) | (_, Unloading) => true,
            (Idle, Loading) | (Loading, Idle) | (Idle, Busy) | (Busy, Idle) => true,
            (Unloading, Idle) | (Error, Loading) | (Error, Idle) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Loading => "loading",
            WorkerState::Busy => "busy",
            WorkerState::Error => "error",
            WorkerState::Unloading => "unloading",
            WorkerState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub total_processing_ms: f64,
    pub model_loads: u64,
    pub model_switches: u64,
    pub last_activity: Option<u64>,
}

impl WorkerStats {
    pub fn avg_processing_ms(&self) -> f64 {
        if self.tasks_processed == 0 {
            0.0
        } else {
            self.total_processing_ms / self.tasks_processed as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub device: Device,
    pub state: WorkerState,
    pub current_model: Option<String>,
    pub assigned_model: Option<String>,
    pub preloaded: bool,
    pub queue_depth: usize,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub avg_processing_ms: f64,
    pub last_activity: Option<u64>,
}

/// Everything a worker needs from its pool.
pub struct WorkerContext {
    pub factory: Arc<LoaderFactory>,
    pub global_queue: Arc<TaskQueue>,
    pub affinity: Arc<AffinityMap>,
    pub inventory: Arc<DeviceInventory>,
    pub clock: SharedClock,
    pub queue_timeout: Duration,
    pub model_idle_timeout: Duration,
    pub require_gpu: bool,
}

enum WorkerCommand {
    Load {
        model_id: String,
        model_type: Option<ModelType>,
        pin: bool,
        ack: oneshot::Sender<ServiceResult<Device>>,
    },
    Unload {
        model_id: Option<String>,
        ack: oneshot::Sender<bool>,
    },
}

struct WorkerShared {
    id: String,
    device: Device,
    assigned_model: Option<String>,
    state: Mutex<WorkerState>,
    current_model: Mutex<Option<String>>,
    preloaded: AtomicBool,
    stats: Mutex<WorkerStats>,
    queue: TaskQueue,
    in_flight: Mutex<Option<String>>,
}

impl WorkerShared {
    fn transition(&self, next: WorkerState) -> bool {
        let mut state = self.state.lock();
        if *state == next {
            return true;
        }
        if !state.can_transition_to(next) {
            warn!(worker_id = %self.id, from = %*state, to = %next, "Rejected worker state transition");
            return false;
        }
        debug!(worker_id = %self.id, from = %*state, to = %next, "Worker state");
        *state = next;
        true
    }

    fn state(&self) -> WorkerState {
        *self.state.lock()
    }
}

pub struct ModelWorker {
    shared: Arc<WorkerShared>,
    commands: mpsc::Sender<WorkerCommand>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ModelWorker {
    /// Create a worker and start its loop on the current runtime.
    pub fn spawn(
        id: impl Into<String>,
        device: Device,
        assigned_model: Option<String>,
        ctx: Arc<WorkerContext>,
    ) -> Arc<Self> {
        let id = id.into();
        let (commands, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let shared = Arc::new(WorkerShared {
            id: id.clone(),
            device,
            assigned_model: assigned_model.clone(),
            state: Mutex::new(WorkerState::Idle),
            current_model: Mutex::new(None),
            preloaded: AtomicBool::new(false),
            stats: Mutex::new(WorkerStats::default()),
            queue: TaskQueue::fifo(),
            in_flight: Mutex::new(None),
        });

        let runner = WorkerLoop {
            shared: Arc::clone(&shared),
            last_used: ctx.clock.now_millis(),
            ctx,
            resident: None,
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(runner.run());
        info!(worker_id = %id, %device, assigned_model = ?assigned_model, "Worker started");

        Arc::new(Self {
            shared,
            commands,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn device(&self) -> Device {
        self.shared.device
    }

    pub fn assigned_model(&self) -> Option<&str> {
        self.shared.assigned_model.as_deref()
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn current_model(&self) -> Option<String> {
        self.shared.current_model.lock().clone()
    }

    pub fn holds_model(&self, model_id: &str) -> bool {
        self.shared.current_model.lock().as_deref() == Some(model_id)
    }

    pub fn is_preloaded(&self) -> bool {
        self.shared.preloaded.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    /// Queued plus in-flight work, used by least-busy balancing.
    pub fn pending_load(&self) -> usize {
        let busy = usize::from(self.shared.in_flight.lock().is_some());
        self.queue_depth() + busy
    }

    pub fn pending_for_model(&self, model_id: &str) -> usize {
        let in_flight = self.shared.in_flight.lock().as_deref() == Some(model_id);
        self.shared.queue.len_for_model(model_id) + usize::from(in_flight)
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats.lock().clone()
    }

    pub fn enqueue(&self, entry: QueuedTask) {
        self.shared.queue.push(entry);
    }

    pub fn remove_task(&self, task_id: &str) -> Option<QueuedTask> {
        self.shared.queue.remove_task(task_id)
    }

    pub fn drain_queue_where<F>(&self, predicate: F) -> Vec<QueuedTask>
    where
        F: FnMut(&QueuedTask) -> bool,
    {
        self.shared.queue.drain_where(predicate)
    }

    /// Load `model_id` now. A pinned model is exempt from idle unloading.
    pub async fn load(
        &self,
        model_id: &str,
        model_type: Option<ModelType>,
        pin: bool,
    ) -> ServiceResult<Device> {
        let (ack, rx) = oneshot::channel();
        let command = WorkerCommand::Load {
            model_id: model_id.to_string(),
            model_type,
            pin,
            ack,
        };
        if self.commands.send(command).await.is_err() {
            return Err(self.stopped_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// Unload the resident model (only if it is `model_id`, when given).
    ///
    /// Returns whether a model was unloaded.
    pub async fn unload(&self, model_id: Option<&str>) -> bool {
        let (ack, rx) = oneshot::channel();
        let command = WorkerCommand::Unload {
            model_id: model_id.map(str::to_string),
            ack,
        };
        if self.commands.send(command).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop the loop, waiting at most `grace` before aborting it.
    ///
    /// The resident model is released either way.
    pub async fn stop(&self, grace: Duration) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    worker_id = %self.shared.id,
                    grace_ms = grace.as_millis() as u64,
                    "Worker did not stop within grace period, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }
        self.shared.current_model.lock().take();
        self.shared.preloaded.store(false, Ordering::SeqCst);
        self.shared.transition(WorkerState::Shutdown);
        info!(worker_id = %self.shared.id, "Worker stopped");
    }

    pub fn status(&self) -> WorkerStatus {
        let stats = self.stats();
        WorkerStatus {
            worker_id: self.shared.id.clone(),
            device: self.shared.device,
            state: self.state(),
            current_model: self.current_model(),
            assigned_model: self.shared.assigned_model.clone(),
            preloaded: self.is_preloaded(),
            queue_depth: self.queue_depth(),
            tasks_processed: stats.tasks_processed,
            tasks_failed: stats.tasks_failed,
            avg_processing_ms: stats.avg_processing_ms(),
            last_activity: stats.last_activity,
        }
    }

    fn stopped_error(&self) -> ServiceError {
        ServiceError::new(
            ErrorCode::WorkerPoolProcessingFailed,
            format!("worker {} is not running", self.shared.id),
        )
    }
}

impl fmt::Debug for ModelWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelWorker")
            .field("id", &self.shared.id)
            .field("device", &self.shared.device)
            .field("state", &self.state())
            .finish()
    }
}

enum LoopEvent {
    Cancelled,
    Command(WorkerCommand),
    Wake,
    IdleTick,
}

/// State owned by the spawned loop. The resident model never leaves it.
struct WorkerLoop {
    shared: Arc<WorkerShared>,
    ctx: Arc<WorkerContext>,
    resident: Option<LoadedModel>,
    last_used: u64,
    commands: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
}

impl WorkerLoop {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command).await;
            }
            if let Some(entry) = self.next_task() {
                self.process(entry).await;
                continue;
            }

            let event = tokio::select! {
                _ = self.cancel.cancelled() => LoopEvent::Cancelled,
                command = self.commands.recv() => match command {
                    Some(command) => LoopEvent::Command(command),
                    None => LoopEvent::Cancelled,
                },
                _ = self.shared.queue.notified() => LoopEvent::Wake,
                _ = self.ctx.global_queue.notified() => LoopEvent::Wake,
                _ = tokio::time::sleep(self.ctx.queue_timeout) => LoopEvent::IdleTick,
            };
            match event {
                LoopEvent::Cancelled => break,
                LoopEvent::Command(command) => self.handle_command(command).await,
                LoopEvent::Wake => {}
                LoopEvent::IdleTick => self.check_idle().await,
            }
        }

        self.release_resident().await;
        debug!(worker_id = %self.shared.id, "Worker loop exited");
    }

    fn next_task(&self) -> Option<QueuedTask> {
        self.shared
            .queue
            .pop()
            .or_else(|| self.ctx.global_queue.pop())
    }

    async fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Load {
                model_id,
                model_type,
                pin,
                ack,
            } => {
                let result = match &self.resident {
                    Some(model) if model.model_id == model_id => {
                        if pin {
                            self.shared.preloaded.store(true, Ordering::SeqCst);
                        }
                        Ok(model.device)
                    }
                    _ => self.switch_model(&model_id, model_type, pin).await,
                };
                let _ = ack.send(result);
            }
            WorkerCommand::Unload { model_id, ack } => {
                let matches = match (&self.resident, &model_id) {
                    (Some(model), Some(wanted)) => &model.model_id == wanted,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if matches {
                    self.unload_resident("released").await;
                }
                let _ = ack.send(matches);
            }
        }
    }

    async fn check_idle(&mut self) {
        if self.resident.is_none() || self.shared.preloaded.load(Ordering::SeqCst) {
            return;
        }
        let idle = Duration::from_millis(self.ctx.clock.now_millis().saturating_sub(self.last_used));
        if idle > self.ctx.model_idle_timeout {
            self.unload_resident("idle timeout").await;
        }
    }

    async fn unload_resident(&mut self, reason: &str) {
        self.shared.transition(WorkerState::Unloading);
        if let Some(model) = self.resident.take() {
            info!(
                worker_id = %self.shared.id,
                model_id = %model.model_id,
                reason,
                "Unloading model"
            );
            release_model(model).await;
        }
        self.shared.current_model.lock().take();
        self.shared.preloaded.store(false, Ordering::SeqCst);
        self.shared.transition(WorkerState::Idle);
    }

    async fn release_resident(&mut self) {
        if let Some(model) = self.resident.take() {
            info!(worker_id = %self.shared.id, model_id = %model.model_id, "Releasing model on stop");
            release_model(model).await;
        }
        self.shared.current_model.lock().take();
    }

    /// Replace the resident model with `model_id`, unloading the old one first.
    async fn switch_model(
        &mut self,
        model_id: &str,
        model_type: Option<ModelType>,
        pin: bool,
    ) -> ServiceResult<Device> {
        self.shared.transition(WorkerState::Loading);

        if let Some(old) = self.resident.take() {
            debug!(
                worker_id = %self.shared.id,
                from = %old.model_id,
                to = model_id,
                "Switching model"
            );
            release_model(old).await;
            self.shared.current_model.lock().take();
            self.shared.preloaded.store(false, Ordering::SeqCst);
            self.shared.stats.lock().model_switches += 1;
        }

        let affinity = self.ctx.affinity.get(model_id);
        let preference = affinity
            .as_ref()
            .map(|a| a.preference)
            .unwrap_or_default();
        let model_type = model_type.or(affinity.map(|a| a.model_type));
        let device = match resolve_device(
            preference,
            Some(self.shared.device),
            &self.ctx.inventory,
            self.ctx.require_gpu,
        ) {
            Ok(device) => device,
            Err(err) => {
                self.shared.transition(WorkerState::Idle);
                return Err(err);
            }
        };

        let factory = Arc::clone(&self.ctx.factory);
        let id = model_id.to_string();
        let device_str = device.to_string();
        let loaded =
            tokio::task::spawn_blocking(move || factory.load_model(&id, model_type, &device_str))
                .await;

        match loaded {
            Ok(Ok(model)) => {
                *self.shared.current_model.lock() = Some(model.model_id.clone());
                self.shared.preloaded.store(pin, Ordering::SeqCst);
                self.shared.stats.lock().model_loads += 1;
                self.resident = Some(model);
                self.last_used = self.ctx.clock.now_millis();
                self.shared.transition(WorkerState::Idle);
                Ok(device)
            }
            Ok(Err(err)) => {
                error!(worker_id = %self.shared.id, model_id, %device, error = %err, "Model load failed");
                self.shared.transition(WorkerState::Idle);
                Err(err)
            }
            Err(join_error) => {
                error!(worker_id = %self.shared.id, model_id, error = %join_error, "Model load panicked");
                self.shared.transition(WorkerState::Error);
                Err(
                    ServiceError::new(ErrorCode::ModelLoadError, "model load panicked")
                        .with_details(json!({
                            "model_id": model_id,
                            "device": device.to_string(),
                            "cause": join_error.to_string(),
                        })),
                )
            }
        }
    }

    async fn process(&mut self, entry: QueuedTask) {
        let started = Instant::now();
        let model_id = entry.task.model_id.clone();
        *self.shared.in_flight.lock() = Some(model_id.clone());
        debug!(
            worker_id = %self.shared.id,
            task_id = %entry.task.task_id,
            model_id = %model_id,
            "Processing task"
        );

        let mut timing = TaskTiming::default();
        let needs_switch = self
            .resident
            .as_ref()
            .is_none_or(|model| model.model_id != model_id);
        if needs_switch {
            let switch_started = Instant::now();
            let switched = self
                .switch_model(&model_id, Some(entry.task.task_type), false)
                .await;
            timing.model_switch_ms = millis(switch_started.elapsed());
            if let Err(err) = switched {
                timing.total_ms = millis(started.elapsed());
                self.finish(entry, None, Err(err), timing);
                return;
            }
        }

        let Some(model) = self.resident.as_ref() else {
            timing.total_ms = millis(started.elapsed());
            let err = ServiceError::internal("no resident model after switch");
            self.finish(entry, None, Err(err), timing);
            return;
        };
        let handle = Arc::clone(&model.handle);
        let device = model.device;
        let input = entry.task.input_data.clone();

        self.shared.transition(WorkerState::Busy);
        let processing_started = Instant::now();
        let outcome =
            tokio::task::spawn_blocking(move || run_inference(handle.as_ref(), &input)).await;
        timing.processing_ms = millis(processing_started.elapsed());

        let result = match outcome {
            Ok(Ok(output)) => {
                self.shared.transition(WorkerState::Idle);
                Ok(output)
            }
            Ok(Err(err)) => {
                self.shared.transition(WorkerState::Idle);
                Err(ServiceError::new(
                    ErrorCode::InferenceFailed,
                    format!("inference failed for '{model_id}'"),
                )
                .with_details(json!({
                    "model_id": model_id,
                    "device": device.to_string(),
                    "cause": err.to_string(),
                })))
            }
            Err(join_error) => {
                error!(
                    worker_id = %self.shared.id,
                    model_id = %model_id,
                    error = %join_error,
                    "Inference panicked, dropping resident model"
                );
                self.shared.transition(WorkerState::Error);
                if let Some(model) = self.resident.take() {
                    release_model(model).await;
                }
                self.shared.current_model.lock().take();
                self.shared.preloaded.store(false, Ordering::SeqCst);
                Err(ServiceError::new(
                    ErrorCode::InferenceFailed,
                    format!("inference panicked for '{model_id}'"),
                )
                .with_details(json!({
                    "model_id": model_id,
                    "device": device.to_string(),
                    "cause": join_error.to_string(),
                })))
            }
        };

        timing.total_ms = millis(started.elapsed());
        self.finish(entry, Some(device), result, timing);
    }

    fn finish(
        &mut self,
        entry: QueuedTask,
        device: Option<Device>,
        result: ServiceResult<TaskOutput>,
        mut timing: TaskTiming,
    ) {
        timing.overhead_ms = (timing.total_ms - timing.model_switch_ms - timing.processing_ms).max(0.0);
        let now = self.ctx.clock.now_millis();
        self.last_used = now;

        let task_id = entry.task.task_id.clone();
        let worker_result = match result {
            Ok(output) => WorkerResult::success(&task_id, &self.shared.id, output, timing),
            Err(err) => {
                warn!(
                    worker_id = %self.shared.id,
                    task_id = %task_id,
                    code = %err.code,
                    error = %err.message,
                    "Task failed"
                );
                WorkerResult::failure(&task_id, &self.shared.id, err, timing)
            }
        };
        let worker_result = match device {
            Some(device) => worker_result.with_metadata("device", device.to_string()),
            None => worker_result,
        }
        .with_metadata("model_id", entry.task.model_id.clone());

        {
            let mut stats = self.shared.stats.lock();
            if worker_result.success {
                stats.tasks_processed += 1;
                stats.total_processing_ms += timing.processing_ms;
            } else {
                stats.tasks_failed += 1;
            }
            stats.last_activity = Some(now);
        }
        self.shared.in_flight.lock().take();

        if !entry.respond(worker_result) {
            debug!(worker_id = %self.shared.id, task_id = %task_id, "Submitter no longer waiting");
        }
    }
}

/// Drop a model on the blocking pool so device teardown never stalls the runtime.
async fn release_model(model: LoadedModel) {
    let _ = tokio::task::spawn_blocking(move || drop(model)).await;
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// Run a task body against a resident model. Blocking.
pub fn run_inference(
    handle: &dyn ModelHandle,
    input: &TaskInput,
) -> Result<TaskOutput, BackendError> {
    match input {
        TaskInput::Embedding { texts } => {
            let embeddings = handle.encode(texts)?;
            let dimension = embeddings.first().map_or(0, Vec::len);
            Ok(TaskOutput::Embeddings {
                embeddings,
                dimension,
            })
        }
        TaskInput::TextGeneration { prompt, params } => {
            let generation = handle.generate(prompt, params)?;
            Ok(TaskOutput::Text {
                text: generation.text,
                prompt_tokens: generation.prompt_tokens,
                completion_tokens: generation.completion_tokens,
            })
        }
    }
}
