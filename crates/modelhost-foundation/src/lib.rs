//! Runtime machinery for modelhost.
//!
//! - [`worker`]: device-pinned workers with an explicit state machine
//! - [`pool`]: the worker set, shared queue, routing and scaling
//! - [`lifecycle`]: registrations, release and idle eviction
//! - [`direct`]: in-process loading when no pool is available
//! - [`cache`]: TTL-bounded embedding cache
//! - [`service`]: the [`ModelService`] facade tying it together

pub mod cache;
pub mod direct;
pub mod estimator;
pub mod lifecycle;
pub mod placement;
pub mod pool;
pub mod queue;
pub mod registration;
pub mod service;
pub mod worker;

pub use cache::{CacheStats, EmbeddingCache, cache_key};
pub use direct::{DirectModelManager, DirectOutput, ModelReference, ReferenceSnapshot};
pub use estimator::{MemoryEstimator, StaticMemoryTable};
pub use lifecycle::{
    LifecycleManager, QueueDropOutcome, ReferenceOutcome, RegistrationOutcome, ReleaseOutcome,
};
pub use placement::{Affinity, AffinityMap, expand_devices, resolve_device};
pub use pool::{DetachOutcome, DropCounts, EnsureOutcome, PoolStatus, ScaleOutcome, WorkerPool};
pub use queue::{QueueOrdering, QueuedTask, TaskQueue};
pub use registration::ModelRegistration;
pub use service::{
    EmbeddingResponse, ExecutionMode, ModelService, ModelServiceBuilder, ServiceStatus,
    TextResponse,
};
pub use worker::{ModelWorker, WorkerContext, WorkerState, WorkerStats, WorkerStatus, run_inference};
