//! Shared contracts for the modelhost workspace.
//!
//! This crate carries no runtime machinery. It defines the vocabulary that
//! the backend, foundation and CLI crates exchange: errors and the response
//! envelope, devices, tasks and results, configuration and the clock.

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod paths;
pub mod response;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    ConfigError, EmbeddingCacheConfig, LifecycleConfig, LoadBalancing, PathsConfig,
    ServiceConfig, WorkerPoolConfig,
};
pub use device::{Device, DevicePreference};
pub use error::{ErrorCode, ServiceError, ServiceResult};
pub use paths::{DataPathProvider, StaticDataPaths};
pub use response::ServiceResponse;
pub use types::{
    GenerationParams, ModelType, TaskInput, TaskOutput, TaskPriority, TaskTiming, TaskType,
    WorkerResult, WorkerTask,
};
