//! Error taxonomy shared by every modelhost crate.
//!
//! Every public operation reports failures as a [`ServiceError`]: a
//! machine-readable [`ErrorCode`], a human-readable message and optional
//! structured details (device, model, underlying cause, partial state).
//! Errors are values; nothing is thrown across the subsystem boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// Stable, machine-readable error codes.
///
/// Grouped by category:
/// - configuration / validation: rejected before any resource is touched
/// - dependency: backend library unavailable, never retried here
/// - load / runtime: surfaced with device and cause
/// - routing / timeout: surfaced to the caller, no automatic retry
/// - cancellation: a queued task was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    InvalidDevice,
    InvalidModelType,
    InvalidWorkerCount,
    InvalidConfiguration,
    NoDevicesAvailable,
    DependencyMissing,
    NoLoaderFound,
    ModelLoadError,
    EmbeddingModelLoadError,
    TextGenerationModelLoadError,
    DownloadFailed,
    WorkerCreationFailed,
    WorkerPoolProcessingFailed,
    WorkerPoolDisabled,
    TaskTimeout,
    TaskDropped,
    PoolShutdown,
    InferenceFailed,
    ModelNotFound,
    ServiceNotStarted,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidDevice => "INVALID_DEVICE",
            Self::InvalidModelType => "INVALID_MODEL_TYPE",
            Self::InvalidWorkerCount => "INVALID_WORKER_COUNT",
            Self::InvalidConfiguration => "INVALID_CONFIGURATION",
            Self::NoDevicesAvailable => "NO_DEVICES_AVAILABLE",
            Self::DependencyMissing => "DEPENDENCY_MISSING",
            Self::NoLoaderFound => "NO_LOADER_FOUND",
            Self::ModelLoadError => "MODEL_LOAD_ERROR",
            Self::EmbeddingModelLoadError => "EMBEDDING_MODEL_LOAD_ERROR",
            Self::TextGenerationModelLoadError => "TEXT_GENERATION_MODEL_LOAD_ERROR",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::WorkerCreationFailed => "WORKER_CREATION_FAILED",
            Self::WorkerPoolProcessingFailed => "WORKER_POOL_PROCESSING_FAILED",
            Self::WorkerPoolDisabled => "WORKER_POOL_DISABLED",
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::TaskDropped => "TASK_DROPPED",
            Self::PoolShutdown => "POOL_SHUTDOWN",
            Self::InferenceFailed => "INFERENCE_FAILED",
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::ServiceNotStarted => "SERVICE_NOT_STARTED",
            Self::Internal => "INTERNAL",
        }
    }

    /// True for codes rejected during validation, before any resource is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidDevice
                | Self::InvalidModelType
                | Self::InvalidWorkerCount
                | Self::InvalidConfiguration
                | Self::NoDevicesAvailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned by every modelhost operation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Result alias used throughout the workspace.
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details, replacing any existing ones.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Merge a single key into the details object.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        match self.details {
            Some(Value::Object(ref mut map)) => {
                map.insert(key.to_string(), value.into());
            }
            _ => {
                let mut map = serde_json::Map::new();
                map.insert(key.to_string(), value.into());
                self.details = Some(Value::Object(map));
            }
        }
        self
    }

    pub fn invalid_device(device: &str) -> Self {
        Self::new(
            ErrorCode::InvalidDevice,
            format!("invalid device '{device}': expected 'cpu' or 'cuda:N'"),
        )
        .with_details(json!({ "device": device }))
    }

    pub fn invalid_model_type(model_type: &str) -> Self {
        Self::new(
            ErrorCode::InvalidModelType,
            format!("invalid model type '{model_type}': expected 'embedding' or 'text_generation'"),
        )
        .with_details(json!({ "model_type": model_type }))
    }

    pub fn model_not_found(model_name: &str) -> Self {
        Self::new(
            ErrorCode::ModelNotFound,
            format!("model '{model_name}' is not registered"),
        )
        .with_details(json!({ "model_name": model_name }))
    }

    pub fn task_dropped(task_id: &str, reason: &str) -> Self {
        Self::new(ErrorCode::TaskDropped, format!("task dropped: {reason}"))
            .with_details(json!({ "task_id": task_id, "reason": reason }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}
