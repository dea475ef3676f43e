//! Model-family adapters over a [`ModelBackend`].
//!
//! Each loader owns one model family. Name patterns decide which family a
//! bare model id belongs to when the caller gives no explicit type.

use crate::backend::{BackendError, ModelBackend, SharedHandle};
use modelhost_kernel::{Device, ErrorCode, ModelType, ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A model resident on a device, as handed to a worker.
#[derive(Clone)]
pub struct LoadedModel {
    pub model_id: String,
    pub model_type: ModelType,
    pub device: Device,
    pub handle: SharedHandle,
    pub load_time: Duration,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_id", &self.model_id)
            .field("model_type", &self.model_type)
            .field("device", &self.device)
            .field("load_time", &self.load_time)
            .finish()
    }
}

/// Outcome of [`ModelLoader::download_only`]. Both variants are success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadStatus {
    AlreadyCached { path: PathBuf },
    Downloaded { path: PathBuf },
}

impl DownloadStatus {
    pub fn path(&self) -> &Path {
        match self {
            DownloadStatus::AlreadyCached { path } | DownloadStatus::Downloaded { path } => path,
        }
    }
}

pub trait ModelLoader: Send + Sync {
    fn supports_model(&self, model_id: &str) -> bool;

    fn model_type(&self) -> ModelType;

    /// Load onto `device` (`"cpu"` or `"cuda:N"`).
    ///
    /// Blocking; call from `spawn_blocking`.
    fn load_model(&self, model_id: &str, device: &str) -> ServiceResult<LoadedModel>;

    /// Make sure the model files are in the local cache.
    ///
    /// Checks the cache first and only fetches when absent. Already cached
    /// is reported as success.
    fn download_only(&self, model_id: &str) -> ServiceResult<DownloadStatus>;
}

/// Backend plumbing shared by every model family.
#[derive(Clone)]
struct BackendAccess {
    backend: Arc<dyn ModelBackend>,
    cache_dir: PathBuf,
    patterns: Vec<String>,
}

impl BackendAccess {
    fn new(backend: Arc<dyn ModelBackend>, cache_dir: PathBuf, patterns: &[&str]) -> Self {
        Self {
            backend,
            cache_dir,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn matches(&self, model_id: &str) -> bool {
        let lower = model_id.to_ascii_lowercase();
        self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }

    fn load(
        &self,
        model_id: &str,
        device: &str,
        model_type: ModelType,
        load_error: ErrorCode,
    ) -> ServiceResult<LoadedModel> {
        let device: Device = device.parse()?;

        self.backend.check_available().map_err(|e| {
            ServiceError::new(
                ErrorCode::DependencyMissing,
                format!("backend '{}' is not available", self.backend.name()),
            )
            .with_details(json!({
                "model_id": model_id,
                "device": device.to_string(),
                "cause": e.to_string(),
            }))
        })?;

        let started = Instant::now();
        tracing::info!(model_id, %device, model_type = %model_type, "Loading model");
        let handle = self
            .backend
            .load(model_id, model_type, device, &self.cache_dir)
            .map_err(|e| {
                let code = match &e {
                    BackendError::Unavailable(_) => ErrorCode::DependencyMissing,
                    _ => load_error,
                };
                tracing::error!(model_id, %device, error = %e, "Model load failed");
                ServiceError::new(code, format!("failed to load {model_type} model '{model_id}'"))
                    .with_details(json!({
                        "model_id": model_id,
                        "device": device.to_string(),
                        "cause": e.to_string(),
                    }))
            })?;

        let load_time = started.elapsed();
        tracing::info!(
            model_id,
            %device,
            load_ms = load_time.as_millis() as u64,
            "Model loaded"
        );
        Ok(LoadedModel {
            model_id: model_id.to_string(),
            model_type,
            device,
            handle,
            load_time,
        })
    }

    fn download(&self, model_id: &str) -> ServiceResult<DownloadStatus> {
        if self.backend.is_cached(model_id, &self.cache_dir) {
            tracing::debug!(model_id, "Model already cached");
            return Ok(DownloadStatus::AlreadyCached {
                path: crate::backend::hub_cache_dir(&self.cache_dir, model_id),
            });
        }

        tracing::info!(model_id, cache_dir = %self.cache_dir.display(), "Downloading model");
        let path = self
            .backend
            .download(model_id, &self.cache_dir)
            .map_err(|e| {
                ServiceError::new(
                    ErrorCode::DownloadFailed,
                    format!("failed to download '{model_id}'"),
                )
                .with_details(json!({ "model_id": model_id, "cause": e.to_string() }))
            })?;
        Ok(DownloadStatus::Downloaded { path })
    }
}

const EMBEDDING_PATTERNS: &[&str] = &[
    "sentence-transformers",
    "bge",
    "e5-",
    "minilm",
    "mpnet",
    "embed",
    "gte-",
];

const TEXT_GENERATION_PATTERNS: &[&str] = &[
    "gpt", "llama", "mistral", "qwen", "phi", "gemma", "t5", "opt-", "falcon", "instruct", "chat",
];

/// Sentence-embedding models.
#[derive(Clone)]
pub struct EmbeddingLoader {
    access: BackendAccess,
}

impl EmbeddingLoader {
    pub fn new(backend: Arc<dyn ModelBackend>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            access: BackendAccess::new(backend, cache_dir.into(), EMBEDDING_PATTERNS),
        }
    }

    /// Additional lowercase name fragments this loader claims.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.access
            .patterns
            .extend(patterns.into_iter().map(|p| p.into().to_ascii_lowercase()));
        self
    }
}

impl ModelLoader for EmbeddingLoader {
    fn supports_model(&self, model_id: &str) -> bool {
        self.access.matches(model_id)
    }

    fn model_type(&self) -> ModelType {
        ModelType::Embedding
    }

    fn load_model(&self, model_id: &str, device: &str) -> ServiceResult<LoadedModel> {
        self.access.load(
            model_id,
            device,
            ModelType::Embedding,
            ErrorCode::EmbeddingModelLoadError,
        )
    }

    fn download_only(&self, model_id: &str) -> ServiceResult<DownloadStatus> {
        self.access.download(model_id)
    }
}

/// Causal and seq2seq generation models.
#[derive(Clone)]
pub struct TextGenerationLoader {
    access: BackendAccess,
}

impl TextGenerationLoader {
    pub fn new(backend: Arc<dyn ModelBackend>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            access: BackendAccess::new(backend, cache_dir.into(), TEXT_GENERATION_PATTERNS),
        }
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.access
            .patterns
            .extend(patterns.into_iter().map(|p| p.into().to_ascii_lowercase()));
        self
    }
}

impl ModelLoader for TextGenerationLoader {
    fn supports_model(&self, model_id: &str) -> bool {
        self.access.matches(model_id)
    }

    fn model_type(&self) -> ModelType {
        ModelType::TextGeneration
    }

    fn load_model(&self, model_id: &str, device: &str) -> ServiceResult<LoadedModel> {
        self.access.load(
            model_id,
            device,
            ModelType::TextGeneration,
            ErrorCode::TextGenerationModelLoadError,
        )
    }

    fn download_only(&self, model_id: &str) -> ServiceResult<DownloadStatus> {
        self.access.download(model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedBackend;

    fn backend() -> Arc<dyn ModelBackend> {
        Arc::new(SimulatedBackend::new().with_dimension(16))
    }

    #[test]
    fn pattern_support() {
        let dir = tempfile::tempdir().unwrap();
        let embed = EmbeddingLoader::new(backend(), dir.path());
        let text = TextGenerationLoader::new(backend(), dir.path());

        assert!(embed.supports_model("sentence-transformers/all-MiniLM-L6-v2"));
        assert!(embed.supports_model("BAAI/bge-small-en"));
        assert!(!embed.supports_model("gpt2"));
        assert!(text.supports_model("gpt2"));
        assert!(text.supports_model("meta-llama/Llama-3-8B-Instruct"));
        assert!(!text.supports_model("custom-net"));
        assert!(text.with_patterns(["custom"]).supports_model("custom-net"));
    }

    #[test]
    fn invalid_device_rejected_before_backend() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedBackend::new();
        let loader = EmbeddingLoader::new(Arc::new(sim.clone()), dir.path());
        let err = loader.load_model("bge-small", "cuda:-1").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDevice);
        assert_eq!(sim.load_count(), 0);
    }

    #[test]
    fn load_failures_carry_device_and_cause() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedBackend::new().with_failing_model("bge-broken");
        let loader = EmbeddingLoader::new(Arc::new(sim), dir.path());
        let err = loader.load_model("bge-broken", "cpu").unwrap_err();
        assert_eq!(err.code, ErrorCode::EmbeddingModelLoadError);
        let details = err.details.unwrap();
        assert_eq!(details["device"], "cpu");
        assert!(details["cause"].as_str().unwrap().contains("simulated"));

        let text = TextGenerationLoader::new(
            Arc::new(SimulatedBackend::new().with_failing_model("gpt-x")),
            dir.path(),
        );
        assert_eq!(
            text.load_model("gpt-x", "cuda:0").unwrap_err().code,
            ErrorCode::TextGenerationModelLoadError
        );
    }

    #[test]
    fn missing_runtime_is_dependency_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader =
            TextGenerationLoader::new(Arc::new(SimulatedBackend::new().unavailable()), dir.path());
        assert_eq!(
            loader.load_model("gpt2", "cpu").unwrap_err().code,
            ErrorCode::DependencyMissing
        );
    }

    #[test]
    fn download_only_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedBackend::new();
        let loader = EmbeddingLoader::new(Arc::new(sim.clone()), dir.path());

        let first = loader.download_only("org/bge-base").unwrap();
        assert!(matches!(first, DownloadStatus::Downloaded { .. }));
        let second = loader.download_only("org/bge-base").unwrap();
        assert!(matches!(second, DownloadStatus::AlreadyCached { .. }));
        assert_eq!(first.path(), second.path());
        assert_eq!(sim.download_count(), 1);
    }

    #[test]
    fn successful_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = EmbeddingLoader::new(backend(), dir.path());
        let model = loader.load_model("bge-small", "cuda:1").unwrap();
        assert_eq!(model.device, Device::Cuda(1));
        assert_eq!(model.model_type, ModelType::Embedding);
        assert_eq!(model.handle.encode(&["x".into()]).unwrap()[0].len(), 16);
    }
}
