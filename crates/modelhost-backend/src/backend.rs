//! The opaque model-execution backend.
//!
//! A backend turns a model name and device into a [`ModelHandle`]; the handle
//! performs the actual numerics. Every method here is blocking and is
//! expected to be called from `spawn_blocking`. Dropping the last reference
//! to a handle releases its device memory.

use modelhost_kernel::{Device, GenerationParams, ModelType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend's runtime library is not usable on this host
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The model is unknown to the backend and to its hub
    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Download failed: {0}")]
    Download(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Output of a single generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// A model resident on one device.
pub trait ModelHandle: Send + Sync {
    fn model_id(&self) -> &str;

    fn device(&self) -> Device;

    /// Approximate resident memory, 0 when unknown.
    fn memory_bytes(&self) -> u64 {
        0
    }

    /// Batch-encode texts into vectors of equal dimension.
    fn encode(&self, texts: &[String]) -> BackendResult<Vec<Vec<f32>>>;

    fn generate(&self, prompt: &str, params: &GenerationParams) -> BackendResult<Generation>;
}

pub type SharedHandle = Arc<dyn ModelHandle>;

/// Loads models and manages the on-disk model cache.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the runtime library this backend wraps can be used.
    fn check_available(&self) -> BackendResult<()>;

    /// Local cache lookup. Must not touch the network.
    fn is_cached(&self, model_id: &str, cache_dir: &Path) -> bool;

    /// Fetch the model files into `cache_dir`, returning the model directory.
    fn download(&self, model_id: &str, cache_dir: &Path) -> BackendResult<PathBuf>;

    fn load(
        &self,
        model_id: &str,
        model_type: ModelType,
        device: Device,
        cache_dir: &Path,
    ) -> BackendResult<SharedHandle>;
}

/// Hub cache layout: `models--{org}--{name}` under the cache root.
pub fn hub_cache_dir(cache_dir: &Path, model_id: &str) -> PathBuf {
    cache_dir.join(format!("models--{}", model_id.replace('/', "--")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_layout_flattens_org() {
        let dir = hub_cache_dir(Path::new("/cache"), "sentence-transformers/all-MiniLM-L6-v2");
        assert_eq!(
            dir,
            PathBuf::from("/cache/models--sentence-transformers--all-MiniLM-L6-v2")
        );
        assert_eq!(
            hub_cache_dir(Path::new("/cache"), "gpt2"),
            PathBuf::from("/cache/models--gpt2")
        );
    }

    #[test]
    fn error_display() {
        let err = BackendError::Load("out of memory".into());
        assert_eq!(err.to_string(), "Load failed: out of memory");
    }
}
