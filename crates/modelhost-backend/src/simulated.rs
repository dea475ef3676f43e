//! A deterministic in-process backend.
//!
//! Embeddings are derived from a SHA-256 stream seeded with the model id and
//! the text, then L2-normalised, so identical inputs always produce identical
//! vectors. Generation echoes the prompt. Downloads write a marker directory
//! in the hub cache layout.

use crate::backend::{
    BackendError, BackendResult, Generation, ModelBackend, ModelHandle, SharedHandle,
    hub_cache_dir,
};
use modelhost_kernel::{Device, GenerationParams, ModelType};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const DEFAULT_DIMENSION: usize = 384;

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicUsize,
    live_handles: AtomicUsize,
    downloads: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    dimension: usize,
    load_latency: Duration,
    inference_latency: Duration,
    failing_models: HashSet<String>,
    unavailable: bool,
    counters: Arc<Counters>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            load_latency: Duration::ZERO,
            inference_latency: Duration::ZERO,
            failing_models: HashSet::new(),
            unavailable: false,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension.max(1);
        self
    }

    pub fn with_load_latency(mut self, latency: Duration) -> Self {
        self.load_latency = latency;
        self
    }

    pub fn with_inference_latency(mut self, latency: Duration) -> Self {
        self.inference_latency = latency;
        self
    }

    /// Loads of `model_id` fail with [`BackendError::Load`].
    pub fn with_failing_model(mut self, model_id: impl Into<String>) -> Self {
        self.failing_models.insert(model_id.into());
        self
    }

    /// Report the runtime library as missing.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn load_count(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    /// Handles not yet dropped.
    pub fn live_handles(&self) -> usize {
        self.counters.live_handles.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.counters.downloads.load(Ordering::SeqCst)
    }
}

impl ModelBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.unavailable {
            return Err(BackendError::Unavailable(
                "simulated runtime disabled".to_string(),
            ));
        }
        Ok(())
    }

    fn is_cached(&self, model_id: &str, cache_dir: &Path) -> bool {
        hub_cache_dir(cache_dir, model_id).join("config.json").is_file()
    }

    fn download(&self, model_id: &str, cache_dir: &Path) -> BackendResult<PathBuf> {
        let dir = hub_cache_dir(cache_dir, model_id);
        std::fs::create_dir_all(&dir).map_err(|e| BackendError::Download(e.to_string()))?;
        let marker = serde_json::json!({
            "model_id": model_id,
            "backend": self.name(),
            "dimension": self.dimension,
        });
        std::fs::write(dir.join("config.json"), marker.to_string())
            .map_err(|e| BackendError::Download(e.to_string()))?;
        self.counters.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(dir)
    }

    fn load(
        &self,
        model_id: &str,
        model_type: ModelType,
        device: Device,
        _cache_dir: &Path,
    ) -> BackendResult<SharedHandle> {
        self.check_available()?;
        if !self.load_latency.is_zero() {
            std::thread::sleep(self.load_latency);
        }
        if self.failing_models.contains(model_id) {
            return Err(BackendError::Load(format!(
                "simulated load failure for {model_id} on {device}"
            )));
        }

        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.counters.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimulatedHandle {
            model_id: model_id.to_string(),
            model_type,
            device,
            dimension: self.dimension,
            inference_latency: self.inference_latency,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct SimulatedHandle {
    model_id: String,
    model_type: ModelType,
    device: Device,
    dimension: usize,
    inference_latency: Duration,
    counters: Arc<Counters>,
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        self.counters.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedHandle {
    fn pause(&self) {
        if !self.inference_latency.is_zero() {
            std::thread::sleep(self.inference_latency);
        }
    }
}

impl ModelHandle for SimulatedHandle {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device(&self) -> Device {
        self.device
    }

    fn memory_bytes(&self) -> u64 {
        (self.dimension * std::mem::size_of::<f32>() * 1024) as u64
    }

    fn encode(&self, texts: &[String]) -> BackendResult<Vec<Vec<f32>>> {
        if self.model_type != ModelType::Embedding {
            return Err(BackendError::Inference(format!(
                "{} is a {} model and cannot encode",
                self.model_id, self.model_type
            )));
        }
        self.pause();
        Ok(texts
            .iter()
            .map(|text| embed(&self.model_id, text, self.dimension))
            .collect())
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> BackendResult<Generation> {
        if self.model_type != ModelType::TextGeneration {
            return Err(BackendError::Inference(format!(
                "{} is a {} model and cannot generate",
                self.model_id, self.model_type
            )));
        }
        self.pause();
        let prompt_tokens = prompt.split_whitespace().count();
        let completion: Vec<&str> = prompt
            .split_whitespace()
            .rev()
            .take(params.max_new_tokens)
            .collect();
        let text = completion.join(" ");
        Ok(Generation {
            completion_tokens: completion.len(),
            text,
            prompt_tokens,
        })
    }
}

/// Unit-length vector derived from `model_id` and `text`.
pub fn embed(model_id: &str, text: &str, dimension: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dimension);
    let mut block: u32 = 0;
    while values.len() < dimension {
        let digest = Sha256::new()
            .chain_update(model_id.as_bytes())
            .chain_update(b":")
            .chain_update(text.as_bytes())
            .chain_update(block.to_le_bytes())
            .finalize();
        for chunk in digest.chunks_exact(2) {
            if values.len() == dimension {
                break;
            }
            let raw = u16::from_le_bytes([chunk[0], chunk[1]]);
            values.push(raw as f32 / u16::MAX as f32 * 2.0 - 1.0);
        }
        block += 1;
    }

    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
