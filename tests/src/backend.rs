//! A `ModelBackend` driven by per-model scripts.
//!
//! Scripts are read at call time, so a test can make a model fail or slow
//! down after it has already been loaded.

use modelhost_backend::backend::{
    BackendError, BackendResult, Generation, ModelBackend, ModelHandle, SharedHandle,
};
use modelhost_backend::simulated::embed;
use modelhost_kernel::{Device, GenerationParams, ModelType};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// How one model behaves.
#[derive(Debug, Clone, Default)]
pub struct ModelScript {
    pub load_latency: Duration,
    pub inference_latency: Duration,
    pub fail_load: bool,
    pub fail_inference: bool,
    /// Overrides the backend-wide embedding dimension.
    pub dimension: Option<usize>,
}

#[derive(Default)]
struct Inner {
    dimension: usize,
    scripts: RwLock<HashMap<String, ModelScript>>,
    cached: Mutex<HashSet<String>>,
    loads: Mutex<HashMap<String, usize>>,
    inferences: Mutex<HashMap<String, usize>>,
    live_handles: AtomicUsize,
    downloads: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedBackend {
    inner: Arc<Inner>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::with_dimension(8)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                dimension: dimension.max(1),
                ..Default::default()
            }),
        }
    }

    /// Replace the script for `model_id`.
    pub fn script(&self, model_id: &str, script: ModelScript) -> &Self {
        self.inner.scripts.write().insert(model_id.to_string(), script);
        self
    }

    /// Edit the script for `model_id` in place, starting from the default.
    pub fn update(&self, model_id: &str, edit: impl FnOnce(&mut ModelScript)) -> &Self {
        edit(self.inner.scripts.write().entry(model_id.to_string()).or_default());
        self
    }

    pub fn fail_loads(&self, model_id: &str, fail: bool) -> &Self {
        self.update(model_id, |s| s.fail_load = fail)
    }

    pub fn fail_inference(&self, model_id: &str, fail: bool) -> &Self {
        self.update(model_id, |s| s.fail_inference = fail)
    }

    pub fn slow_inference(&self, model_id: &str, latency: Duration) -> &Self {
        self.update(model_id, |s| s.inference_latency = latency)
    }

    fn script_for(&self, model_id: &str) -> ModelScript {
        self.inner
            .scripts
            .read()
            .get(model_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn dimension_for(&self, model_id: &str) -> usize {
        self.script_for(model_id)
            .dimension
            .unwrap_or(self.inner.dimension)
    }

    pub fn load_count(&self, model_id: &str) -> usize {
        self.inner.loads.lock().get(model_id).copied().unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.inner.loads.lock().values().sum()
    }

    pub fn inference_count(&self, model_id: &str) -> usize {
        self.inner.inferences.lock().get(model_id).copied().unwrap_or(0)
    }

    pub fn live_handles(&self) -> usize {
        self.inner.live_handles.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.inner.downloads.load(Ordering::SeqCst)
    }
}

impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn check_available(&self) -> BackendResult<()> {
        Ok(())
    }

    fn is_cached(&self, model_id: &str, _cache_dir: &Path) -> bool {
        self.inner.cached.lock().contains(model_id)
    }

    fn download(&self, model_id: &str, cache_dir: &Path) -> BackendResult<PathBuf> {
        self.inner.cached.lock().insert(model_id.to_string());
        self.inner.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(modelhost_backend::backend::hub_cache_dir(cache_dir, model_id))
    }

    fn load(
        &self,
        model_id: &str,
        model_type: ModelType,
        device: Device,
        _cache_dir: &Path,
    ) -> BackendResult<SharedHandle> {
        let script = self.script_for(model_id);
        if !script.load_latency.is_zero() {
            std::thread::sleep(script.load_latency);
        }
        if script.fail_load {
            return Err(BackendError::Load(format!(
                "scripted load failure for {model_id} on {device}"
            )));
        }

        *self.inner.loads.lock().entry(model_id.to_string()).or_default() += 1;
        self.inner.live_handles.fetch_add(1, Ordering::SeqCst);
        debug!(model_id, %device, "Scripted model loaded");
        Ok(Arc::new(ScriptedHandle {
            model_id: model_id.to_string(),
            model_type,
            device,
            backend: self.clone(),
        }))
    }
}

struct ScriptedHandle {
    model_id: String,
    model_type: ModelType,
    device: Device,
    backend: ScriptedBackend,
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.backend.inner.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedHandle {
    fn run(&self, expected: ModelType) -> BackendResult<()> {
        if self.model_type != expected {
            return Err(BackendError::Inference(format!(
                "{} is a {} model",
                self.model_id, self.model_type
            )));
        }
        let script = self.backend.script_for(&self.model_id);
        if !script.inference_latency.is_zero() {
            std::thread::sleep(script.inference_latency);
        }
        *self
            .backend
            .inner
            .inferences
            .lock()
            .entry(self.model_id.clone())
            .or_default() += 1;
        if script.fail_inference {
            return Err(BackendError::Inference(format!(
                "scripted inference failure for {}",
                self.model_id
            )));
        }
        Ok(())
    }
}

impl ModelHandle for ScriptedHandle {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device(&self) -> Device {
        self.device
    }

    fn encode(&self, texts: &[String]) -> BackendResult<Vec<Vec<f32>>> {
        self.run(ModelType::Embedding)?;
        let dimension = self.backend.dimension_for(&self.model_id);
        Ok(texts
            .iter()
            .map(|text| embed(&self.model_id, text, dimension))
            .collect())
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> BackendResult<Generation> {
        self.run(ModelType::TextGeneration)?;
        let completion: Vec<&str> = prompt
            .split_whitespace()
            .take(params.max_new_tokens)
            .collect();
        Ok(Generation {
            text: completion.join(" "),
            prompt_tokens: prompt.split_whitespace().count(),
            completion_tokens: completion.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_apply_to_existing_handles() {
        let backend = ScriptedBackend::new();
        let handle = backend
            .load("m1", ModelType::Embedding, Device::Cpu, Path::new("/tmp"))
            .unwrap();
        assert_eq!(handle.encode(&["a".to_string()]).unwrap()[0].len(), 8);

        backend.fail_inference("m1", true);
        assert!(handle.encode(&["a".to_string()]).is_err());
        assert_eq!(backend.inference_count("m1"), 2);
        assert_eq!(backend.load_count("m1"), 1);

        drop(handle);
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn failing_load_is_not_counted() {
        let backend = ScriptedBackend::new();
        backend.fail_loads("broken", true);
        assert!(
            backend
                .load("broken", ModelType::Embedding, Device::Cpu, Path::new("/tmp"))
                .is_err()
        );
        assert_eq!(backend.total_loads(), 0);
    }
}
