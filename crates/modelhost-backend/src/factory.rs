//! Ordered loader registry.

use crate::backend::ModelBackend;
use crate::loader::{DownloadStatus, EmbeddingLoader, LoadedModel, ModelLoader, TextGenerationLoader};
use modelhost_kernel::{ErrorCode, ModelType, ServiceError, ServiceResult};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Picks the loader responsible for a model.
///
/// With an explicit model type the first loader of that type is used;
/// otherwise the first loader whose name patterns match.
#[derive(Clone, Default)]
pub struct LoaderFactory {
    loaders: Vec<Arc<dyn ModelLoader>>,
}

impl LoaderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The embedding and text-generation loaders over one backend.
    pub fn with_defaults(backend: Arc<dyn ModelBackend>, cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        Self::new()
            .with_loader(EmbeddingLoader::new(Arc::clone(&backend), cache_dir.clone()))
            .with_loader(TextGenerationLoader::new(backend, cache_dir))
    }

    pub fn with_loader(mut self, loader: impl ModelLoader + 'static) -> Self {
        self.loaders.push(Arc::new(loader));
        self
    }

    pub fn register(&mut self, loader: Arc<dyn ModelLoader>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    pub fn loader_for(
        &self,
        model_id: &str,
        model_type: Option<ModelType>,
    ) -> ServiceResult<Arc<dyn ModelLoader>> {
        let found = match model_type {
            Some(wanted) => self.loaders.iter().find(|l| l.model_type() == wanted),
            None => self.loaders.iter().find(|l| l.supports_model(model_id)),
        };
        found.cloned().ok_or_else(|| {
            ServiceError::new(
                ErrorCode::NoLoaderFound,
                format!("no loader found for model '{model_id}'"),
            )
            .with_details(json!({
                "model_id": model_id,
                "model_type": model_type.map(|t| t.to_string()),
            }))
        })
    }

    /// Model family for a bare id, from the first matching loader.
    pub fn detect_model_type(&self, model_id: &str) -> ServiceResult<ModelType> {
        self.loader_for(model_id, None).map(|l| l.model_type())
    }

    /// Blocking; call from `spawn_blocking`.
    pub fn load_model(
        &self,
        model_id: &str,
        model_type: Option<ModelType>,
        device: &str,
    ) -> ServiceResult<LoadedModel> {
        self.loader_for(model_id, model_type)?
            .load_model(model_id, device)
    }

    /// Blocking; call from `spawn_blocking`.
    pub fn download_only(
        &self,
        model_id: &str,
        model_type: Option<ModelType>,
    ) -> ServiceResult<DownloadStatus> {
        self.loader_for(model_id, model_type)?.download_only(model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedBackend;

    fn factory() -> (LoaderFactory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let factory =
            LoaderFactory::with_defaults(Arc::new(SimulatedBackend::new()), dir.path());
        (factory, dir)
    }

    #[test]
    fn picks_first_supporting_loader() {
        let (factory, _dir) = factory();
        assert_eq!(factory.len(), 2);
        assert_eq!(
            factory.detect_model_type("sentence-transformers/all-MiniLM-L6-v2").unwrap(),
            ModelType::Embedding
        );
        assert_eq!(
            factory.detect_model_type("Qwen/Qwen2-0.5B").unwrap(),
            ModelType::TextGeneration
        );
    }

    #[test]
    fn unknown_model_without_type_has_no_loader() {
        let (factory, _dir) = factory();
        let err = factory.loader_for("m1", None).err().unwrap();
        assert_eq!(err.code, ErrorCode::NoLoaderFound);
    }

    #[test]
    fn explicit_type_selects_family() {
        let (factory, _dir) = factory();
        let model = factory
            .load_model("m1", Some(ModelType::Embedding), "cpu")
            .unwrap();
        assert_eq!(model.model_type, ModelType::Embedding);
    }

    #[test]
    fn empty_factory() {
        let factory = LoaderFactory::new();
        assert!(factory.is_empty());
        assert_eq!(
            factory
                .load_model("gpt2", Some(ModelType::TextGeneration), "cpu")
                .unwrap_err()
                .code,
            ErrorCode::NoLoaderFound
        );
    }
}
