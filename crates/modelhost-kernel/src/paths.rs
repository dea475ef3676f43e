//! Filesystem layout for model caches.

use std::path::{Path, PathBuf};

/// Resolves where downloaded model files live.
pub trait DataPathProvider: Send + Sync {
    fn data_dir(&self) -> &Path;

    /// Model cache directory. Defaults to `<data_dir>/models`.
    fn models_dir(&self) -> PathBuf {
        self.data_dir().join("models")
    }
}

/// A provider rooted at a fixed directory.
#[derive(Debug, Clone)]
pub struct StaticDataPaths {
    data_dir: PathBuf,
    models_dir: Option<PathBuf>,
}

impl StaticDataPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            models_dir: None,
        }
    }

    pub fn with_models_dir(mut self, models_dir: impl Into<PathBuf>) -> Self {
        self.models_dir = Some(models_dir.into());
        self
    }
}

impl DataPathProvider for StaticDataPaths {
    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }
}
