//! Configuration loading and the typed service configuration.
//!
//! Files may be YAML, TOML, JSON, INI, RON or JSON5; the format is taken
//! from the extension. `${VAR}` and `$VAR` references are substituted from
//! the environment before parsing, and `MODELHOST_<SECTION>__<KEY>`
//! variables override file values.

use crate::error::{ErrorCode, ServiceError};
use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// Prefix for environment overrides, e.g. `MODELHOST_WORKER_POOL__NUM_WORKERS=2`.
pub const ENV_PREFIX: &str = "MODELHOST";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Deserialization error: {0}")]
    Deserialize(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for ServiceError {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::Invalid { key, .. } if key == "worker_pool.num_workers" => {
                ErrorCode::InvalidWorkerCount
            }
            _ => ErrorCode::InvalidConfiguration,
        };
        ServiceError::new(code, err.to_string())
    }
}

/// Map a file extension onto a `config` crate format.
pub fn detect_format(path: impl AsRef<Path>) -> ConfigResult<FileFormat> {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension".to_string()))?;

    match ext.to_ascii_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)\b")
        .expect("env reference pattern is a valid regex")
});

/// Replace `${VAR}` and `$VAR` with environment values.
///
/// Unset variables are left as written.
pub fn substitute_env_vars(content: &str) -> String {
    ENV_REF
        .replace_all(content, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_else(|_| {
                debug!(var = name, "Environment variable not set, reference kept");
                caps[0].to_string()
            })
        })
        .into_owned()
}

fn deserialize<T: DeserializeOwned>(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> ConfigResult<T> {
    builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Deserialize(e.to_string()))
}

fn file_source(path: &Path) -> ConfigResult<File<config::FileSourceString, FileFormat>> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    Ok(File::from_str(&substitute_env_vars(&content), format))
}

fn env_source(prefix: &str) -> Environment {
    Environment::with_prefix(prefix)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("worker_pool.devices")
}

/// Parse a configuration string of the given format.
pub fn from_str<T: DeserializeOwned>(content: &str, format: FileFormat) -> ConfigResult<T> {
    deserialize(Cfg::builder().add_source(File::from_str(&substitute_env_vars(content), format)))
}

/// Load a single configuration file.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> ConfigResult<T> {
    deserialize(Cfg::builder().add_source(file_source(path.as_ref())?))
}

/// Layer several in-memory sources; later ones win.
pub fn merge_configs<T: DeserializeOwned>(sources: &[(&str, FileFormat)]) -> ConfigResult<T> {
    let builder = sources.iter().fold(Cfg::builder(), |builder, (content, format)| {
        builder.add_source(File::from_str(&substitute_env_vars(content), *format))
    });
    deserialize(builder)
}

/// Layer several files; later ones win.
pub fn load_merged<T: DeserializeOwned>(paths: &[&Path]) -> ConfigResult<T> {
    let mut builder = Cfg::builder();
    for path in paths {
        builder = builder.add_source(file_source(path)?);
    }
    deserialize(builder)
}

/// Load a file, then apply `<prefix>_SECTION__KEY` environment overrides.
pub fn load_with_env<T: DeserializeOwned>(path: impl AsRef<Path>, prefix: &str) -> ConfigResult<T> {
    deserialize(
        Cfg::builder()
            .add_source(file_source(path.as_ref())?)
            .add_source(env_source(prefix)),
    )
}

/// Worker selection policy used when no affinity match exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastBusy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub enabled: bool,
    pub num_workers: usize,
    /// `auto`, `cpu` or `cuda:N`.
    pub devices: Vec<String>,
    pub require_gpu: bool,
    /// Seconds a worker waits on its queues before running the idle check.
    pub queue_timeout: f64,
    pub model_idle_timeout: f64,
    pub load_balancing: LoadBalancing,
    pub preload_embeddings: bool,
    pub default_embedding_model: String,
    pub task_timeout: f64,
    pub shutdown_grace_period: f64,
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_workers: 1,
            devices: vec!["auto".to_string()],
            require_gpu: false,
            queue_timeout: 1.0,
            model_idle_timeout: 300.0,
            load_balancing: LoadBalancing::RoundRobin,
            preload_embeddings: false,
            default_embedding_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            task_timeout: 300.0,
            shutdown_grace_period: 5.0,
            max_workers: 16,
        }
    }
}

impl WorkerPoolConfig {
    pub fn queue_timeout(&self) -> Duration {
        secs(self.queue_timeout)
    }

    pub fn model_idle_timeout(&self) -> Duration {
        secs(self.model_idle_timeout)
    }

    pub fn task_timeout(&self) -> Duration {
        secs(self.task_timeout)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        secs(self.shutdown_grace_period)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingCacheConfig {
    pub enabled: bool,
    pub max_cache_size: usize,
    pub ttl_seconds: u64,
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_size: 10_000,
            ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub idle_scan_interval: u64,
    pub default_keep_alive: u64,
    pub release_poll_interval_ms: u64,
    pub default_release_timeout: f64,
    pub direct_idle_timeout: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_scan_interval: 60,
            default_keep_alive: 300,
            release_poll_interval_ms: 100,
            default_release_timeout: 30.0,
            direct_idle_timeout: 600,
        }
    }
}

impl LifecycleConfig {
    pub fn idle_scan_interval(&self) -> Duration {
        Duration::from_secs(self.idle_scan_interval)
    }

    pub fn release_poll_interval(&self) -> Duration {
        Duration::from_millis(self.release_poll_interval_ms.max(1))
    }

    pub fn default_release_timeout(&self) -> Duration {
        secs(self.default_release_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Complete configuration for a model service instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub worker_pool: WorkerPoolConfig,
    pub embedding_cache: EmbeddingCacheConfig,
    pub lifecycle: LifecycleConfig,
    pub paths: PathsConfig,
}

impl ServiceConfig {
    /// Load from a file with `MODELHOST_*` environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let config: Self = load_with_env(path, ENV_PREFIX)?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded service configuration");
        Ok(config)
    }

    /// Defaults plus `MODELHOST_*` environment overrides.
    pub fn from_env() -> ConfigResult<Self> {
        let config: Self = deserialize(Cfg::builder().add_source(env_source(ENV_PREFIX)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from a flat map of dotted keys, e.g. `"worker_pool.num_workers" -> 2`.
    ///
    /// Unknown keys are ignored; missing keys take their defaults.
    pub fn from_map(map: &HashMap<String, Value>) -> ConfigResult<Self> {
        let mut root = serde_json::Map::new();
        for (key, value) in map {
            insert_dotted(&mut root, key, value.clone())?;
        }
        let config: Self = serde_json::from_value(Value::Object(root))
            .map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let pool = &self.worker_pool;
        if pool.max_workers == 0 {
            return Err(invalid("worker_pool.max_workers", "must be at least 1"));
        }
        if pool.num_workers > pool.max_workers {
            return Err(invalid(
                "worker_pool.num_workers",
                &format!("{} exceeds max_workers {}", pool.num_workers, pool.max_workers),
            ));
        }
        for (key, value) in [
            ("worker_pool.queue_timeout", pool.queue_timeout),
            ("worker_pool.model_idle_timeout", pool.model_idle_timeout),
            ("worker_pool.task_timeout", pool.task_timeout),
            ("worker_pool.shutdown_grace_period", pool.shutdown_grace_period),
            ("lifecycle.default_release_timeout", self.lifecycle.default_release_timeout),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(key, "must be a positive number of seconds"));
            }
        }
        if pool.devices.is_empty() {
            return Err(invalid("worker_pool.devices", "must list at least one device"));
        }
        if self.lifecycle.idle_scan_interval == 0 {
            return Err(invalid("lifecycle.idle_scan_interval", "must be at least 1 second"));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    warn!(key, reason, "Rejected service configuration");
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn insert_dotted(
    root: &mut serde_json::Map<String, Value>,
    key: &str,
    value: Value,
) -> ConfigResult<()> {
    let mut parts = key.split('.').peekable();
    let mut node = root;
    while let Some(part) = parts.next() {
        if part.is_empty() {
            return Err(invalid(key, "empty key segment"));
        }
        if parts.peek().is_none() {
            node.insert(part.to_string(), value);
            return Ok(());
        }
        let child = node
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        node = child
            .as_object_mut()
            .ok_or_else(|| invalid(key, &format!("'{part}' is both a value and a section")))?;
    }
    Ok(())
}

/// Seconds as `Duration`, clamping negatives and NaN to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
