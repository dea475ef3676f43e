use super::*;
use serde_json::json;
use std::io::Write;

fn write_config(ext: &str, body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(&format!(".{ext}"))
        .tempfile()
        .unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
fn detects_formats_from_extension() {
    assert_eq!(detect_format("a.yaml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("a.yml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("a.TOML").unwrap(), FileFormat::Toml);
    assert_eq!(detect_format("a.json").unwrap(), FileFormat::Json);
    assert_eq!(detect_format("a.json5").unwrap(), FileFormat::Json5);
    assert!(matches!(
        detect_format("a.txt"),
        Err(ConfigError::UnsupportedFormat(_))
    ));
    assert!(detect_format("noext").is_err());
}

#[test]
fn substitutes_braced_and_bare_variables() {
    unsafe {
        std::env::set_var("MODELHOST_TEST_SUBST_DIR", "/opt/models");
    }
    let out = substitute_env_vars("a=${MODELHOST_TEST_SUBST_DIR} b=$MODELHOST_TEST_SUBST_DIR");
    assert_eq!(out, "a=/opt/models b=/opt/models");

    let untouched = substitute_env_vars("c=${MODELHOST_TEST_SURELY_UNSET}");
    assert_eq!(untouched, "c=${MODELHOST_TEST_SURELY_UNSET}");
}

#[test]
fn defaults_match_documented_values() {
    let config = ServiceConfig::default();
    assert!(config.worker_pool.enabled);
    assert_eq!(config.worker_pool.num_workers, 1);
    assert_eq!(config.worker_pool.devices, vec!["auto".to_string()]);
    assert_eq!(config.worker_pool.load_balancing, LoadBalancing::RoundRobin);
    assert_eq!(config.worker_pool.queue_timeout(), Duration::from_secs(1));
    assert_eq!(config.embedding_cache.max_cache_size, 10_000);
    assert_eq!(config.embedding_cache.ttl_seconds, 3600);
    assert_eq!(config.lifecycle.idle_scan_interval(), Duration::from_secs(60));
    assert_eq!(config.lifecycle.default_keep_alive, 300);
    assert_eq!(config.paths.data_dir, PathBuf::from("./data"));
    config.validate().unwrap();
}

#[test]
fn loads_partial_toml_with_defaults() {
    let file = write_config(
        "toml",
        r#"
[worker_pool]
num_workers = 3
devices = ["cpu", "cuda:0"]
load_balancing = "least_busy"

[embedding_cache]
ttl_seconds = 10
"#,
    );
    let config: ServiceConfig = load_config(file.path()).unwrap();
    assert_eq!(config.worker_pool.num_workers, 3);
    assert_eq!(config.worker_pool.devices, vec!["cpu", "cuda:0"]);
    assert_eq!(config.worker_pool.load_balancing, LoadBalancing::LeastBusy);
    assert_eq!(config.worker_pool.max_workers, 16);
    assert_eq!(config.embedding_cache.ttl_seconds, 10);
    assert!(config.embedding_cache.enabled);
}

#[test]
fn loads_yaml() {
    let file = write_config(
        "yaml",
        "worker_pool:\n  enabled: false\nlifecycle:\n  default_keep_alive: 5\n",
    );
    let config: ServiceConfig = load_config(file.path()).unwrap();
    assert!(!config.worker_pool.enabled);
    assert_eq!(config.lifecycle.default_keep_alive, 5);
}

#[test]
fn later_sources_override_earlier() {
    let base = r#"{ "worker_pool": { "num_workers": 2, "require_gpu": true } }"#;
    let over = r#"{ "worker_pool": { "num_workers": 4 } }"#;
    let config: ServiceConfig =
        merge_configs(&[(base, FileFormat::Json), (over, FileFormat::Json)]).unwrap();
    assert_eq!(config.worker_pool.num_workers, 4);
    assert!(config.worker_pool.require_gpu);
}

#[test]
fn env_overrides_file_values() {
    let file = write_config("toml", "[worker_pool]\nnum_workers = 1\n");
    unsafe {
        std::env::set_var("MODELHOSTENVTEST_WORKER_POOL__NUM_WORKERS", "5");
    }
    let config: ServiceConfig = load_with_env(file.path(), "MODELHOSTENVTEST").unwrap();
    assert_eq!(config.worker_pool.num_workers, 5);
    unsafe {
        std::env::remove_var("MODELHOSTENVTEST_WORKER_POOL__NUM_WORKERS");
    }
}

#[test]
fn from_map_builds_nested_sections() {
    let map = HashMap::from([
        ("worker_pool.num_workers".to_string(), json!(2)),
        ("worker_pool.devices".to_string(), json!(["cpu"])),
        ("embedding_cache.enabled".to_string(), json!(false)),
        ("lifecycle.idle_scan_interval".to_string(), json!(5)),
    ]);
    let config = ServiceConfig::from_map(&map).unwrap();
    assert_eq!(config.worker_pool.num_workers, 2);
    assert_eq!(config.worker_pool.devices, vec!["cpu"]);
    assert!(!config.embedding_cache.enabled);
    assert_eq!(config.lifecycle.idle_scan_interval, 5);
    assert_eq!(config.worker_pool.task_timeout, 300.0);
}

#[test]
fn from_map_rejects_conflicting_keys() {
    let map = HashMap::from([
        ("worker_pool".to_string(), json!(1)),
        ("worker_pool.enabled".to_string(), json!(true)),
    ]);
    assert!(ServiceConfig::from_map(&map).is_err());
}

#[test]
fn validation_rejects_worker_count_above_cap() {
    let mut config = ServiceConfig::default();
    config.worker_pool.num_workers = 20;
    let err = config.validate().unwrap_err();
    let service: ServiceError = err.into();
    assert_eq!(service.code, ErrorCode::InvalidWorkerCount);
}

#[test]
fn validation_rejects_non_positive_timeouts() {
    let mut config = ServiceConfig::default();
    config.worker_pool.task_timeout = 0.0;
    let service: ServiceError = config.validate().unwrap_err().into();
    assert_eq!(service.code, ErrorCode::InvalidConfiguration);
}
