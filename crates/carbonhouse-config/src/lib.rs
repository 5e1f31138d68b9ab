use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickHouseConfig {
    #[serde(default = "default_ch_url")]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Settings for the directory uploader.
///
/// `tree_table = ""` turns tree index building off; only raw data is loaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    #[serde(default = "default_upload_path")]
    pub path: String,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_data_table")]
    pub data_table: String,
    #[serde(default = "default_table_timeout_seconds")]
    pub data_timeout_seconds: f64,
    #[serde(default = "default_tree_table")]
    pub tree_table: String,
    #[serde(default = "default_table_timeout_seconds")]
    pub tree_timeout_seconds: f64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub in_progress_quiet_seconds: f64,
    #[serde(default)]
    pub retry_backoff_initial_seconds: f64,
    #[serde(default = "default_retry_backoff_max_seconds")]
    pub retry_backoff_max_seconds: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_ch_url(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            path: default_upload_path(),
            file_prefix: default_file_prefix(),
            data_table: default_data_table(),
            data_timeout_seconds: default_table_timeout_seconds(),
            tree_table: default_tree_table(),
            tree_timeout_seconds: default_table_timeout_seconds(),
            threads: default_threads(),
            poll_interval_ms: default_poll_interval_ms(),
            queue_capacity: default_queue_capacity(),
            in_progress_quiet_seconds: 0.0,
            retry_backoff_initial_seconds: 0.0,
            retry_backoff_max_seconds: default_retry_backoff_max_seconds(),
        }
    }
}

fn default_ch_url() -> String {
    "http://127.0.0.1:8123".to_string()
}

fn default_upload_path() -> String {
    "/data/carbon-clickhouse/".to_string()
}

fn default_file_prefix() -> String {
    "default.".to_string()
}

fn default_data_table() -> String {
    "graphite".to_string()
}

fn default_tree_table() -> String {
    "graphite_tree".to_string()
}

fn default_table_timeout_seconds() -> f64 {
    60.0
}

fn default_threads() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retry_backoff_max_seconds() -> f64 {
    60.0
}

pub fn expand_path(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{}", home.to_string_lossy(), stripped);
        }
    }
    path.to_string()
}

fn home_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".carbonhouse").join("config.toml"))
}

fn repo_default_config_path() -> PathBuf {
    PathBuf::from("config/carbonhouse.toml")
}

fn resolve_config_path_with_overrides(
    raw_path: Option<PathBuf>,
    env_keys: &[&str],
    home_path: Option<PathBuf>,
    repo_default: PathBuf,
) -> PathBuf {
    if let Some(path) = raw_path {
        return path;
    }

    for key in env_keys {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
    }

    if let Some(path) = home_path {
        if path.exists() {
            return path;
        }
    }

    repo_default
}

pub fn resolve_config_path(raw_path: Option<PathBuf>) -> PathBuf {
    resolve_config_path_with_overrides(
        raw_path,
        &["CARBONHOUSE_CONFIG"],
        home_config_path(),
        repo_default_config_path(),
    )
}

fn normalize_config(mut cfg: AppConfig) -> AppConfig {
    cfg.upload.path = expand_path(&cfg.upload.path);
    cfg.upload.tree_table = cfg.upload.tree_table.trim().to_string();
    cfg.upload.threads = cfg.upload.threads.max(1);
    cfg.upload.queue_capacity = cfg.upload.queue_capacity.max(1);
    cfg
}

pub fn parse_config(content: &str) -> Result<AppConfig> {
    let cfg: AppConfig = toml::from_str(content).context("failed to parse TOML config")?;
    Ok(normalize_config(cfg))
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
    parse_config(&content)
}
