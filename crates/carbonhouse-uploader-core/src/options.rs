use crate::backoff::BackoffPolicy;
use carbonhouse_config::UploadConfig;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Reports whether a file is still being written and must not be picked up yet.
pub type InProgressFn = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Runtime settings of an [`Uploader`](crate::Uploader).
///
/// Built once before the pipeline starts, either directly or from the TOML
/// [`UploadConfig`] with [`UploaderOptions::from_config`].
#[derive(Clone)]
pub struct UploaderOptions {
    /// Directory scanned for files. Default `/data/carbon-clickhouse/`.
    pub path: PathBuf,
    /// Only files whose name starts with this are uploaded. Default `default.`.
    pub file_prefix: String,
    /// Raw data table. Default `graphite`.
    pub data_table: String,
    /// Whole-call timeout for the raw data insert. Default 60s.
    pub data_timeout: Duration,
    /// Tree index table; `None` skips index building. Default `graphite_tree`.
    pub tree_table: Option<String>,
    /// Whole-call timeout for the tree insert. Default 60s.
    pub tree_timeout: Duration,
    /// Number of workers, i.e. files uploaded concurrently. Default 1.
    pub threads: usize,
    /// Directory scan period. Default 1s.
    pub poll_interval: Duration,
    /// Bound of the work queue between the watcher and the workers. Default 1024.
    pub queue_capacity: usize,
    /// Delay before a failed file is picked up again. Default disabled.
    pub retry_backoff: BackoffPolicy,
    /// Default: nothing is ever in progress.
    pub in_progress: InProgressFn,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/data/carbon-clickhouse/"),
            file_prefix: "default.".to_string(),
            data_table: "graphite".to_string(),
            data_timeout: Duration::from_secs(60),
            tree_table: Some("graphite_tree".to_string()),
            tree_timeout: Duration::from_secs(60),
            threads: 1,
            poll_interval: Duration::from_secs(1),
            queue_capacity: 1024,
            retry_backoff: BackoffPolicy::disabled(),
            in_progress: Arc::new(|_: &Path| false),
        }
    }
}

impl fmt::Debug for UploaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploaderOptions")
            .field("path", &self.path)
            .field("file_prefix", &self.file_prefix)
            .field("data_table", &self.data_table)
            .field("data_timeout", &self.data_timeout)
            .field("tree_table", &self.tree_table)
            .field("tree_timeout", &self.tree_timeout)
            .field("threads", &self.threads)
            .field("poll_interval", &self.poll_interval)
            .field("queue_capacity", &self.queue_capacity)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

impl UploaderOptions {
    pub fn from_config(cfg: &UploadConfig) -> Self {
        let tree_table = Some(cfg.tree_table.trim())
            .filter(|table| !table.is_empty())
            .map(str::to_string);

        let in_progress: InProgressFn = if cfg.in_progress_quiet_seconds > 0.0 {
            quiet_period(Duration::from_secs_f64(cfg.in_progress_quiet_seconds))
        } else {
            Arc::new(|_: &Path| false)
        };

        Self {
            path: PathBuf::from(&cfg.path),
            file_prefix: cfg.file_prefix.clone(),
            data_table: cfg.data_table.clone(),
            data_timeout: Duration::from_secs_f64(cfg.data_timeout_seconds.max(0.001)),
            tree_table,
            tree_timeout: Duration::from_secs_f64(cfg.tree_timeout_seconds.max(0.001)),
            threads: cfg.threads.max(1),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(10)),
            queue_capacity: cfg.queue_capacity.max(1),
            retry_backoff: BackoffPolicy::new(
                Duration::from_secs_f64(cfg.retry_backoff_initial_seconds.max(0.0)),
                Duration::from_secs_f64(cfg.retry_backoff_max_seconds.max(0.0)),
            ),
            in_progress,
        }
    }

    pub fn with_in_progress<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.in_progress = Arc::new(predicate);
        self
    }
}

/// Treats a file modified less than `quiet` ago as still being written.
///
/// Files whose metadata cannot be read are reported as not in progress; the
/// upload itself surfaces the error.
pub fn quiet_period(quiet: Duration) -> InProgressFn {
    Arc::new(move |path: &Path| {
        let modified = match std::fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age < quiet,
            // mtime in the future
            Err(_) => true,
        }
    })
}
