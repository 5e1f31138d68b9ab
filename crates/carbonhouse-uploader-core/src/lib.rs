//! Bulk-loads buffered metric files into ClickHouse and keeps the tree index
//! of metric path prefixes up to date.
//!
//! A single watcher polls the source directory and feeds a bounded queue; a
//! fixed pool of workers uploads each file's raw rows, then its new tree rows,
//! and deletes the file once both inserts succeeded.

mod backoff;
mod cache;
mod dispatch;
mod error;
mod index;
mod options;
mod process;
mod sink;
mod watch;

pub use backoff::BackoffPolicy;
pub use cache::TreeCache;
pub use error::{IndexError, ProcessError, ProcessResult};
pub use index::{build_tree, effective_date, TreeBatch};
pub use options::{quiet_period, InProgressFn, UploaderOptions};
pub use process::{FileOutcome, FileProcessor};
pub use sink::TableSink;

use crate::backoff::RetryTracker;
use crate::dispatch::{run_worker, SharedQueue};
use crate::watch::run_watcher;
use anyhow::{Context, Result};
use carbonhouse_clickhouse::qualified_table;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Default)]
pub(crate) struct DispatchState {
    pub(crate) inflight: HashSet<PathBuf>,
}

#[derive(Default)]
pub(crate) struct Metrics {
    pub(crate) files_uploaded: AtomicU64,
    pub(crate) files_empty: AtomicU64,
    pub(crate) files_failed: AtomicU64,
    pub(crate) tree_rows_uploaded: AtomicU64,
    pub(crate) delete_failures: AtomicU64,
    pub(crate) scan_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub files_uploaded: u64,
    pub files_empty: u64,
    pub files_failed: u64,
    pub tree_rows_uploaded: u64,
    pub delete_failures: u64,
    pub scan_failures: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "uploaded={}, empty={}, failed={}, tree_rows={}, delete_failures={}, scan_failures={}",
            self.files_uploaded,
            self.files_empty,
            self.files_failed,
            self.tree_rows_uploaded,
            self.delete_failures,
            self.scan_failures
        )
    }
}

impl Metrics {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files_uploaded: self.files_uploaded.load(Ordering::Relaxed),
            files_empty: self.files_empty.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            tree_rows_uploaded: self.tree_rows_uploaded.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the watcher and every worker of one run.
pub(crate) struct Pipeline {
    pub(crate) options: UploaderOptions,
    pub(crate) processor: FileProcessor,
    pub(crate) dispatch: Arc<Mutex<DispatchState>>,
    pub(crate) retry: RetryTracker,
    pub(crate) metrics: Arc<Metrics>,
}

impl Pipeline {
    pub(crate) fn new(
        options: &UploaderOptions,
        sink: Arc<dyn TableSink>,
        cache: Arc<TreeCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            options: options.clone(),
            processor: FileProcessor::new(options, sink, cache),
            dispatch: Arc::new(Mutex::new(DispatchState::default())),
            retry: RetryTracker::new(options.retry_backoff),
            metrics,
        }
    }
}

pub struct Uploader {
    options: UploaderOptions,
    sink: Arc<dyn TableSink>,
    cache: Arc<TreeCache>,
    metrics: Arc<Metrics>,
}

impl Uploader {
    pub fn new(options: UploaderOptions, sink: Arc<dyn TableSink>) -> Self {
        Self {
            options,
            sink,
            cache: Arc::new(TreeCache::new()),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Uses `cache` as the set of already indexed tree keys.
    pub fn with_cache(mut self, cache: Arc<TreeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn options(&self) -> &UploaderOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<TreeCache> {
        &self.cache
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs the watcher and the worker pool until `shutdown` is cancelled.
    ///
    /// Cancellation stops new work only; uploads already in progress run to
    /// completion or to their timeout before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        qualified_table(&self.options.data_table).context("invalid data table")?;
        if let Some(tree_table) = &self.options.tree_table {
            qualified_table(tree_table).context("invalid tree table")?;
        }

        let threads = self.options.threads.max(1);
        let pipeline = Arc::new(Pipeline::new(
            &self.options,
            self.sink.clone(),
            self.cache.clone(),
            self.metrics.clone(),
        ));

        let (tx, rx) = mpsc::channel::<PathBuf>(self.options.queue_capacity.max(1));
        let queue: SharedQueue = Arc::new(AsyncMutex::new(rx));

        info!(
            "uploader running: path={}, data_table={}, tree_table={}, threads={}",
            self.options.path.display(),
            self.options.data_table,
            self.options.tree_table.as_deref().unwrap_or("<disabled>"),
            threads
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(run_watcher(
            pipeline.clone(),
            tx,
            shutdown.clone(),
            self.options.poll_interval,
        ));
        for worker_id in 0..threads {
            tasks.spawn(run_worker(
                worker_id,
                pipeline.clone(),
                queue.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(exc) = joined {
                error!("uploader task failed: {exc}");
            }
        }

        info!(
            "uploader stopped: {}, tree_keys={}",
            self.stats(),
            self.cache.len()
        );

        Ok(())
    }
}
