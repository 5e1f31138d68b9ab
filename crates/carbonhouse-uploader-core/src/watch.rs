use crate::dispatch::try_claim;
use crate::Pipeline;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanOutcome {
    Completed { queued: usize },
    Cancelled,
    QueueClosed,
}

/// Regular files in `dir` whose name starts with `prefix`, sorted by path.
pub(crate) fn enumerate_candidate_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::<PathBuf>::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(exc) => {
                warn!("directory iteration error in {}: {exc}", dir.display());
                continue;
            }
        };

        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => continue,
            Ok(_) => {}
            Err(exc) => {
                warn!("failed to stat {}: {exc}", entry.path().display());
                continue;
            }
        }

        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }

        files.push(entry.path());
    }

    files.sort();
    Ok(files)
}

/// One pass over the source directory, queueing every file that is finished,
/// not backing off and not already in flight.
///
/// A blocked send gives way to `shutdown`; the path then stays marked in
/// flight.
pub(crate) async fn scan_once(
    pipeline: &Pipeline,
    tx: &mpsc::Sender<PathBuf>,
    shutdown: &CancellationToken,
) -> ScanOutcome {
    let options = &pipeline.options;
    let files = match enumerate_candidate_files(&options.path, &options.file_prefix) {
        Ok(files) => files,
        Err(exc) => {
            pipeline.metrics.scan_failures.fetch_add(1, Ordering::Relaxed);
            error!("{exc:#}");
            return ScanOutcome::Completed { queued: 0 };
        }
    };
    pipeline.retry.retain_listed(&files);

    let mut queued = 0;
    for path in files {
        if (options.in_progress)(&path) {
            debug!("{} write in progress", path.display());
            continue;
        }

        if !pipeline.retry.is_ready(&path, Instant::now()) {
            continue;
        }

        if !try_claim(&path, &pipeline.dispatch) {
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return ScanOutcome::Cancelled,
            sent = tx.send(path) => {
                if sent.is_err() {
                    return ScanOutcome::QueueClosed;
                }
                queued += 1;
            }
        }
    }

    ScanOutcome::Completed { queued }
}

pub(crate) async fn run_watcher(
    pipeline: Arc<Pipeline>,
    tx: mpsc::Sender<PathBuf>,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match scan_once(&pipeline, &tx, &shutdown).await {
                    ScanOutcome::Completed { queued } => {
                        if queued > 0 {
                            debug!("queued {queued} files from {}", pipeline.options.path.display());
                        }
                    }
                    ScanOutcome::Cancelled | ScanOutcome::QueueClosed => break,
                }
            }
        }
    }

    debug!("directory watcher stopped");
}
