use crate::process::FileOutcome;
use crate::{DispatchState, Pipeline};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) type SharedQueue = Arc<AsyncMutex<mpsc::Receiver<std::path::PathBuf>>>;

/// Marks `path` in flight. Returns false when it is already queued or being
/// processed.
pub(crate) fn try_claim(path: &Path, dispatch: &Arc<Mutex<DispatchState>>) -> bool {
    let mut state = dispatch.lock().expect("dispatch mutex poisoned");
    state.inflight.insert(path.to_path_buf())
}

pub(crate) fn complete_work(path: &Path, dispatch: &Arc<Mutex<DispatchState>>) {
    let mut state = dispatch.lock().expect("dispatch mutex poisoned");
    state.inflight.remove(path);
}

pub(crate) async fn run_worker(
    worker_id: usize,
    pipeline: Arc<Pipeline>,
    queue: SharedQueue,
    shutdown: CancellationToken,
) {
    debug!("upload worker {worker_id} started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = async { queue.lock().await.recv().await } => next,
        };

        let Some(path) = next else {
            break;
        };

        handle_file(&pipeline, &path).await;
        complete_work(&path, &pipeline.dispatch);
    }

    debug!("upload worker {worker_id} stopped");
}

/// Processes one file and deletes it on success. Failures are logged and the
/// file is left for a later scan.
pub(crate) async fn handle_file(pipeline: &Pipeline, path: &Path) {
    let started = Instant::now();
    info!("start handle {}", path.display());

    match pipeline.processor.process(path).await {
        Ok(outcome) => {
            let metrics = &pipeline.metrics;
            match outcome {
                FileOutcome::Empty => {
                    metrics.files_empty.fetch_add(1, Ordering::Relaxed);
                }
                FileOutcome::Uploaded { tree_rows } => {
                    metrics.files_uploaded.fetch_add(1, Ordering::Relaxed);
                    metrics
                        .tree_rows_uploaded
                        .fetch_add(tree_rows as u64, Ordering::Relaxed);
                    info!(
                        "handle {} success, tree_rows={}, time={:?}",
                        path.display(),
                        tree_rows,
                        started.elapsed()
                    );
                }
            }
            pipeline.retry.record_success(path);

            match std::fs::remove_file(path) {
                Ok(()) => info!("{} deleted", path.display()),
                Err(exc) => {
                    metrics.delete_failures.fetch_add(1, Ordering::Relaxed);
                    error!("remove {} failed: {exc}", path.display());
                }
            }
        }
        Err(exc) => {
            pipeline.metrics.files_failed.fetch_add(1, Ordering::Relaxed);
            error!(
                "handle {} failed after {:?}: {exc}",
                path.display(),
                started.elapsed()
            );
            let delay = pipeline.retry.record_failure(path, Instant::now());
            if !delay.is_zero() {
                warn!("{} retry deferred for {:?}", path.display(), delay);
            }
        }
    }
}
