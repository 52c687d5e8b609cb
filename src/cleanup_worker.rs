//! Deferred cleanup queue drained by a single background worker

use crate::temp_files::TempFileManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug)]
enum CleanupJob {
    Remove(PathBuf),
    Sweep(Duration),
}

/// Handle for scheduling work on the cleanup worker
#[derive(Clone)]
pub struct CleanupQueue {
    tx: flume::Sender<CleanupJob>,
    manager: Arc<TempFileManager>,
}

impl CleanupQueue {
    /// Spawn the worker on `task_tracker` and return the queue feeding it
    pub fn spawn(
        manager: Arc<TempFileManager>,
        capacity: usize,
        cancellation_token: CancellationToken,
        task_tracker: &TaskTracker,
    ) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let worker_manager = manager.clone();

        task_tracker.spawn(async move {
            debug!("Cleanup worker started");
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        // Finish whatever is already queued before exiting
                        let pending: Vec<CleanupJob> = rx.try_iter().collect();
                        info!("Cleanup worker cancelled, draining {} queued jobs", pending.len());
                        for job in pending {
                            run_job(&worker_manager, job).await;
                        }
                        break;
                    }
                    job = rx.recv_async() => match job {
                        Ok(job) => run_job(&worker_manager, job).await,
                        Err(_) => {
                            debug!("Cleanup queue closed, worker exiting");
                            break;
                        }
                    }
                }
            }
        });

        Self { tx, manager }
    }

    /// Schedule removal of a file. Falls back to removing it inline when the
    /// queue is full or the worker is gone.
    pub fn schedule_removal(&self, path: PathBuf) {
        if let Err(e) = self.tx.try_send(CleanupJob::Remove(path)) {
            if let CleanupJob::Remove(path) = e.into_inner() {
                debug!(
                    "Cleanup queue unavailable, removing {} inline",
                    path.display()
                );
                self.manager.cleanup(&path);
            }
        }
    }

    /// Schedule a sweep. Skipped when the queue is saturated; the next trigger retries.
    pub fn schedule_sweep(&self, max_age: Duration) -> bool {
        match self.tx.try_send(CleanupJob::Sweep(max_age)) {
            Ok(()) => true,
            Err(_) => {
                debug!("Cleanup queue unavailable, skipping sweep");
                false
            }
        }
    }
}

async fn run_job(manager: &TempFileManager, job: CleanupJob) {
    match job {
        CleanupJob::Remove(path) => {
            manager.cleanup(&path);
        }
        CleanupJob::Sweep(max_age) => {
            let report = manager.sweep(max_age).await;
            debug!("Sweep finished: {:?}", report);
        }
    }
}

/// Removes a file through the cleanup queue once dropped.
///
/// Held by the response body stream so the output file outlives the transfer.
pub struct DeferredCleanup {
    path: Option<PathBuf>,
    queue: CleanupQueue,
}

impl DeferredCleanup {
    pub fn new(path: PathBuf, queue: CleanupQueue) -> Self {
        Self {
            path: Some(path),
            queue,
        }
    }
}

impl Drop for DeferredCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.queue.schedule_removal(path);
        }
    }
}

/// Periodically schedule sweeps until cancelled
pub fn spawn_periodic_sweep(
    queue: CleanupQueue,
    interval: Duration,
    max_age: Duration,
    cancellation_token: CancellationToken,
    task_tracker: &TaskTracker,
) {
    if interval.is_zero() {
        warn!("Periodic temp sweep disabled");
        return;
    }

    task_tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Periodic temp sweep cancelled, exiting");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    queue.schedule_sweep(max_age);
                }
            }
        }
    });
}
