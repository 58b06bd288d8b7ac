use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Tracks every background task the relay spawns and caps how many job
/// workers run at once. Jobs beyond the cap wait for a permit and stay
/// `queued` meanwhile.
pub struct WorkerPool {
    tracker: TaskTracker,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Token cancelled on shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a job worker once a permit is free. Dropped without running if
    /// the pool shuts down first.
    pub fn spawn_job<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };
            job.await;
        });
    }

    /// Long-lived task (watchers, sweeper) that does not take a worker slot.
    pub fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Job workers currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    /// Tasks spawned and not yet finished, waiting ones included.
    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything and wait for tasks to wind down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
