//! Background workers.
//!
//! Long-running work never runs on the caller's task. Engine work goes
//! through [`run_blocking`]; queued jobs such as ingestion go through a
//! [`WorkerPool`] with a bounded queue and a fixed number of workers.

use crate::error::{CoreError, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs blocking engine work off the async runtime.
///
/// # Errors
/// Returns the job's error, or `WorkerClosed` if the job panicked or was
/// cancelled by runtime shutdown.
pub async fn run_blocking<T, F>(job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| CoreError::WorkerClosed(e.to_string()))?
}

type Job = BoxFuture<'static, ()>;

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Jobs running at once.
    pub workers: usize,
    /// Jobs waiting beyond those running.
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { workers: 1, queue_capacity: 16 }
    }
}

/// Fixed set of workers draining a bounded job queue.
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .field("active", &self.active_jobs())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts the workers. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(config: WorkerPoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let handles = (0..config.workers.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let cancel = cancel.clone();
                let active = Arc::clone(&active);
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            () = cancel.cancelled() => break,
                            job = async { receiver.lock().await.recv().await } => job,
                        };
                        let Some(job) = job else { break };
                        active.fetch_add(1, Ordering::SeqCst);
                        job.await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                    debug!(worker = id, "Worker stopped");
                })
            })
            .collect();

        info!(workers = config.workers.max(1), queue = config.queue_capacity, "Started worker pool");
        Self { sender, cancel, handles, active }
    }

    /// Queues `future` and returns a receiver for its output.
    ///
    /// # Errors
    /// `ConcurrencyConflict` if the queue is full, `WorkerClosed` after
    /// shutdown.
    pub fn submit<T, Fut>(&self, future: Fut) -> Result<oneshot::Receiver<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(future.await);
        });
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Background queue is full");
                CoreError::ConcurrencyConflict("background queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                CoreError::WorkerClosed("worker pool has shut down".to_string())
            }
        })?;
        Ok(rx)
    }

    /// Jobs currently running.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops accepting jobs and waits for the workers to exit. Jobs already
    /// running finish first; queued jobs are dropped.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.sender);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
    }
}
