//! Store directory watcher.
//!
//! The notify callback never scans. It only enqueues a request on a
//! one-slot channel; a dedicated task debounces requests and runs
//! `reload_external` plus `scan_and_reconcile` on a blocking worker. Requests
//! arriving while a scan runs coalesce into at most one follow-up scan.

use super::{CacheStore, DOCUMENT_REGISTRY_FILE, REGISTRY_FILE, entry::BLOB_EXTENSION};
use crate::error::{CoreError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Clonable handle for queueing a deferred rescan.
///
/// This is what event handlers use instead of scanning synchronously.
#[derive(Debug, Clone)]
pub struct RescanHandle {
    requests: mpsc::Sender<()>,
}

impl RescanHandle {
    /// Queues a rescan. Coalesces with any request already pending.
    pub fn request(&self) {
        let _ = self.requests.try_send(());
    }
}

/// Watches the store directory and reconciles on external changes.
pub struct StoreWatcher {
    _watcher: RecommendedWatcher,
    handle: RescanHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn is_relevant(path: &Path) -> bool {
    let blob = path.extension().and_then(|e| e.to_str()) == Some(BLOB_EXTENSION);
    let index = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == REGISTRY_FILE || n == DOCUMENT_REGISTRY_FILE);
    blob || index
}

impl StoreWatcher {
    /// Starts watching `store`'s directory. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    /// Returns an error if the platform watcher cannot be created.
    pub fn start(store: Arc<CacheStore>, debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1);
        let handle = RescanHandle { requests: tx };

        let callback_handle = handle.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    if event.paths.iter().any(|p| is_relevant(p)) {
                        callback_handle.request();
                    }
                }
                Err(e) => {
                    error!(error = %e, "Store watcher error");
                }
            }
        })
        .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;

        watcher
            .watch(store.dir(), RecursiveMode::NonRecursive)
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;

        info!(store_dir = %store.dir().display(), "Started watching cache store");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::run(store, rx, debounce, cancel.clone()));

        Ok(Self { _watcher: watcher, handle, cancel, task })
    }

    /// Queues a deferred rescan.
    pub fn request_rescan(&self) {
        self.handle.request();
    }

    /// Handle for queueing rescans from elsewhere.
    #[must_use]
    pub fn rescan_handle(&self) -> RescanHandle {
        self.handle.clone()
    }

    /// Stops the watcher and waits for the rescan task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Store watcher task ended abnormally");
        }
    }

    async fn run(
        store: Arc<CacheStore>,
        mut requests: mpsc::Receiver<()>,
        debounce: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(debounce) => {}
                    }
                    while requests.try_recv().is_ok() {}

                    let store = Arc::clone(&store);
                    let result = tokio::task::spawn_blocking(move || {
                        store.reload_external()?;
                        store.scan_and_reconcile()
                    })
                    .await;

                    match result {
                        Ok(Ok(report)) => debug!(
                            added = report.added.len(),
                            removed = report.removed.len(),
                            "Deferred rescan finished"
                        ),
                        Ok(Err(e)) => warn!(error = %e, "Deferred rescan failed"),
                        Err(e) => error!(error = %e, "Deferred rescan panicked"),
                    }
                }
            }
        }
        debug!("Store watcher stopped");
    }
}
