//! Outward events.
//!
//! Every observable state change of the core is published on an [`EventBus`]
//! backed by a `tokio::sync::broadcast` channel. Subscribers react to events;
//! they never receive errors thrown across worker boundaries.
//!
//! Handlers must not call `CacheStore::scan_and_reconcile` synchronously in
//! response to [`CoreEvent::CacheListChanged`]. Use
//! `StoreWatcher::request_rescan`, which defers the scan to the watcher task.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

/// Status of the cache used for the current conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// No cache activity.
    Idle,
    /// A warm-up is in progress.
    Warming,
    /// A cache is resident in the warm instance.
    Warmed,
    /// A cache was loaded for a single request.
    UsingTempCache,
    /// Generating without cached state.
    Fallback,
    /// The last cache operation failed.
    Error,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Warming => "warming",
            Self::Warmed => "warmed",
            Self::UsingTempCache => "using temporary cache",
            Self::Fallback => "fallback",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Events emitted by the core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// Ingestion progress, 0 to 100.
    IngestionProgress {
        /// Document being ingested.
        document_id: String,
        /// Percent complete.
        percent: u8,
    },
    /// Ingestion finished.
    IngestionComplete {
        /// Document that was ingested.
        document_id: String,
        /// Whether a cache was produced.
        success: bool,
        /// Cache path on success, failure description otherwise.
        message: String,
    },
    /// A document's token count was estimated.
    TokenEstimationComplete {
        /// Document estimated.
        document_id: String,
        /// Estimated tokens.
        tokens: u64,
        /// Whether it fits the model's context window.
        fits_context: bool,
    },
    /// The set of tracked caches changed.
    CacheListChanged,
    /// A purge finished.
    CachePurged {
        /// Purged blob path.
        path: PathBuf,
        /// Whether the purge succeeded.
        success: bool,
    },
    /// A warm-up began.
    WarmUpStarted {
        /// Cache being warmed.
        cache_path: PathBuf,
    },
    /// A cache became resident.
    WarmedUp {
        /// Resident cache.
        cache_path: PathBuf,
        /// Model plus state load time.
        load_time_ms: u64,
        /// Tokens held by the cache.
        token_count: u64,
        /// Blob size in bytes.
        file_size: u64,
    },
    /// The warm instance was discarded.
    Unloaded,
    /// The conversation's cache status changed.
    CacheStatusChanged {
        /// New status.
        status: CacheStatus,
    },
    /// Generation began.
    ResponseStarted,
    /// A streamed piece of the response.
    ResponseChunk {
        /// Text produced since the previous chunk.
        text: String,
    },
    /// Generation finished.
    ResponseComplete {
        /// Full response text.
        text: String,
        /// Whether generation succeeded.
        success: bool,
    },
    /// A recoverable problem worth showing the user.
    Warning {
        /// Description.
        message: String,
    },
    /// A failure.
    Error {
        /// Description.
        message: String,
    },
}

/// Broadcast channel for core events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per slow subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) {
        trace!(?event, "Emitting event");
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drains every event currently queued on `rx`.
#[must_use]
pub fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(CoreEvent::CacheListChanged);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribe_and_drain() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::ResponseStarted);
        bus.emit(CoreEvent::ResponseChunk { text: "hi".to_string() });
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], CoreEvent::ResponseStarted);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::CacheStatusChanged { status: CacheStatus::UsingTempCache };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cache_status_changed");
        assert_eq!(json["status"], "using_temp_cache");
    }
}
