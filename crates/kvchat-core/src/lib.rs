//! kvchat Core - KV-cache lifecycle manager.
//!
//! This crate creates, persists, indexes, warms, reuses and invalidates
//! language-model attention state across process restarts:
//! - Cache store with a durable registry and directory reconciliation
//! - Document ingestion into persisted state blobs
//! - A single warm (model, cache) instance kept resident between turns
//! - Per-turn strategy selection between cached state and fallback prompts
//!
//! # Example
//!
//! ```rust,no_run
//! use kvchat_core::{CacheService, CoreConfig, TurnOptions};
//!
//! #[tokio::main]
//! async fn main() -> kvchat_core::Result<()> {
//!     let config = CoreConfig::load(None)?;
//!     let service = CacheService::open(config)?;
//!     let outcome = service.ask("What is this document about?", TurnOptions::default()).await?;
//!     println!("{}", outcome.text);
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod service;
pub mod session;
pub mod store;
pub mod warm;
pub mod worker;

pub use config::{ConfigError, CoreConfig};
pub use error::{CoreError, ErrorKind, Result};
pub use events::{CacheStatus, CoreEvent, EventBus};
pub use ingest::{
    ContextFit, ContextSizing, FitReport, IngestFailure, IngestOutcome, IngestRequest, IngestStage,
    IngestionPipeline, TokenEstimate,
};
pub use service::{CacheService, DocumentEstimate};
pub use session::{ActiveModel, InferenceSession, Strategy, TurnOptions, TurnOutcome};
pub use store::{CacheEntry, CacheRegistration, CacheStore, PurgeAllReport, PurgeOutcome, ScanReport, format_size};
pub use warm::{WarmInfo, WarmInstanceManager, WarmPhase, WarmSnapshot};
pub use worker::{WorkerPool, WorkerPoolConfig};
