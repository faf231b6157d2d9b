//! Command implementations for the kvchat CLI.

pub mod ask;
pub mod caches;
pub mod estimate;
pub mod event_renderer;
pub mod ingest;
pub mod models;
pub mod types;

pub use types::Command;
