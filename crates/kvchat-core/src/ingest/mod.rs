//! Document ingestion.

pub mod persist;
pub mod pipeline;
pub mod sizing;
pub mod tokens;

pub use persist::persist_state;
pub use pipeline::{IngestFailure, IngestOutcome, IngestRequest, IngestStage, IngestionPipeline};
pub use sizing::ContextSizing;
pub use tokens::{
    ContextFit, FitReport, LARGE_FILE_BYTES, TokenEstimate, bytes_per_token, document_id_from_path,
    estimate_file, estimate_tokens,
};
