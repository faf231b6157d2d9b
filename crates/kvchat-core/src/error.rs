//! Error types for kvchat core.

use crate::config::ConfigError;
use kvchat_abstraction::EngineError;
use kvchat_models::CatalogError;
use serde::Serialize;
use thiserror::Error;

/// Core error type for cache lifecycle operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A referenced document, model, or cache does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A cache's owning model differs from the model it would be loaded into.
    #[error("Cache was created with model '{cache_model}' and cannot be loaded into '{requested_model}'")]
    Incompatible {
        /// Model recorded for the cache.
        cache_model: String,
        /// Model that was about to receive the state.
        requested_model: String,
    },

    /// Engine state could not be captured or written.
    #[error("Serialization failure: {0}")]
    Serialization(String),

    /// A transition is already in flight.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The model produced zero tokens.
    #[error("Model generated an empty response")]
    EmptyGeneration,

    /// A filesystem race that survived one retry.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Model catalog errors
    #[error("Model catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// The operation observed its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// A background worker went away or rejected the job.
    #[error("Background worker unavailable: {0}")]
    WorkerClosed(String),
}

/// Coarse error category for callers that branch on failure type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing document, model, or cache.
    NotFound,
    /// Model mismatch; degrade to fallback.
    Incompatible,
    /// State capture or persistence failed.
    Serialization,
    /// Another transition holds the lock.
    ConcurrencyConflict,
    /// Nothing was generated; offer a retry.
    EmptyGeneration,
    /// Storage failures.
    Io,
    /// Engine failures.
    Engine,
    /// Invalid configuration.
    Config,
    /// Cancelled by the caller.
    Cancelled,
    /// Worker plumbing failures.
    Internal,
}

impl CoreError {
    /// Maps the error to its category.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Incompatible { .. } => ErrorKind::Incompatible,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::EmptyGeneration => ErrorKind::EmptyGeneration,
            Self::TransientIo(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Io,
            Self::Engine(EngineError::ModelNotFound(_)) => ErrorKind::NotFound,
            Self::Engine(_) => ErrorKind::Engine,
            Self::Config(_) | Self::Catalog(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::WorkerClosed(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn not_found(what: &str, path: &std::path::Path) -> Self {
        Self::NotFound(format!("{what} {}", path.display()))
    }
}

/// Result type alias for kvchat core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_conversion() {
        let err: CoreError = EngineError::State("bad blob".to_string()).into();
        match err {
            CoreError::Engine(EngineError::State(msg)) => assert_eq!(msg, "bad blob"),
            _ => panic!("Expected Engine error variant"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: CoreError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(CoreError::EmptyGeneration.kind(), ErrorKind::EmptyGeneration);
        assert_eq!(
            CoreError::Incompatible {
                cache_model: "a".to_string(),
                requested_model: "b".to_string()
            }
            .kind(),
            ErrorKind::Incompatible
        );
        assert_eq!(
            CoreError::Engine(EngineError::ModelNotFound("m".to_string())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(CoreError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_display() {
        assert_eq!(CoreError::EmptyGeneration.to_string(), "Model generated an empty response");
        let err = CoreError::Incompatible {
            cache_model: "m1".to_string(),
            requested_model: "m2".to_string(),
        };
        assert!(err.to_string().contains("'m1'"));
    }
}
