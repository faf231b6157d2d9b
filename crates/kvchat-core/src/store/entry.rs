//! Cache entry data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Model id recorded for caches whose origin could not be recovered.
pub const UNKNOWN_MODEL: &str = "unknown";

/// Extension of state blob files in the store directory.
pub const BLOB_EXTENSION: &str = "kvcache";

/// One persisted attention-state blob and what it means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Identifier derived from the source document name.
    pub id: String,
    /// Location of the state blob. Registry key.
    pub storage_path: PathBuf,
    /// Document the state was primed from.
    #[serde(default)]
    pub source_document_path: Option<PathBuf>,
    /// Model whose weights produced the state.
    pub owning_model_id: String,
    /// Tokens evaluated into the state.
    #[serde(default)]
    pub token_count: u64,
    /// Context window allocated when the state was produced.
    #[serde(default)]
    pub context_window_size: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time a turn consumed this cache.
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Number of turns that consumed this cache.
    #[serde(default)]
    pub usage_count: u64,
    /// Whether this is the default cache.
    #[serde(default)]
    pub is_master: bool,
    /// Blob size when last observed.
    #[serde(default)]
    pub size_bytes: u64,
    /// Blob modification time when last observed.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Whether the producing model is known.
    #[must_use]
    pub fn has_known_model(&self) -> bool {
        !self.owning_model_id.is_empty() && self.owning_model_id != UNKNOWN_MODEL
    }

    /// Whether the state may be loaded into `model_id`.
    ///
    /// Caches of unknown origin are never loadable.
    #[must_use]
    pub fn is_loadable_into(&self, model_id: &str) -> bool {
        self.has_known_model() && self.owning_model_id == model_id
    }

    /// Tokens a model must hold to use this cache.
    #[must_use]
    pub fn required_tokens(&self) -> u64 {
        if self.token_count > 0 { self.token_count } else { self.context_window_size }
    }

    /// Blob file name.
    #[must_use]
    pub fn filename(&self) -> String {
        self.storage_path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned())
    }

    /// Recency used for ordering: last use, or creation when never used.
    #[must_use]
    pub fn recency(&self) -> DateTime<Utc> {
        self.last_used_at.unwrap_or(self.created_at)
    }
}

/// Input to `CacheStore::register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRegistration {
    /// Cache identifier.
    pub id: String,
    /// Existing blob file.
    pub storage_path: PathBuf,
    /// Producing model.
    pub model_id: String,
    /// Tokens evaluated into the state.
    pub token_count: u64,
    /// Context window allocated.
    pub context_window: u64,
    /// Source document.
    pub source_document_path: Option<PathBuf>,
    /// Flag as the default cache.
    pub is_master: bool,
}
