//! Chat history files.

use crate::error::Result;
use crate::store::fsutil::atomic_write;
use chrono::{DateTime, Utc};
use kvchat_abstraction::ChatMessage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// On-disk chat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFile {
    /// Conversation so far.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Model that produced the answers.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Cache selected when the history was saved.
    #[serde(default)]
    pub kv_cache: Option<PathBuf>,
    /// Save time.
    pub timestamp: DateTime<Utc>,
}

impl HistoryFile {
    /// Writes the history to `path`.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &bytes)?;
        info!(path = %path.display(), messages = self.history.len(), "Chat history saved");
        Ok(())
    }

    /// Reads a history file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        let file: Self = serde_json::from_slice(&content)?;
        info!(path = %path.display(), messages = file.history.len(), "Chat history loaded");
        Ok(file)
    }
}
