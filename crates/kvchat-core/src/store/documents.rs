//! Document registry.
//!
//! Side index written by ingestion, mapping document id to what was produced
//! from it. The cache scan reads it to recover metadata for blob files that
//! the cache registry does not know about.

use super::fsutil::atomic_write;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Document registry file name inside the store directory.
pub const DOCUMENT_REGISTRY_FILE: &str = "document_registry.json";

/// What ingestion produced for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Normalized document id.
    pub document_id: String,
    /// Source document.
    pub original_file_path: PathBuf,
    /// State blob.
    pub cache_path: PathBuf,
    /// Tokens evaluated.
    #[serde(default)]
    pub token_count: u64,
    /// Context window allocated.
    #[serde(default)]
    pub context_size: u64,
    /// Producing model.
    #[serde(default)]
    pub model_id: String,
    /// When ingestion finished.
    pub created_at: DateTime<Utc>,
    /// Whether the cache is the default.
    #[serde(default)]
    pub is_master: bool,
}

/// Thread-safe, file-backed map of [`DocumentRecord`]s.
#[derive(Debug)]
pub struct DocumentRegistry {
    path: PathBuf,
    records: Mutex<BTreeMap<String, DocumentRecord>>,
}

fn read_records(path: &Path) -> BTreeMap<String, DocumentRecord> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read document registry");
            return BTreeMap::new();
        }
    };
    serde_json::from_slice(&content).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Failed to parse document registry");
        BTreeMap::new()
    })
}

impl DocumentRegistry {
    /// Opens the document registry in `store_dir`.
    #[must_use]
    pub fn open(store_dir: &Path) -> Self {
        let path = store_dir.join(DOCUMENT_REGISTRY_FILE);
        let records = read_records(&path);
        Self { path, records: Mutex::new(records) }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DocumentRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, records: &BTreeMap<String, DocumentRecord>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        atomic_write(&self.path, &bytes)?;
        Ok(())
    }

    /// Re-reads the file, picking up records written by other processes.
    pub fn reload(&self) {
        let records = read_records(&self.path);
        *self.lock() = records;
    }

    /// Looks up a document.
    #[must_use]
    pub fn get(&self, document_id: &str) -> Option<DocumentRecord> {
        self.lock().get(document_id).cloned()
    }

    /// Finds the record that produced `cache_path`.
    #[must_use]
    pub fn find_by_cache_path(&self, cache_path: &Path) -> Option<DocumentRecord> {
        self.lock().values().find(|r| r.cache_path == cache_path).cloned()
    }

    /// All records.
    #[must_use]
    pub fn all(&self) -> Vec<DocumentRecord> {
        self.lock().values().cloned().collect()
    }

    /// Inserts or replaces a record and saves.
    ///
    /// # Errors
    /// Returns an error if the registry cannot be saved. The in-memory record
    /// is kept either way.
    pub fn upsert(&self, record: DocumentRecord) -> Result<()> {
        let mut records = self.lock();
        records.insert(record.document_id.clone(), record);
        self.save(&records)
    }

    /// Removes the record pointing at `cache_path`, if any, and saves.
    ///
    /// # Errors
    /// Returns an error if the registry cannot be saved.
    pub fn remove_by_cache_path(&self, cache_path: &Path) -> Result<bool> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, r| r.cache_path != cache_path);
        if records.len() == before {
            return Ok(false);
        }
        self.save(&records)?;
        Ok(true)
    }

    /// Flags the record for `cache_path` as master and clears every other flag.
    ///
    /// # Errors
    /// Returns an error if the registry cannot be saved.
    pub fn set_master(&self, cache_path: &Path) -> Result<()> {
        let mut records = self.lock();
        for record in records.values_mut() {
            record.is_master = record.cache_path == cache_path;
        }
        self.save(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(dir: &Path, id: &str) -> DocumentRecord {
        DocumentRecord {
            document_id: id.to_string(),
            original_file_path: dir.join(format!("{id}.txt")),
            cache_path: dir.join(format!("{id}.kvcache")),
            token_count: 42,
            context_size: 2048,
            model_id: "m".to_string(),
            created_at: Utc::now(),
            is_master: false,
        }
    }

    #[test]
    fn test_upsert_persists() {
        let temp = TempDir::new().unwrap();
        let registry = DocumentRegistry::open(temp.path());
        registry.upsert(record(temp.path(), "a")).unwrap();

        let reopened = DocumentRegistry::open(temp.path());
        assert_eq!(reopened.get("a").unwrap().token_count, 42);
        assert!(reopened.get("b").is_none());
    }

    #[test]
    fn test_set_master_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let registry = DocumentRegistry::open(temp.path());
        registry.upsert(record(temp.path(), "a")).unwrap();
        registry.upsert(record(temp.path(), "b")).unwrap();

        registry.set_master(&temp.path().join("a.kvcache")).unwrap();
        registry.set_master(&temp.path().join("b.kvcache")).unwrap();

        let masters: Vec<_> = registry.all().into_iter().filter(|r| r.is_master).collect();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].document_id, "b");
    }

    #[test]
    fn test_remove_by_cache_path() {
        let temp = TempDir::new().unwrap();
        let registry = DocumentRegistry::open(temp.path());
        registry.upsert(record(temp.path(), "a")).unwrap();
        assert!(registry.remove_by_cache_path(&temp.path().join("a.kvcache")).unwrap());
        assert!(!registry.remove_by_cache_path(&temp.path().join("a.kvcache")).unwrap());
        assert!(registry.find_by_cache_path(&temp.path().join("a.kvcache")).is_none());
    }
}
