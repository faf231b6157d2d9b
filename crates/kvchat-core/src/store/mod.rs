//! Cache store: state blobs on disk plus the registries describing them.
//!
//! The store directory holds one `<cache_id>.kvcache` blob per cache entry,
//! `cache_registry.json` keyed by blob path, and `document_registry.json`
//! written by ingestion. [`CacheStore`] owns all three and is the only
//! component that deletes blobs.
//!
//! Purges delete the blob first and only then drop the registry row, under
//! the registry's mutation lock, so concurrent purges of one path observe a
//! single deletion.

pub mod documents;
pub mod entry;
pub(crate) mod fsutil;
pub mod registry;
pub mod watcher;

pub use documents::{DOCUMENT_REGISTRY_FILE, DocumentRecord, DocumentRegistry};
pub use entry::{BLOB_EXTENSION, CacheEntry, CacheRegistration, UNKNOWN_MODEL};
pub use registry::{CacheRegistry, REGISTRY_FILE};
pub use watcher::StoreWatcher;

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use chrono::Utc;
use fsutil::{file_stat, normalize_path};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Outcome of a directory reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Blob files that became tracked.
    pub added: Vec<PathBuf>,
    /// Entries dropped because their blob disappeared.
    pub removed: Vec<PathBuf>,
    /// Tracked entries whose size or mtime was refreshed.
    pub refreshed: usize,
}

impl ScanReport {
    /// Whether the set of tracked entries changed.
    #[must_use]
    pub fn set_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Successful purge outcomes. Both count as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// The blob file was deleted by this call.
    Deleted,
    /// The blob file was already gone.
    AlreadyAbsent,
}

/// Result of purging every cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeAllReport {
    /// Blobs deleted.
    pub deleted: Vec<PathBuf>,
    /// Entries whose blob was already gone.
    pub already_absent: Vec<PathBuf>,
    /// Entries that could not be purged, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

impl PurgeAllReport {
    /// False if any item failed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Formats a byte count for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b < KB => format!("{b} B"),
        b if b < MB => format!("{:.1} KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.1} MB", b as f64 / MB as f64),
        b => format!("{:.1} GB", b as f64 / GB as f64),
    }
}

/// Filesystem area holding state blobs and the registries.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    registry: CacheRegistry,
    documents: DocumentRegistry,
    events: EventBus,
}

impl CacheStore {
    /// Opens (creating if needed) the store at `dir`.
    ///
    /// Does not scan; call [`CacheStore::scan_and_reconcile`] after opening.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the registry
    /// file cannot be read.
    pub fn open(dir: impl AsRef<Path>, events: EventBus) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let dir = normalize_path(dir);
        info!(store_dir = %dir.display(), "Opening cache store");
        Ok(Self {
            registry: CacheRegistry::open(&dir)?,
            documents: DocumentRegistry::open(&dir),
            dir,
            events,
        })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Event bus this store publishes on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Document registry.
    #[must_use]
    pub fn documents(&self) -> &DocumentRegistry {
        &self.documents
    }

    /// Underlying cache registry.
    #[must_use]
    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    /// Deterministic blob location for a cache id.
    #[must_use]
    pub fn blob_path_for(&self, cache_id: &str) -> PathBuf {
        self.dir.join(format!("{cache_id}.{BLOB_EXTENSION}"))
    }

    fn blob_files(&self) -> Result<BTreeMap<PathBuf, (u64, Option<chrono::DateTime<Utc>>)>> {
        let mut found = BTreeMap::new();
        for item in std::fs::read_dir(&self.dir)? {
            let path = match item {
                Ok(item) => item.path(),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            match file_stat(&path) {
                Some(stat) => {
                    found.insert(path, stat);
                }
                None => debug!(path = %path.display(), "Ignoring non-file blob entry"),
            }
        }
        Ok(found)
    }

    fn recover_entry(
        &self,
        path: &Path,
        size: u64,
        modified: Option<chrono::DateTime<Utc>>,
    ) -> CacheEntry {
        let document_id = path
            .file_stem()
            .map_or_else(String::new, |s| s.to_string_lossy().into_owned());
        let record = self.documents.get(&document_id);

        let owning_model_id = record
            .as_ref()
            .map(|r| r.model_id.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string());

        CacheEntry {
            id: document_id,
            storage_path: path.to_path_buf(),
            source_document_path: record.as_ref().map(|r| r.original_file_path.clone()),
            owning_model_id,
            token_count: record.as_ref().map_or(0, |r| r.token_count),
            context_window_size: record.as_ref().map_or(0, |r| r.context_size),
            created_at: record
                .as_ref()
                .map(|r| r.created_at)
                .or(modified)
                .unwrap_or_else(Utc::now),
            last_used_at: None,
            usage_count: 0,
            is_master: record.as_ref().is_some_and(|r| r.is_master),
            size_bytes: size,
            modified_at: modified,
        }
    }

    /// Reconciles the registry with the blob files on disk.
    ///
    /// Untracked blobs are added with metadata recovered from the document
    /// registry (or marked unknown); entries whose blob is gone are removed.
    /// Emits [`CoreEvent::CacheListChanged`] only when the tracked set changed.
    /// Never triggers another scan.
    ///
    /// # Errors
    /// Returns an error if the store directory cannot be listed.
    pub fn scan_and_reconcile(&self) -> Result<ScanReport> {
        self.documents.reload();

        // Listing under the registry lock keeps a concurrent purge from
        // being re-added between the listing and the reconcile.
        let report = self.registry.mutate(|map| {
            let found = match self.blob_files() {
                Ok(found) => found,
                Err(e) => return (Err(e), false),
            };
            let mut report = ScanReport::default();

            for (path, (size, modified)) in &found {
                match map.get_mut(path) {
                    Some(entry) => {
                        if entry.size_bytes != *size || entry.modified_at != *modified {
                            entry.size_bytes = *size;
                            entry.modified_at = *modified;
                            report.refreshed += 1;
                        }
                    }
                    None => {
                        let entry = self.recover_entry(path, *size, *modified);
                        debug!(cache_path = %path.display(), model_id = %entry.owning_model_id, "Tracking new cache file");
                        map.insert(path.clone(), entry);
                        report.added.push(path.clone());
                    }
                }
            }

            let removed: Vec<PathBuf> =
                map.keys().filter(|path| !found.contains_key(*path)).cloned().collect();
            for path in &removed {
                info!(cache_path = %path.display(), "Removing missing cache file from registry");
                map.remove(path);
            }
            report.removed = removed;

            let changed = report.set_changed() || report.refreshed > 0;
            (Ok(report), changed)
        })?;

        if report.set_changed() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                "Cache list updated"
            );
            self.events.emit(CoreEvent::CacheListChanged);
        } else if report.refreshed > 0 {
            debug!(refreshed = report.refreshed, "Cache metadata refreshed, list unchanged");
        }
        Ok(report)
    }

    /// Picks up registry edits made by other processes.
    ///
    /// # Errors
    /// Returns an error if a changed registry file cannot be read.
    pub fn reload_external(&self) -> Result<bool> {
        self.documents.reload();
        self.registry.reload_if_changed()
    }

    /// Registers (or overwrites) the entry for an existing blob file.
    ///
    /// # Errors
    /// Returns `NotFound` if the blob does not exist; the registry is untouched.
    pub fn register(&self, registration: CacheRegistration) -> Result<CacheEntry> {
        let key = normalize_path(&registration.storage_path);
        let Some((size, modified)) = file_stat(&key) else {
            warn!(cache_path = %key.display(), "Refusing to register missing cache file");
            return Err(CoreError::not_found("cache file", &key));
        };

        let entry = CacheEntry {
            id: registration.id,
            storage_path: key.clone(),
            source_document_path: registration.source_document_path,
            owning_model_id: registration.model_id,
            token_count: registration.token_count,
            context_window_size: registration.context_window,
            created_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
            is_master: registration.is_master,
            size_bytes: size,
            modified_at: modified,
        };

        let is_new = self.registry.mutate(|map| {
            let is_new = map.insert(key.clone(), entry.clone()).is_none();
            (is_new, true)
        });

        info!(
            cache_path = %key.display(),
            document_id = %entry.id,
            model_id = %entry.owning_model_id,
            tokens = entry.token_count,
            "Registered cache"
        );
        if is_new {
            self.events.emit(CoreEvent::CacheListChanged);
        }
        Ok(entry)
    }

    /// Looks up an entry by blob path.
    #[must_use]
    pub fn get(&self, storage_path: &Path) -> Option<CacheEntry> {
        let key = normalize_path(storage_path);
        self.registry.read(|map| map.get(&key).cloned())
    }

    /// Looks up an entry by cache id.
    #[must_use]
    pub fn find_by_id(&self, cache_id: &str) -> Option<CacheEntry> {
        self.registry.read(|map| map.values().find(|e| e.id == cache_id).cloned())
    }

    /// All entries, most recently used (or created) first.
    #[must_use]
    pub fn list(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.registry.read(|map| map.values().cloned().collect());
        entries.sort_by(|a, b| {
            b.recency().cmp(&a.recency()).then_with(|| a.storage_path.cmp(&b.storage_path))
        });
        entries
    }

    /// Bumps usage stats. Returns false for untracked paths.
    pub fn record_usage(&self, storage_path: &Path) -> bool {
        let key = normalize_path(storage_path);
        let updated = self.registry.mutate(|map| match map.get_mut(&key) {
            Some(entry) => {
                let now = Utc::now();
                entry.usage_count += 1;
                entry.last_used_at = Some(entry.last_used_at.map_or(now, |last| last.max(now)));
                (true, true)
            }
            None => (false, false),
        });
        if updated {
            debug!(cache_path = %key.display(), "Recorded cache usage");
        } else {
            debug!(cache_path = %key.display(), "Usage recorded for untracked cache ignored");
        }
        updated
    }

    /// Deletes a blob, then its registry row.
    ///
    /// A blob that is already gone counts as success.
    ///
    /// # Errors
    /// Returns an error if the blob exists but cannot be deleted; the registry
    /// row is kept in that case.
    pub fn purge(&self, storage_path: &Path) -> Result<PurgeOutcome> {
        let key = normalize_path(storage_path);
        info!(cache_path = %key.display(), "Purging cache");

        let result = self.registry.mutate(|map| {
            let deleted = match std::fs::remove_file(&key) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return (Err(e), false),
            };
            let tracked = map.remove(&key).is_some();
            (Ok((deleted, tracked)), tracked)
        });

        match result {
            Ok((deleted, tracked)) => {
                if let Err(e) = self.documents.remove_by_cache_path(&key) {
                    warn!(cache_path = %key.display(), error = %e, "Failed to update document registry");
                }
                if !deleted {
                    debug!(cache_path = %key.display(), "Cache file already absent");
                }
                self.events.emit(CoreEvent::CachePurged { path: key, success: true });
                if tracked {
                    self.events.emit(CoreEvent::CacheListChanged);
                }
                Ok(if deleted { PurgeOutcome::Deleted } else { PurgeOutcome::AlreadyAbsent })
            }
            Err(e) => {
                error!(cache_path = %key.display(), error = %e, "Failed to purge cache");
                self.events.emit(CoreEvent::CachePurged { path: key, success: false });
                Err(e.into())
            }
        }
    }

    /// Purges every tracked entry and every blob file in the directory,
    /// continuing past individual failures.
    pub fn purge_all(&self) -> PurgeAllReport {
        let mut targets: Vec<PathBuf> = self.registry.read(|map| map.keys().cloned().collect());
        match self.blob_files() {
            Ok(files) => {
                for path in files.into_keys() {
                    if !targets.contains(&path) {
                        targets.push(path);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not list store directory during purge"),
        }

        let mut report = PurgeAllReport::default();
        for path in targets {
            match self.purge(&path) {
                Ok(PurgeOutcome::Deleted) => report.deleted.push(path),
                Ok(PurgeOutcome::AlreadyAbsent) => report.already_absent.push(path),
                Err(e) => report.failed.push((path, e.to_string())),
            }
        }

        info!(
            deleted = report.deleted.len(),
            already_absent = report.already_absent.len(),
            failed = report.failed.len(),
            "Finished purging all caches"
        );
        report
    }

    /// Sum of blob sizes of tracked entries. Missing blobs count as zero.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        let paths: Vec<PathBuf> = self.registry.read(|map| map.keys().cloned().collect());
        paths.iter().filter_map(|p| file_stat(p)).map(|(size, _)| size).sum()
    }

    /// Entries whose token requirement exceeds `candidate_context_window`.
    #[must_use]
    pub fn compatibility_check(&self, candidate_context_window: u64) -> Vec<PathBuf> {
        self.registry.read(|map| {
            map.values()
                .filter(|e| e.required_tokens() > candidate_context_window)
                .map(|e| e.storage_path.clone())
                .collect()
        })
    }

    /// Flags `storage_path` as the master cache, clearing every other flag.
    ///
    /// # Errors
    /// Returns `NotFound` if the path is not tracked.
    pub fn set_master(&self, storage_path: &Path) -> Result<()> {
        let key = normalize_path(storage_path);
        let found = self.registry.mutate(|map| {
            if !map.contains_key(&key) {
                return (false, false);
            }
            for (path, entry) in map.iter_mut() {
                entry.is_master = *path == key;
            }
            (true, true)
        });
        if !found {
            return Err(CoreError::not_found("cache", &key));
        }
        if let Err(e) = self.documents.set_master(&key) {
            warn!(cache_path = %key.display(), error = %e, "Failed to update document registry");
        }
        info!(cache_path = %key.display(), "Master cache set");
        Ok(())
    }

    /// The master cache, if one is flagged.
    #[must_use]
    pub fn master(&self) -> Option<CacheEntry> {
        self.registry.read(|map| map.values().find(|e| e.is_master).cloned())
    }
}
