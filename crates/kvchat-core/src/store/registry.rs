//! Durable cache index.
//!
//! The in-memory map is authoritative. Every mutation runs under one mutex and
//! persists the whole map with write-to-temp plus rename. A failed save is
//! logged, leaves the map untouched, and marks the registry dirty so the next
//! mutation writes again.

use super::entry::CacheEntry;
use super::fsutil::atomic_write;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{debug, error, warn};

/// Registry file name inside the store directory.
pub const REGISTRY_FILE: &str = "cache_registry.json";

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: BTreeMap<PathBuf, CacheEntry>,
    dirty: bool,
    observed_mtime: Option<SystemTime>,
}

/// Thread-safe, file-backed map from blob path to [`CacheEntry`].
#[derive(Debug)]
pub struct CacheRegistry {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_registry_file(path: &Path) -> Result<BTreeMap<PathBuf, CacheEntry>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        // Registry writes race with external tools; one retry, then surface.
        Err(first) => std::fs::read(path).map_err(|e| {
            CoreError::TransientIo(format!("{}: {first}; retry: {e}", path.display()))
        })?,
    };

    match serde_json::from_slice::<RegistryFile>(&content) {
        Ok(file) => Ok(file
            .entries
            .into_values()
            .map(|entry| (entry.storage_path.clone(), entry))
            .collect()),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Registry file is unreadable, starting empty; a rescan will rebuild it"
            );
            Ok(BTreeMap::new())
        }
    }
}

impl CacheRegistry {
    /// Opens the registry stored in `store_dir`, loading any existing file.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub fn open(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(REGISTRY_FILE);
        let entries = read_registry_file(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "Opened cache registry");
        Ok(Self {
            state: Mutex::new(RegistryState {
                entries,
                dirty: false,
                observed_mtime: file_mtime(&path),
            }),
            path,
        })
    }

    /// Registry file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the current entries.
    pub fn read<R>(&self, f: impl FnOnce(&BTreeMap<PathBuf, CacheEntry>) -> R) -> R {
        f(&self.lock().entries)
    }

    /// Runs `f` under the mutation lock. `f` returns its result plus whether it
    /// changed anything; changes (and pending dirty state) are persisted before
    /// the lock is released.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut BTreeMap<PathBuf, CacheEntry>) -> (R, bool)) -> R {
        let mut state = self.lock();
        let (result, changed) = f(&mut state.entries);
        if changed || state.dirty {
            self.persist(&mut state);
        }
        result
    }

    fn persist(&self, state: &mut RegistryState) {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            entries: state
                .entries
                .iter()
                .map(|(path, entry)| (path.to_string_lossy().into_owned(), entry.clone()))
                .collect(),
        };

        let bytes = match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize cache registry");
                state.dirty = true;
                return;
            }
        };

        match atomic_write(&self.path, &bytes) {
            Ok(()) => {
                state.dirty = false;
                state.observed_mtime = file_mtime(&self.path);
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to save cache registry; will retry on next change"
                );
                state.dirty = true;
            }
        }
    }

    /// Whether the last save failed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Writes pending changes now.
    ///
    /// # Errors
    /// Returns `TransientIo` if the registry is still dirty afterwards.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock();
        if state.dirty {
            self.persist(&mut state);
        }
        if state.dirty {
            return Err(CoreError::TransientIo(format!(
                "could not save {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Re-reads the registry file if something other than this process
    /// changed it. Returns whether the in-memory map was replaced.
    ///
    /// # Errors
    /// Returns an error if the changed file cannot be read.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let mut state = self.lock();
        let mtime = file_mtime(&self.path);
        if mtime.is_none() || mtime == state.observed_mtime || state.dirty {
            return Ok(false);
        }
        state.entries = read_registry_file(&self.path)?;
        state.observed_mtime = mtime;
        debug!(path = %self.path.display(), entries = state.entries.len(), "Reloaded cache registry");
        Ok(true)
    }
}
