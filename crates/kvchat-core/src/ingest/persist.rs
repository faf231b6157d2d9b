//! Writing engine state to the store.
//!
//! Engine bindings differ in how they hand out state: some return a blob,
//! some only write to a path. The structured form is tried first, the
//! direct write second. Both stage into a temporary sibling and only a
//! non-empty result is renamed into place, so a failed save never leaves a
//! file behind that looks like a cache.

use crate::error::{CoreError, Result};
use crate::store::fsutil::temp_path_for;
use kvchat_abstraction::LanguageEngine;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

fn staged_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove staged state file");
    }
}

/// Saves `engine`'s state to `destination`. Returns the blob size.
///
/// # Errors
/// Returns `Serialization` when neither save form produced data. Nothing is
/// left at `destination` or at the staging path in that case.
pub fn persist_state(engine: &mut dyn LanguageEngine, destination: &Path) -> Result<u64> {
    let staging = temp_path_for(destination);

    let structured = match engine.save_state() {
        Ok(bytes) if bytes.is_empty() => Err("structured save returned no data".to_string()),
        Ok(bytes) => fs::write(&staging, &bytes)
            .map(|()| bytes.len() as u64)
            .map_err(|e| format!("writing staged state failed: {e}")),
        Err(e) => Err(format!("structured save failed: {e}")),
    };

    let size = match structured {
        Ok(size) => size,
        Err(first) => {
            discard(&staging);
            debug!(reason = %first, "Falling back to direct state write");
            match engine.save_state_to(&staging) {
                Ok(()) => match staged_size(&staging) {
                    0 => {
                        discard(&staging);
                        return Err(CoreError::Serialization(format!(
                            "{first}; direct save wrote no data"
                        )));
                    }
                    size => size,
                },
                Err(e) => {
                    discard(&staging);
                    return Err(CoreError::Serialization(format!(
                        "{first}; direct save failed: {e}"
                    )));
                }
            }
        }
    };

    if let Err(e) = fs::rename(&staging, destination) {
        discard(&staging);
        return Err(CoreError::Serialization(format!(
            "could not move state into {}: {e}",
            destination.display()
        )));
    }
    debug!(cache_path = %destination.display(), size, "Persisted engine state");
    Ok(size)
}
