//! Filesystem helpers shared by the store and ingestion.

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Returns a unique sibling path for staging writes to `file_path`.
///
/// The name keeps the stem but drops the extension, so directory scans for a
/// specific extension never pick up a half-written file.
pub(crate) fn temp_path_for(file_path: &Path) -> PathBuf {
    let temp_filename = format!(
        "{}.tmp.{}",
        file_path.file_stem().and_then(|s| s.to_str()).unwrap_or("file"),
        Uuid::new_v4()
    );
    file_path.parent().unwrap_or_else(|| Path::new(".")).join(temp_filename)
}

/// Writes `content` to a temporary file and renames it over `file_path`.
pub(crate) fn atomic_write(file_path: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = temp_path_for(file_path);

    fs::write(&temp_path, content).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })?;

    fs::rename(&temp_path, file_path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}

/// Canonical registry key for `path`.
///
/// Existing files are canonicalized. Missing files keep their name under the
/// canonicalized parent, so a purged blob still maps to its old key.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => parent.join(name),
            Err(_) => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
        },
        _ => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// Size and modification time of a regular file.
pub(crate) fn file_stat(path: &Path) -> Option<(u64, Option<DateTime<Utc>>)> {
    let meta = fs::metadata(path).ok().filter(fs::Metadata::is_file)?;
    let modified = meta.modified().ok().map(DateTime::<Utc>::from);
    Some((meta.len(), modified))
}
