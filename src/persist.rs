//! Atomic file writes shared by every on-disk store.
//!
//! All writes go through a sibling temp file that is fsynced before being
//! renamed over the target, so a crash never leaves a half-written file in
//! place. Callers that keep a previous generation pass a backup path; the
//! current file is rotated there right before the rename.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Temp path used while writing `path`: `.{file_name}.tmp` in the same directory.
///
/// The leading dot keeps temp files out of directory listings that only
/// look at visible entries.
#[must_use]
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vigil".to_owned());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Backup path for `path`: `{file_name}.bak`.
#[must_use]
pub fn backup_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vigil".to_owned());
    path.with_file_name(format!("{name}.bak"))
}

/// Write `bytes` to `path` atomically (temp file, fsync, rename).
///
/// When `backup` is given and `path` already exists, the existing file is
/// renamed to `backup` before the temp file takes its place.
///
/// # Errors
///
/// Returns [`crate::error::VigilError::Io`] if any filesystem step fails.
/// The temp file is removed on failure.
pub fn write_atomic(path: &Path, bytes: &[u8], backup: Option<&Path>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path_for(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    if let Some(backup) = backup
        && path.exists()
        && let Err(e) = std::fs::rename(path, backup)
    {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}
