//! One-time backup of the original module.
//!
//! The backup must exist before any mutation is serialized, and it must
//! never be overwritten: on a second run the "original" at the target path
//! is already the first run's patched output, and clobbering the true
//! original with it would lose the only way back.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Suffix appended to the target file name, e.g. `GameScripts.cmm.bak`.
pub const BACKUP_SUFFIX: &str = "bak";

/// What the guard found or did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// A fresh copy of the original was written
    Created(PathBuf),
    /// A backup from an earlier run is already in place; left untouched
    AlreadyExists(PathBuf),
}

impl BackupOutcome {
    /// The backup path in either case.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            BackupOutcome::Created(p) | BackupOutcome::AlreadyExists(p) => p,
        }
    }
}

/// Backup path convention for a target file.
#[must_use]
pub fn backup_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map_or_else(Default::default, std::ffi::OsStr::to_os_string);
    name.push(".");
    name.push(BACKUP_SUFFIX);
    target.with_file_name(name)
}

/// Ensure an unmodified copy of `target` exists at the backup path,
/// creating it exactly once.
///
/// # Errors
/// Returns [`Error::BackupWrite`] when the copy cannot be created; callers
/// must abort the patch run before any mutation.
pub fn ensure_backup(target: &Path) -> Result<BackupOutcome> {
    let backup = backup_path(target);
    if backup.exists() {
        return Ok(BackupOutcome::AlreadyExists(backup));
    }
    fs::copy(target, &backup).map_err(|source| Error::BackupWrite {
        path: backup.clone(),
        source,
    })?;
    Ok(BackupOutcome::Created(backup))
}
