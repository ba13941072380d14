//! Cross-process lock around program setup and refcount updates.
//!
//! Every process touching the same interface takes this lock before it
//! inspects pins or changes REFCNT, so a load can never race a last release.

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use fs2::FileExt;
use tracing::{trace, warn};

use crate::error::Result;

/// Exclusive `flock` on a lock file, released on drop.
#[derive(Debug)]
pub struct ProgramLock {
    file: File,
}

impl ProgramLock {
    /// Block until the lock at `path` is ours. Creates the file if needed.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open(path)?;
        file.lock_exclusive()?;
        trace!(path = %path.display(), "Program lock acquired");
        Ok(Self { file })
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ProgramLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "Failed to release program lock");
        }
    }
}

fn open(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}
