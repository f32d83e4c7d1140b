//! Advisory lock over the state directory.
//!
//! Concurrent engine invocations against the same state directory are
//! unsupported; every mutating operation takes this lock for its duration
//! and the OS releases it on exit or crash. Read-only operations (list,
//! info, config) never touch it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;

use crate::core::ZkgError;

/// Name of the lock file inside the state directory.
const LOCK_FILE: &str = ".lock";

/// An exclusive lock on one state directory. Held for as long as the
/// value lives; dropping releases it.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
    path: PathBuf,
}

impl StateLock {
    /// Try to acquire the lock without blocking.
    ///
    /// # Errors
    ///
    /// [`ZkgError::Lock`] when another process holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        if !file
            .try_lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?
        {
            return Err(ZkgError::Lock {
                path: path.display().to_string(),
            }
            .into());
        }

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = StateLock::acquire(dir.path()).unwrap();
        let err = StateLock::acquire(dir.path()).unwrap_err();
        let err = err.downcast::<ZkgError>().unwrap();
        assert!(matches!(err, ZkgError::Lock { .. }));

        drop(lock);
        StateLock::acquire(dir.path()).unwrap();
    }
}
