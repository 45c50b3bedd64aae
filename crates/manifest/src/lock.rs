//! Exclusive advisory lock on a manifest's companion lock file.

use crate::error::{ManifestError, ManifestResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Holds an exclusive OS lock on `<manifest>.lock`.
///
/// The lock is advisory; the OS drops it when the file handle closes, so a
/// guard that is dropped without [`LockGuard::release`] still frees the lock
/// (the lock file itself is only removed on an orderly release).
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock, failing immediately if another process holds it.
    pub fn acquire(path: impl AsRef<Path>) -> ManifestResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|e| ManifestError::LockContended {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { file, path })
    }

    /// Release the lock and remove the lock file.
    pub fn release(self) -> ManifestResult<()> {
        FileExt::unlock(&self.file)?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_and_release_removes_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.json.lock");

        let guard = LockGuard::acquire(&path).unwrap();
        assert!(path.exists());
        guard.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.json.lock");

        let _guard = LockGuard::acquire(&path).unwrap();
        let err = LockGuard::acquire(&path).unwrap_err();
        assert!(matches!(err, ManifestError::LockContended { .. }));
    }

    #[test]
    fn lock_is_freed_when_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.json.lock");

        drop(LockGuard::acquire(&path).unwrap());
        let again = LockGuard::acquire(&path).unwrap();
        again.release().unwrap();
    }
}
