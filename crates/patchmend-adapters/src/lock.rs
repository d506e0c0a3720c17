//! One fix run per checkout at a time.

use crate::util::hash_str;
use fs2::FileExt;
use patchmend_core::FixError;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Lock files live in `state_dir/locks`, named after a hash of the
    /// canonical checkout path.
    pub fn acquire(state_dir: &Path, checkout: &Path) -> Result<Self, FixError> {
        let canonical = checkout
            .canonicalize()
            .unwrap_or_else(|_| checkout.to_path_buf());
        let dir = state_dir.join("locks");
        fs::create_dir_all(&dir).map_err(|e| FixError::Storage {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;

        let path = dir.join(format!(
            "{}.lock",
            hash_str(&canonical.to_string_lossy())
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| FixError::Storage {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(FixError::Locked(canonical.display().to_string()));
        }

        let _ = file.set_len(0);
        let _ = writeln!(file, "{} {}", std::process::id(), canonical.display());
        tracing::debug!(lock = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_on_same_checkout_fails() {
        let state = tempfile::tempdir().unwrap();
        let checkout = tempfile::tempdir().unwrap();

        let first = RunLock::acquire(state.path(), checkout.path()).unwrap();
        let second = RunLock::acquire(state.path(), checkout.path());
        assert!(matches!(second, Err(FixError::Locked(_))));

        drop(first);
        assert!(RunLock::acquire(state.path(), checkout.path()).is_ok());
    }

    #[test]
    fn test_different_checkouts_do_not_contend() {
        let state = tempfile::tempdir().unwrap();
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        let lock_a = RunLock::acquire(state.path(), a.path()).unwrap();
        let lock_b = RunLock::acquire(state.path(), b.path()).unwrap();
        assert_ne!(lock_a.path(), lock_b.path());
    }
}
