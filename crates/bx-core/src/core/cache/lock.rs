use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;

const CACHE_LOCK_FILE: &str = "cache.lock";

/// Exclusive advisory lock on `<root>/cache.lock`, released on drop.
#[derive(Debug)]
pub(crate) struct CacheLock {
    _file: File,
}

impl CacheLock {
    /// `None` when another process already holds the lock.
    pub(crate) fn try_acquire(root: &Path) -> Result<Option<Self>> {
        fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
        let path = cache_lock_path(root);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to lock {}", path.display())),
        }
    }
}

pub(crate) fn cache_lock_path(root: &Path) -> PathBuf {
    root.join(CACHE_LOCK_FILE)
}
