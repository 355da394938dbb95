//! The cache root: one `bundle<id>/` directory per installed bundle.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::core::archive::{resolve_data_file, BundleArchive, BUNDLE_DIRECTORY_PREFIX};
use crate::core::config::{CacheSettings, Config};
use crate::core::errors::CacheError;
use crate::core::fs::{make_writable_recursive, remove_dir_all_with_retry};

mod lock;


use lock::CacheLock;

const SYSTEM_BUNDLE_ID: i64 = 0;

#[derive(Debug)]
pub struct BundleCache {
    root: PathBuf,
    settings: Arc<CacheSettings>,
    _lock: Option<CacheLock>,
}

impl BundleCache {
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_at(&config.cache().path, config.settings(), config.locking())
    }

    /// Open (creating if needed) the cache rooted at `root`.
    pub fn open_at(root: &Path, settings: Arc<CacheSettings>, locking: bool) -> Result<Self> {
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .context("failed to resolve current directory")?
                .join(root)
        };
        fs::create_dir_all(&root).with_context(|| format!("failed to create {}", root.display()))?;
        let lock = if locking {
            match CacheLock::try_acquire(&root)? {
                Some(lock) => Some(lock),
                None => return Err(CacheError::Locked(root).into()),
            }
        } else {
            None
        };
        debug!(root = %root.display(), locking, "bundle cache opened");
        Ok(Self {
            root,
            settings,
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> Arc<CacheSettings> {
        Arc::clone(&self.settings)
    }

    /// Reconstruct every archive under the root, ordered by id. Archives that
    /// fail to load are logged and skipped.
    pub fn scan(&self) -> Result<Vec<BundleArchive>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))?;
        let mut dirs: Vec<(i64, PathBuf)> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let id = archive_id(&name)?;
                (id != SYSTEM_BUNDLE_ID).then(|| (id, entry.path()))
            })
            .collect();
        dirs.sort();

        let mut archives = Vec::with_capacity(dirs.len());
        for (id, dir) in dirs {
            match BundleArchive::open(dir.clone(), Arc::clone(&self.settings)) {
                Ok(archive) => archives.push(archive),
                Err(err) => error!(
                    id,
                    dir = %dir.display(),
                    error = %format!("{err:#}"),
                    "unable to load bundle archive; skipping"
                ),
            }
        }
        info!(root = %self.root.display(), count = archives.len(), "bundle cache scanned");
        Ok(archives)
    }

    /// Install a new archive; a failed install leaves nothing behind.
    pub fn create(
        &self,
        id: i64,
        location: &str,
        input: Option<&mut dyn Read>,
    ) -> Result<BundleArchive> {
        if id <= SYSTEM_BUNDLE_ID {
            return Err(CacheError::InvalidId(id).into());
        }
        let dir = self.archive_dir(id);
        match BundleArchive::create(dir.clone(), Arc::clone(&self.settings), id, location, input) {
            Ok(archive) => Ok(archive),
            Err(err) => {
                if let Err(cleanup) = remove_dir_all_with_retry(&dir) {
                    warn!(dir = %dir.display(), error = %format!("{cleanup:#}"), "failed to clean up archive");
                }
                Err(err.context(format!("unable to create archive for bundle {id}")))
            }
        }
    }

    pub fn load(&self, id: i64) -> Result<BundleArchive> {
        let dir = self.archive_dir(id);
        if id <= SYSTEM_BUNDLE_ID || !dir.is_dir() {
            return Err(CacheError::ArchiveNotFound(id).into());
        }
        BundleArchive::open(dir, Arc::clone(&self.settings))
    }

    /// Delete an archive's directory tree.
    pub fn remove(&self, archive: BundleArchive) -> Result<()> {
        archive.dispose();
        let dir = archive.root_dir().to_path_buf();
        drop(archive);
        make_writable_recursive(&dir);
        remove_dir_all_with_retry(&dir)?;
        info!(dir = %dir.display(), "bundle archive removed");
        Ok(())
    }

    /// `bundle0/data/<name>`, sanitized like archive data files.
    pub fn system_bundle_data_file(&self, name: &str) -> Result<PathBuf> {
        resolve_data_file(&self.archive_dir(SYSTEM_BUNDLE_ID), name)
    }

    /// Remove the whole cache root.
    pub fn delete(self) -> Result<()> {
        let root = self.root.clone();
        drop(self);
        make_writable_recursive(&root);
        remove_dir_all_with_retry(&root)?;
        info!(root = %root.display(), "bundle cache deleted");
        Ok(())
    }

    pub fn archive_dir(&self, id: i64) -> PathBuf {
        self.root.join(format!("{BUNDLE_DIRECTORY_PREFIX}{id}"))
    }
}

fn archive_id(name: &str) -> Option<i64> {
    name.strip_prefix(BUNDLE_DIRECTORY_PREFIX)?.parse().ok()
}
