use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use bx_domain::CLASS_PATH_DOT;
use tracing::{error, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use super::{
    finish_native_library, strip_leading_slash, Content, ContentContext,
    ContentDirectoryContent, EMBEDDED_DIRECTORY, LIBRARY_DIRECTORY,
};
use crate::core::fs::{copy_stream_to_file, is_contained};

enum EntryKind {
    File(String),
    Directory(String),
}

/// Content backed by a jar file; the archive handle opens on first use.
pub struct JarContent {
    ctx: ContentContext,
    file: PathBuf,
    embedded_dir: PathBuf,
    lib_dir: PathBuf,
    archive: Mutex<Option<ZipArchive<File>>>,
}

impl JarContent {
    /// The bundle jar of a revision, extracting into `embedded/` and `lib/`.
    pub(crate) fn primary(ctx: ContentContext, revision_root: &Path, file: PathBuf) -> Self {
        Self {
            ctx,
            file,
            embedded_dir: revision_root.join(EMBEDDED_DIRECTORY),
            lib_dir: revision_root.join(LIBRARY_DIRECTORY),
            archive: Mutex::new(None),
        }
    }

    /// A jar nested in other content; extraction directories are named after
    /// the jar so siblings under `base` never clash.
    pub(crate) fn nested(ctx: ContentContext, base: &Path, file: PathBuf) -> Self {
        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            ctx,
            embedded_dir: base.join(format!("{name}-{EMBEDDED_DIRECTORY}")),
            lib_dir: base.join(format!("{name}-{LIBRARY_DIRECTORY}")),
            file,
            archive: Mutex::new(None),
        }
    }

    fn fresh(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            file: self.file.clone(),
            embedded_dir: self.embedded_dir.clone(),
            lib_dir: self.lib_dir.clone(),
            archive: Mutex::new(None),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    fn with_archive<T>(&self, f: impl FnOnce(&mut ZipArchive<File>) -> Result<T>) -> Result<T> {
        let mut guard = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let file = File::open(&self.file)
                .with_context(|| format!("failed to open {}", self.file.display()))?;
            let archive = ZipArchive::new(file)
                .with_context(|| format!("failed to read jar {}", self.file.display()))?;
            *guard = Some(archive);
        }
        let archive = guard
            .as_mut()
            .with_context(|| format!("jar {} is not open", self.file.display()))?;
        f(archive)
    }

    fn lookup(&self, name: &str) -> Result<Option<EntryKind>> {
        self.with_archive(|archive| {
            if let Ok(is_dir) = archive.by_name(name).map(|entry| entry.is_dir()) {
                return Ok(Some(if is_dir {
                    EntryKind::Directory(directory_name(name))
                } else {
                    EntryKind::File(name.to_string())
                }));
            }
            let dir = directory_name(name);
            let implicit = archive.by_name(&dir).is_ok()
                || archive.file_names().any(|entry| entry.starts_with(&dir));
            Ok(implicit.then_some(EntryKind::Directory(dir)))
        })
    }

    fn extract_entry(&self, name: &str, dest: &Path) -> Result<u64> {
        let buffer_size = self.ctx.settings().buffer_size;
        self.with_archive(|archive| {
            let mut entry = archive
                .by_name(name)
                .with_context(|| format!("{name} missing from {}", self.file.display()))?;
            copy_stream_to_file(&mut entry, dest, buffer_size)
        })
    }
}

fn directory_name(name: &str) -> String {
    format!("{}/", name.trim_end_matches('/'))
}

impl Content for JarContent {
    fn has_entry(&self, name: &str) -> bool {
        let name = strip_leading_slash(name);
        let found = self.with_archive(|archive| {
            Ok(archive.by_name(name).is_ok() || archive.by_name(&directory_name(name)).is_ok())
        });
        match found {
            Ok(found) => found,
            Err(err) => {
                warn!(jar = %self.file.display(), error = %format!("{err:#}"), "entry lookup failed");
                false
            }
        }
    }

    fn entries(&self) -> Option<Vec<String>> {
        let names = self.with_archive(|archive| {
            let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
            names.sort();
            Ok(names)
        });
        match names {
            Ok(names) if !names.is_empty() => Some(names),
            Ok(_) => None,
            Err(err) => {
                warn!(jar = %self.file.display(), error = %format!("{err:#}"), "failed to list entries");
                None
            }
        }
    }

    fn entry_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let name = strip_leading_slash(name);
        self.with_archive(|archive| {
            let mut entry = match archive.by_name(name) {
                Ok(entry) => entry,
                Err(ZipError::FileNotFound) => return Ok(None),
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {name}"));
                }
            };
            if entry.is_dir() {
                return Ok(None);
            }
            let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
            entry
                .read_to_end(&mut bytes)
                .with_context(|| format!("failed to read {name} from {}", self.file.display()))?;
            Ok(Some(bytes))
        })
    }

    fn entry_stream(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>> {
        Ok(self
            .entry_bytes(name)?
            .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>))
    }

    fn entry_as_content(&self, name: &str) -> Result<Option<Arc<dyn Content>>> {
        if name == CLASS_PATH_DOT {
            return Ok(Some(Arc::new(self.fresh())));
        }
        let name = strip_leading_slash(name);
        match self.lookup(name)? {
            Some(EntryKind::Directory(prefix)) => Ok(Some(Arc::new(
                ContentDirectoryContent::new(Arc::new(self.fresh()), prefix),
            ))),
            Some(EntryKind::File(entry)) if entry.ends_with(".jar") => {
                if !is_contained(&entry) {
                    warn!(%entry, jar = %self.file.display(), "embedded jar escapes its archive");
                    return Ok(None);
                }
                let extracted = self.embedded_dir.join(&entry);
                {
                    let _revision = self.ctx.lock();
                    if !extracted.exists() {
                        if let Err(err) = self.extract_entry(&entry, &extracted) {
                            error!(%entry, error = %format!("{err:#}"), "unable to extract embedded jar");
                            return Ok(None);
                        }
                    }
                }
                let base = extracted
                    .parent()
                    .map_or_else(|| self.embedded_dir.clone(), Path::to_path_buf);
                Ok(Some(Arc::new(JarContent::nested(
                    self.ctx.clone(),
                    &base,
                    extracted,
                ))))
            }
            _ => Ok(None),
        }
    }

    fn entry_as_native_library(&self, name: &str) -> Result<Option<PathBuf>> {
        let name = strip_leading_slash(name);
        if !is_contained(name) {
            return Ok(None);
        }
        let is_file =
            self.with_archive(|archive| Ok(matches!(archive.by_name(name), Ok(entry) if !entry.is_dir())))?;
        if !is_file {
            return Ok(None);
        }
        let library = self.lib_dir.join(name);
        let _revision = self.ctx.lock();
        if library.exists() {
            return Ok(Some(library));
        }
        if let Err(err) = self.extract_entry(name, &library) {
            error!(%name, error = %format!("{err:#}"), "unable to extract native library");
            return Ok(None);
        }
        Ok(finish_native_library(&self.ctx, library))
    }

    fn close(&self) {
        *self.archive.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Display for JarContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JAR {}", self.file.display())
    }
}

impl fmt::Debug for JarContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JarContent")
            .field("file", &self.file)
            .field("embedded_dir", &self.embedded_dir)
            .field("lib_dir", &self.lib_dir)
            .finish_non_exhaustive()
    }
}
