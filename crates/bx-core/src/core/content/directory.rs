use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bx_domain::CLASS_PATH_DOT;
use tracing::{error, warn};
use walkdir::WalkDir;

use super::{
    finish_native_library, strip_leading_slash, Content, ContentContext, JarContent,
    EMBEDDED_DIRECTORY, LIBRARY_DIRECTORY,
};
use crate::core::fs::{copy_file, is_contained};

/// Content backed by a directory used in place.
#[derive(Debug)]
pub struct DirectoryContent {
    ctx: ContentContext,
    root_dir: PathBuf,
    dir: PathBuf,
}

impl DirectoryContent {
    /// `root_dir` receives extracted state; `dir` is never written to.
    pub(crate) fn new(ctx: ContentContext, root_dir: PathBuf, dir: PathBuf) -> Self {
        Self { ctx, root_dir, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let name = strip_leading_slash(name);
        is_contained(name).then(|| self.dir.join(name))
    }
}

impl Content for DirectoryContent {
    fn has_entry(&self, name: &str) -> bool {
        self.resolve(name).is_some_and(|path| path.exists())
    }

    fn entries(&self) -> Option<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(dir = %self.dir.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(&self.dir) else {
                continue;
            };
            let mut name = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if entry.file_type().is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        (!names.is_empty()).then_some(names)
    }

    fn entry_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.resolve(name) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn entry_stream(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let Some(path) = self.resolve(name) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Some(Box::new(file)))
    }

    fn entry_as_content(&self, name: &str) -> Result<Option<Arc<dyn Content>>> {
        if name == CLASS_PATH_DOT {
            return Ok(Some(Arc::new(Self::new(
                self.ctx.clone(),
                self.root_dir.clone(),
                self.dir.clone(),
            ))));
        }
        let name = strip_leading_slash(name);
        let Some(path) = self.resolve(name) else {
            return Ok(None);
        };
        if path.is_dir() {
            return Ok(Some(Arc::new(Self::new(
                self.ctx.clone(),
                self.root_dir.clone(),
                path,
            ))));
        }
        if !(path.is_file() && name.ends_with(".jar")) {
            return Ok(None);
        }
        // embedded jars are read in place; only their extractions land here
        let parent = name
            .trim_end_matches('/')
            .rsplit_once('/')
            .map_or(name, |(parent, _)| parent);
        let base = self.root_dir.join(EMBEDDED_DIRECTORY).join(parent);
        {
            let _revision = self.ctx.lock();
            if !base.exists() {
                if let Err(err) = fs::create_dir_all(&base) {
                    error!(dir = %base.display(), error = %err, "unable to create embedded directory");
                }
            }
        }
        Ok(Some(Arc::new(JarContent::nested(self.ctx.clone(), &base, path))))
    }

    fn entry_as_native_library(&self, name: &str) -> Result<Option<PathBuf>> {
        let name = strip_leading_slash(name);
        let Some(source) = self.resolve(name) else {
            return Ok(None);
        };
        if !source.is_file() {
            return Ok(None);
        }
        let mut revision = self.ctx.lock();
        let slot = revision.next_native_slot(name);
        let library = self
            .root_dir
            .join(LIBRARY_DIRECTORY)
            .join(slot.to_string())
            .join(name);
        if library.exists() {
            return Ok(Some(library));
        }
        if let Err(err) = copy_file(&source, &library, self.ctx.settings().buffer_size) {
            error!(%name, error = %format!("{err:#}"), "unable to extract native library");
            return Ok(None);
        }
        drop(revision);
        Ok(finish_native_library(&self.ctx, library))
    }

    fn close(&self) {}
}

impl fmt::Display for DirectoryContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DIRECTORY {}", self.dir.display())
    }
}
