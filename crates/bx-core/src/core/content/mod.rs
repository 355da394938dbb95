//! Read-only views over bundle content.
//!
//! A revision exposes its bytes through [`Content`]: a jar file, a directory
//! on disk, or a sub-path of either. Embedded jars and native libraries are
//! extracted lazily under the owning revision's root directory; every
//! extraction for one revision is serialized through a single lock shared by
//! all of that revision's content objects.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use tracing::{debug, error, warn};

use crate::core::config::{CacheSettings, ABSPATH_PLACEHOLDER};

mod content_dir;
mod directory;
mod jar;

pub use content_dir::ContentDirectoryContent;
pub use directory::DirectoryContent;
pub use jar::JarContent;

pub(crate) const EMBEDDED_DIRECTORY: &str = "embedded";
pub(crate) const LIBRARY_DIRECTORY: &str = "lib";

pub trait Content: fmt::Display + fmt::Debug + Send + Sync {
    fn has_entry(&self, name: &str) -> bool;

    /// Entry names relative to this content, directories with a trailing `/`.
    /// `None` when there is nothing to list.
    fn entries(&self) -> Option<Vec<String>>;

    fn entry_bytes(&self, name: &str) -> Result<Option<Vec<u8>>>;

    fn entry_stream(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>>;

    /// Nested content for `.`, a directory entry or an embedded jar.
    fn entry_as_content(&self, name: &str) -> Result<Option<Arc<dyn Content>>>;

    /// Absolute path of the extracted library, extracting on demand.
    fn entry_as_native_library(&self, name: &str) -> Result<Option<PathBuf>>;

    fn close(&self);
}

/// State guarded by the revision lock.
#[derive(Debug, Default)]
pub(crate) struct RevisionState {
    native_counts: HashMap<String, u32>,
}

impl RevisionState {
    /// Next extraction slot for a native library requested by name.
    pub(crate) fn next_native_slot(&mut self, name: &str) -> u32 {
        let count = self.native_counts.entry(name.to_string()).or_insert(0);
        let slot = *count;
        *count += 1;
        slot
    }
}

/// Settings and the revision lock, shared by all content of one revision.
#[derive(Debug, Clone)]
pub struct ContentContext {
    settings: Arc<CacheSettings>,
    revision_lock: Arc<Mutex<RevisionState>>,
}

impl ContentContext {
    pub(crate) fn new(settings: Arc<CacheSettings>) -> Self {
        Self {
            settings,
            revision_lock: Arc::new(Mutex::new(RevisionState::default())),
        }
    }

    pub(crate) fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Always taken before any per-jar handle lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RevisionState> {
        self.revision_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn strip_leading_slash(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// Run the configured exec-permission hook; on failure the extracted file is
/// removed and no path is handed out.
pub(crate) fn finish_native_library(ctx: &ContentContext, path: PathBuf) -> Option<PathBuf> {
    if let Some(template) = ctx.settings().exec_permission.as_deref() {
        if let Err(err) = run_exec_permission(template, &path) {
            error!(path = %path.display(), error = %format!("{err:#}"), "exec permission command failed");
            if let Err(cleanup) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %cleanup, "failed to remove rejected library");
            }
            return None;
        }
    }
    debug!(path = %path.display(), "native library ready");
    Some(path)
}

fn run_exec_permission(template: &str, path: &Path) -> Result<()> {
    let command = template.replace(ABSPATH_PLACEHOLDER, &path.display().to_string());
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        bail!("exec permission command is empty");
    };
    let output = Command::new(program)
        .args(parts)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to spawn {command:?}"))?;
    if !output.status.success() {
        bail!(
            "{command:?} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
