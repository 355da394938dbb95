//! Persistent state and revision history of one bundle.
//!
//! Revision `i` of generation `g` lives in `version<g>.<i>/`. The pair is
//! never reused for the lifetime of the archive, so a native library
//! extracted from one revision never shares a path with another.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use bx_domain::{BundleState, INPUTSTREAM_PROTOCOL};
use tracing::{debug, error, info, warn};

use crate::core::config::CacheSettings;
use crate::core::errors::CacheError;
use crate::core::fs::{read_scalar, remove_dir_all_with_retry, write_scalar};
use crate::core::revision::Revision;


pub(crate) const BUNDLE_DIRECTORY_PREFIX: &str = "bundle";
const BUNDLE_ID_FILE: &str = "bundle.id";
const BUNDLE_LOCATION_FILE: &str = "bundle.location";
const CURRENT_LOCATION_FILE: &str = "current.location";
const REVISION_LOCATION_FILE: &str = "revision.location";
const BUNDLE_STATE_FILE: &str = "bundle.state";
const BUNDLE_START_LEVEL_FILE: &str = "bundle.startlevel";
const BUNDLE_LAST_MODIFIED_FILE: &str = "bundle.lastmodified";
const REFRESH_COUNTER_FILE: &str = "refresh.counter";
const REVISION_DIRECTORY_PREFIX: &str = "version";
pub(crate) const DATA_DIRECTORY: &str = "data";

const UNSET_START_LEVEL: i32 = -1;

#[derive(Debug, Default)]
struct ArchiveInner {
    id: Option<i64>,
    location: Option<String>,
    current_location: Option<String>,
    state: Option<BundleState>,
    start_level: Option<i32>,
    last_modified: Option<i64>,
    generation: Option<u64>,
    /// Older slots stay empty after a reload until asked for.
    revisions: Vec<Option<Arc<Revision>>>,
}

#[derive(Debug)]
pub struct BundleArchive {
    root_dir: PathBuf,
    settings: Arc<CacheSettings>,
    inner: Mutex<ArchiveInner>,
}

impl BundleArchive {
    /// Initialize a new archive under `root_dir` with its first revision.
    pub fn create(
        root_dir: PathBuf,
        settings: Arc<CacheSettings>,
        id: i64,
        location: &str,
        input: Option<&mut dyn Read>,
    ) -> Result<Self> {
        if id <= 0 {
            return Err(CacheError::InvalidId(id).into());
        }
        fs::create_dir_all(&root_dir)
            .with_context(|| format!("failed to create {}", root_dir.display()))?;
        let archive = Self {
            root_dir,
            settings,
            inner: Mutex::new(ArchiveInner {
                generation: Some(0),
                ..ArchiveInner::default()
            }),
        };
        {
            let mut inner = archive.lock();
            archive.persist(&mut inner.id, BUNDLE_ID_FILE, id)?;
            archive.persist(&mut inner.location, BUNDLE_LOCATION_FILE, location.to_string())?;
            archive.persist(&mut inner.generation, REFRESH_COUNTER_FILE, 0)?;
            archive.revise_locked(&mut inner, location, input)?;
        }
        info!(id, %location, dir = %archive.root_dir.display(), "archive created");
        Ok(archive)
    }

    /// Reconstruct an archive from disk. Only the newest revision is built;
    /// older ones are left for the next purge.
    pub fn open(root_dir: PathBuf, settings: Arc<CacheSettings>) -> Result<Self> {
        let archive = Self {
            root_dir,
            settings,
            inner: Mutex::new(ArchiveInner::default()),
        };
        {
            let mut inner = archive.lock();
            let mut generation = archive.generation_locked(&mut inner)?;
            let mut count = archive.probe_revisions(generation);
            if count == 0 {
                generation = archive.recover_generation(&mut inner, generation)?;
                count = 1;
            }
            let index = count - 1;
            let location = archive.revision_location(&mut inner, generation, index)?;
            let revision = Revision::new(
                archive.revision_dir(generation, index),
                &location,
                None,
                Arc::clone(&archive.settings),
            )?;
            inner.revisions = vec![None; index];
            inner.revisions.push(Some(Arc::new(revision)));
            debug!(
                dir = %archive.root_dir.display(),
                generation,
                revisions = count,
                "archive loaded"
            );
        }
        Ok(archive)
    }

    fn lock(&self) -> MutexGuard<'_, ArchiveInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn id(&self) -> Result<i64> {
        let mut inner = self.lock();
        if let Some(id) = inner.id {
            return Ok(id);
        }
        let id = match self.read_parsed::<i64>(BUNDLE_ID_FILE)? {
            Some(id) => id,
            None => self.id_from_directory_name()?,
        };
        inner.id = Some(id);
        Ok(id)
    }

    fn id_from_directory_name(&self) -> Result<i64> {
        let name = self
            .root_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.strip_prefix(BUNDLE_DIRECTORY_PREFIX)
            .and_then(|id| id.parse().ok())
            .with_context(|| format!("cannot derive a bundle id from {}", self.root_dir.display()))
    }

    /// Location given at install time.
    pub fn location(&self) -> Result<String> {
        let mut inner = self.lock();
        self.location_locked(&mut inner)
    }

    fn location_locked(&self, inner: &mut ArchiveInner) -> Result<String> {
        if let Some(location) = &inner.location {
            return Ok(location.clone());
        }
        let path = self.root_dir.join(BUNDLE_LOCATION_FILE);
        let location = read_scalar(&path)?
            .with_context(|| format!("{} is missing", path.display()))?;
        inner.location = Some(location.clone());
        Ok(location)
    }

    /// Location of the newest revision; the install location before any
    /// update was recorded.
    pub fn current_location(&self) -> Result<String> {
        let mut inner = self.lock();
        self.current_location_locked(&mut inner)
    }

    fn current_location_locked(&self, inner: &mut ArchiveInner) -> Result<String> {
        if let Some(location) = &inner.current_location {
            return Ok(location.clone());
        }
        match read_scalar(&self.root_dir.join(CURRENT_LOCATION_FILE))? {
            Some(location) => {
                inner.current_location = Some(location.clone());
                Ok(location)
            }
            None => self.location_locked(inner),
        }
    }

    pub fn state(&self) -> Result<BundleState> {
        let mut inner = self.lock();
        if let Some(state) = inner.state {
            return Ok(state);
        }
        let state = read_scalar(&self.root_dir.join(BUNDLE_STATE_FILE))?
            .map(|raw| BundleState::parse(&raw))
            .unwrap_or_default();
        inner.state = Some(state);
        Ok(state)
    }

    pub fn set_state(&self, state: BundleState) -> Result<()> {
        let mut inner = self.lock();
        self.persist(&mut inner.state, BUNDLE_STATE_FILE, state)
    }

    /// `-1` when never set.
    pub fn start_level(&self) -> Result<i32> {
        let mut inner = self.lock();
        if let Some(level) = inner.start_level {
            return Ok(level);
        }
        let level = self
            .read_parsed(BUNDLE_START_LEVEL_FILE)?
            .unwrap_or(UNSET_START_LEVEL);
        inner.start_level = Some(level);
        Ok(level)
    }

    pub fn set_start_level(&self, level: i32) -> Result<()> {
        let mut inner = self.lock();
        self.persist(&mut inner.start_level, BUNDLE_START_LEVEL_FILE, level)
    }

    /// Milliseconds since the epoch; `0` when never set.
    pub fn last_modified(&self) -> Result<i64> {
        let mut inner = self.lock();
        if let Some(modified) = inner.last_modified {
            return Ok(modified);
        }
        let modified = self.read_parsed(BUNDLE_LAST_MODIFIED_FILE)?.unwrap_or(0);
        inner.last_modified = Some(modified);
        Ok(modified)
    }

    pub fn set_last_modified(&self, modified: i64) -> Result<()> {
        let mut inner = self.lock();
        self.persist(&mut inner.last_modified, BUNDLE_LAST_MODIFIED_FILE, modified)
    }

    /// The refresh counter naming the current revision directories.
    pub fn generation(&self) -> Result<u64> {
        let mut inner = self.lock();
        self.generation_locked(&mut inner)
    }

    fn generation_locked(&self, inner: &mut ArchiveInner) -> Result<u64> {
        if let Some(generation) = inner.generation {
            return Ok(generation);
        }
        let generation = self.read_parsed(REFRESH_COUNTER_FILE)?.unwrap_or(0);
        inner.generation = Some(generation);
        Ok(generation)
    }

    pub fn revision_count(&self) -> usize {
        self.lock().revisions.len()
    }

    /// Revision `index`, building it from disk if only its directory is known.
    pub fn revision(&self, index: usize) -> Result<Arc<Revision>> {
        let mut inner = self.lock();
        let count = inner.revisions.len();
        let Some(slot) = inner.revisions.get(index) else {
            return Err(CacheError::RevisionOutOfRange { index, count }.into());
        };
        if let Some(revision) = slot {
            return Ok(Arc::clone(revision));
        }
        let generation = self.generation_locked(&mut inner)?;
        let location = self.revision_location(&mut inner, generation, index)?;
        let revision = Arc::new(Revision::new(
            self.revision_dir(generation, index),
            &location,
            None,
            Arc::clone(&self.settings),
        )?);
        inner.revisions[index] = Some(Arc::clone(&revision));
        Ok(revision)
    }

    pub fn current_revision(&self) -> Result<Arc<Revision>> {
        let count = self.revision_count();
        if count == 0 {
            return Err(CacheError::NoRevisions(self.root_dir.clone()).into());
        }
        self.revision(count - 1)
    }

    /// Append a revision. A supplied stream always wins, and the revision is
    /// then recorded as `inputstream:`.
    pub fn revise(&self, location: &str, input: Option<&mut dyn Read>) -> Result<()> {
        let mut inner = self.lock();
        self.revise_locked(&mut inner, location, input)
    }

    fn revise_locked(
        &self,
        inner: &mut ArchiveInner,
        location: &str,
        input: Option<&mut dyn Read>,
    ) -> Result<()> {
        let location = if input.is_some() {
            INPUTSTREAM_PROTOCOL
        } else {
            location
        };
        let generation = self.generation_locked(inner)?;
        let index = inner.revisions.len();
        let dir = self.revision_dir(generation, index);
        if dir.exists() {
            warn!(dir = %dir.display(), "clearing leftover revision directory");
            remove_dir_all_with_retry(&dir)?;
        }
        let revision = Revision::new(dir.clone(), location, input, Arc::clone(&self.settings))
            .and_then(|revision| {
                write_scalar(&dir.join(REVISION_LOCATION_FILE), location)?;
                self.persist(
                    &mut inner.current_location,
                    CURRENT_LOCATION_FILE,
                    location.to_string(),
                )?;
                Ok(revision)
            });
        let revision = match revision {
            Ok(revision) => revision,
            Err(err) => {
                if let Err(cleanup) = remove_dir_all_with_retry(&dir) {
                    warn!(dir = %dir.display(), error = %format!("{cleanup:#}"), "failed to clean up revision");
                }
                return Err(err.context(format!("unable to revise archive {}", self.root_dir.display())));
            }
        };
        inner.revisions.push(Some(Arc::new(revision)));
        debug!(generation, index, %location, "revision added");
        Ok(())
    }

    /// Drop the newest revision. `false` when it is the only one.
    pub fn undo_revise(&self) -> Result<bool> {
        let mut inner = self.lock();
        let count = inner.revisions.len();
        if count <= 1 {
            return Ok(false);
        }
        let generation = self.generation_locked(&mut inner)?;
        let previous = self.revision_location(&mut inner, generation, count - 2)?;
        if let Some(Some(revision)) = inner.revisions.last() {
            revision.dispose();
        }
        remove_dir_all_with_retry(&self.revision_dir(generation, count - 1))?;
        inner.revisions.pop();
        self.persist(&mut inner.current_location, CURRENT_LOCATION_FILE, previous)?;
        debug!(generation, index = count - 1, "revision undone");
        Ok(true)
    }

    /// Keep only the newest revision and move it to `version<g+1>.0`.
    pub fn purge(&self) -> Result<()> {
        let mut inner = self.lock();
        let generation = self.generation_locked(&mut inner)?;
        let count = inner.revisions.len();
        if count == 0 {
            return Err(CacheError::NoRevisions(self.root_dir.clone()).into());
        }
        for index in 0..count - 1 {
            if let Some(revision) = &inner.revisions[index] {
                revision.dispose();
            }
            remove_dir_all_with_retry(&self.revision_dir(generation, index))?;
        }
        if let Some(revision) = &inner.revisions[count - 1] {
            revision.dispose();
        }
        let location = self.revision_location(&mut inner, generation, count - 1)?;

        let next = generation + 1;
        self.persist(&mut inner.generation, REFRESH_COUNTER_FILE, next)?;
        let from = self.revision_dir(generation, count - 1);
        let to = self.revision_dir(next, 0);
        fs::rename(&from, &to).with_context(|| {
            format!("failed to rename {} to {}", from.display(), to.display())
        })?;
        inner.revisions.clear();
        self.remove_stale_generations(next);

        let revision = Revision::new(to, &location, None, Arc::clone(&self.settings))?;
        inner.revisions.push(Some(Arc::new(revision)));
        info!(dir = %self.root_dir.display(), generation = next, "archive purged");
        Ok(())
    }

    /// `data/<name>`, creating the directories leading up to it.
    pub fn data_file(&self, name: &str) -> Result<PathBuf> {
        let _inner = self.lock();
        resolve_data_file(&self.root_dir, name)
    }

    /// Release every revision; files stay on disk.
    pub fn dispose(&self) {
        let inner = self.lock();
        for revision in inner.revisions.iter().flatten() {
            revision.dispose();
        }
    }

    fn revision_dir(&self, generation: u64, index: usize) -> PathBuf {
        self.root_dir
            .join(format!("{REVISION_DIRECTORY_PREFIX}{generation}.{index}"))
    }

    fn probe_revisions(&self, generation: u64) -> usize {
        let mut count = 0;
        while self.revision_dir(generation, count).is_dir() {
            count += 1;
        }
        count
    }

    /// Revision directories as `(generation, index, path)`.
    fn revision_dirs(&self) -> Result<Vec<(u64, usize, PathBuf)>> {
        let entries = fs::read_dir(&self.root_dir)
            .with_context(|| format!("failed to read {}", self.root_dir.display()))?;
        let mut dirs = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((generation, index)) = parse_revision_dir(&name) else {
                continue;
            };
            if entry.path().is_dir() {
                dirs.push((generation, index, entry.path()));
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Finish a purge that stopped between deleting and renaming.
    fn recover_generation(&self, inner: &mut ArchiveInner, generation: u64) -> Result<u64> {
        let newest = self
            .revision_dirs()?
            .into_iter()
            .filter(|(candidate, _, _)| *candidate <= generation)
            .next_back();
        let Some((found, index, from)) = newest else {
            return Err(CacheError::NoRevisions(self.root_dir.clone()).into());
        };
        let target = if found == generation {
            generation + 1
        } else {
            generation
        };
        let to = self.revision_dir(target, 0);
        warn!(
            from = %from.display(),
            to = %to.display(),
            "recovering interrupted purge"
        );
        fs::rename(&from, &to)
            .with_context(|| format!("failed to rename {} to {}", from.display(), to.display()))?;
        self.persist(&mut inner.generation, REFRESH_COUNTER_FILE, target)?;
        debug!(generation = found, index, "revision moved");
        Ok(target)
    }

    fn remove_stale_generations(&self, current: u64) {
        let dirs = match self.revision_dirs() {
            Ok(dirs) => dirs,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to list revision directories");
                return;
            }
        };
        for (generation, _, path) in dirs {
            if generation < current {
                if let Err(err) = remove_dir_all_with_retry(&path) {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "failed to remove stale revision");
                }
            }
        }
    }

    /// Stored location of a revision, falling back to the archive's current
    /// location for directories written without one.
    fn revision_location(
        &self,
        inner: &mut ArchiveInner,
        generation: u64,
        index: usize,
    ) -> Result<String> {
        let path = self
            .revision_dir(generation, index)
            .join(REVISION_LOCATION_FILE);
        match read_scalar(&path)? {
            Some(location) => Ok(location),
            None => {
                warn!(path = %path.display(), "revision location missing; using current location");
                self.current_location_locked(inner)
            }
        }
    }

    fn read_parsed<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        let path = self.root_dir.join(name);
        let Some(raw) = read_scalar(&path)? else {
            return Ok(None);
        };
        match raw.trim().parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                warn!(path = %path.display(), value = %raw, "ignoring unparseable state file");
                Ok(None)
            }
        }
    }

    /// Write-through: the cached value only changes once the file is written.
    fn persist<T: ToString>(&self, slot: &mut Option<T>, name: &str, value: T) -> Result<()> {
        let path = self.root_dir.join(name);
        if let Err(err) = write_scalar(&path, &value.to_string()) {
            error!(path = %path.display(), error = %format!("{err:#}"), "unable to persist archive state");
            return Err(err);
        }
        *slot = Some(value);
        Ok(())
    }
}

fn parse_revision_dir(name: &str) -> Option<(u64, usize)> {
    let (generation, index) = name
        .strip_prefix(REVISION_DIRECTORY_PREFIX)?
        .split_once('.')?;
    Some((generation.parse().ok()?, index.parse().ok()?))
}

/// Resolve `name` under `<root>/data`, refusing absolute paths and `..`.
pub(crate) fn resolve_data_file(root_dir: &Path, name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let escapes = name.starts_with(['/', '\\'])
        || path.has_root()
        || path
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if name.is_empty() || escapes || name.contains("..") {
        return Err(CacheError::InvalidDataPath(name.to_string()).into());
    }
    let file = root_dir.join(DATA_DIRECTORY).join(path);
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(file)
}
