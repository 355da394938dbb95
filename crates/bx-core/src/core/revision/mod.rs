//! One immutable content snapshot of a bundle.
//!
//! The variant is decided once from the location string: referenced
//! directories are read in place, referenced jars are read in place but
//! extract into the revision root, and everything else is copied into
//! `<root>/bundle.jar` first.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::{bail, Context, Result};
use bx_domain::{Location, Manifest, CLASS_PATH_DOT, MANIFEST_PATH};
use tracing::{debug, info};

use crate::core::config::CacheSettings;
use crate::core::content::{Content, ContentContext, DirectoryContent, JarContent};
use crate::core::errors::CacheError;
use crate::core::fs::{copy_file, copy_stream_to_file};
use crate::core::net;
use crate::core::trust::signers::{directory_certificates, jar_certificates};
use crate::core::trust::{SignerChain, SignerFilter, TrustManager};


pub(crate) const BUNDLE_JAR: &str = "bundle.jar";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionKind {
    /// A referenced directory, never copied.
    Directory { dir: PathBuf },
    /// A jar, either referenced in place or copied into the revision root.
    Jar { file: PathBuf, by_reference: bool },
}

#[derive(Debug)]
pub struct Revision {
    location: String,
    root_dir: PathBuf,
    kind: RevisionKind,
    ctx: ContentContext,
    content: OnceLock<Arc<dyn Content>>,
    manifest: OnceLock<Arc<Manifest>>,
    signers: Mutex<HashMap<SignerFilter, Arc<Vec<SignerChain>>>>,
}

impl Revision {
    /// Build a revision rooted at `root_dir`. A supplied stream always wins
    /// over the location; an existing `bundle.jar` is reused as is.
    pub fn new(
        root_dir: PathBuf,
        location: &str,
        input: Option<&mut dyn Read>,
        settings: Arc<CacheSettings>,
    ) -> Result<Self> {
        fs::create_dir_all(&root_dir)
            .with_context(|| format!("failed to create {}", root_dir.display()))?;
        let kind = match Location::parse(location)? {
            Location::Reference(path) => {
                if !path.exists() {
                    return Err(CacheError::ReferenceMissing(path).into());
                }
                if path.is_dir() {
                    RevisionKind::Directory { dir: path }
                } else {
                    RevisionKind::Jar {
                        file: path,
                        by_reference: true,
                    }
                }
            }
            parsed => {
                let file = root_dir.join(BUNDLE_JAR);
                if !file.exists() {
                    fetch_bundle_jar(&parsed, location, input, &file, &settings)?;
                }
                RevisionKind::Jar {
                    file,
                    by_reference: false,
                }
            }
        };
        debug!(root = %root_dir.display(), %location, ?kind, "revision ready");
        Ok(Self {
            location: location.to_string(),
            root_dir,
            kind,
            ctx: ContentContext::new(settings),
            content: OnceLock::new(),
            manifest: OnceLock::new(),
            signers: Mutex::new(HashMap::new()),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn kind(&self) -> &RevisionKind {
        &self.kind
    }

    /// The primary content of this revision.
    pub fn content(&self) -> Arc<dyn Content> {
        let content = self.content.get_or_init(|| match &self.kind {
            RevisionKind::Directory { dir } => Arc::new(DirectoryContent::new(
                self.ctx.clone(),
                self.root_dir.clone(),
                dir.clone(),
            )),
            RevisionKind::Jar { file, .. } => Arc::new(JarContent::primary(
                self.ctx.clone(),
                &self.root_dir,
                file.clone(),
            )),
        });
        Arc::clone(content)
    }

    /// Parsed `META-INF/MANIFEST.MF`; a missing manifest reads as empty.
    pub fn manifest(&self) -> Result<Arc<Manifest>> {
        if let Some(manifest) = self.manifest.get() {
            return Ok(Arc::clone(manifest));
        }
        let bytes = self
            .content()
            .entry_bytes(MANIFEST_PATH)
            .with_context(|| format!("failed to read manifest of {}", self.location))?;
        let manifest = Arc::new(bytes.map(|bytes| Manifest::parse(&bytes)).unwrap_or_default());
        Ok(Arc::clone(self.manifest.get_or_init(|| manifest)))
    }

    pub fn manifest_header(&self, name: &str) -> Result<Option<String>> {
        Ok(self.manifest()?.main().get(name).map(str::to_string))
    }

    /// Contents named by `Bundle-ClassPath`, missing entries skipped;
    /// `[self]` when nothing resolves.
    pub fn content_path(&self) -> Result<Vec<Arc<dyn Content>>> {
        let manifest = self.manifest()?;
        let content = self.content();
        let mut path = Vec::new();
        for entry in manifest.class_path() {
            if entry == CLASS_PATH_DOT {
                path.push(Arc::clone(&content));
                continue;
            }
            match content.entry_as_content(&entry)? {
                Some(nested) => path.push(nested),
                None => info!(
                    location = %self.location,
                    %entry,
                    "class path entry not found; skipping"
                ),
            }
        }
        if path.is_empty() {
            path.push(content);
        }
        Ok(path)
    }

    pub fn find_library(&self, name: &str) -> Result<Option<PathBuf>> {
        self.content().entry_as_native_library(name)
    }

    /// Signer chains of the bundle content; cached per filter.
    pub fn signers(
        &self,
        trust: &TrustManager,
        filter: SignerFilter,
    ) -> Result<Arc<Vec<SignerChain>>> {
        let mut cache = self.signers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(chains) = cache.get(&filter) {
            return Ok(Arc::clone(chains));
        }
        let certificates = match &self.kind {
            RevisionKind::Directory { dir } => directory_certificates(dir)?,
            RevisionKind::Jar { file, .. } => jar_certificates(file)?,
        };
        let chains = match certificates {
            Some(certificates) => trust.signer_chains(&certificates, filter)?,
            None => Vec::new(),
        };
        let chains = Arc::new(chains);
        cache.insert(filter, Arc::clone(&chains));
        Ok(chains)
    }

    /// Release open handles; files under the root are left to the archive.
    pub fn dispose(&self) {
        if let Some(content) = self.content.get() {
            content.close();
        }
    }
}

fn fetch_bundle_jar(
    parsed: &Location,
    location: &str,
    input: Option<&mut dyn Read>,
    dest: &Path,
    settings: &CacheSettings,
) -> Result<()> {
    let copied = if let Some(reader) = input {
        copy_stream_to_file(reader, dest, settings.buffer_size)?
    } else {
        match parsed {
            Location::InputStream | Location::Reference(_) => {
                bail!("no input stream supplied for {location}")
            }
            Location::Url(_) => match parsed.local_file() {
                Some(path) => copy_file(&path, dest, settings.buffer_size)?,
                None => {
                    let mut reader = net::open_location(location, settings)?;
                    copy_stream_to_file(&mut reader, dest, settings.buffer_size)?
                }
            },
        }
    };
    debug!(%location, path = %dest.display(), bytes = copied, "bundle jar copied");
    Ok(())
}
