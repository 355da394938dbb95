use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bx_domain::CLASS_PATH_DOT;

use super::{strip_leading_slash, Content};

/// A directory entry of another content, viewed as content of its own.
#[derive(Debug)]
pub struct ContentDirectoryContent {
    parent: Arc<dyn Content>,
    prefix: String,
}

impl ContentDirectoryContent {
    pub(crate) fn new(parent: Arc<dyn Content>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { parent, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}{}", self.prefix, strip_leading_slash(name))
    }
}

impl Content for ContentDirectoryContent {
    fn has_entry(&self, name: &str) -> bool {
        self.parent.has_entry(&self.qualify(name))
    }

    fn entries(&self) -> Option<Vec<String>> {
        let names: Vec<String> = self
            .parent
            .entries()?
            .into_iter()
            .filter_map(|name| {
                name.strip_prefix(&self.prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(str::to_string)
            })
            .collect();
        (!names.is_empty()).then_some(names)
    }

    fn entry_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.parent.entry_bytes(&self.qualify(name))
    }

    fn entry_stream(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>> {
        self.parent.entry_stream(&self.qualify(name))
    }

    fn entry_as_content(&self, name: &str) -> Result<Option<Arc<dyn Content>>> {
        if name == CLASS_PATH_DOT {
            return Ok(Some(Arc::new(Self::new(
                Arc::clone(&self.parent),
                self.prefix.clone(),
            ))));
        }
        self.parent.entry_as_content(&self.qualify(name))
    }

    fn entry_as_native_library(&self, name: &str) -> Result<Option<PathBuf>> {
        self.parent.entry_as_native_library(&self.qualify(name))
    }

    fn close(&self) {}
}

impl fmt::Display for ContentDirectoryContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CONTENT DIR {} ({})", self.prefix, self.parent)
    }
}
