#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

mod core;

pub use crate::core::archive::BundleArchive;
pub use crate::core::cache::BundleCache;
pub use crate::core::config::{CacheLocation, CacheSettings, Config, DEFAULT_BUFFER_SIZE};
pub use crate::core::content::{
    Content, ContentContext, ContentDirectoryContent, DirectoryContent, JarContent,
};
pub use crate::core::diagnostics;
pub use crate::core::errors::CacheError;
pub use crate::core::revision::{Revision, RevisionKind};
pub use crate::core::trust::{split_chains, Certificate, SignerChain, SignerFilter, TrustManager};
