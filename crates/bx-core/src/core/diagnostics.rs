//! Stable diagnostic codes surfaced in command output.

use bx_domain::{DnError, LocationError};

use crate::core::errors::CacheError;

pub mod cache {
    pub const INVALID_ID: &str = "BX401";
    pub const INVALID_DATA_PATH: &str = "BX402";
    pub const NO_REVISIONS: &str = "BX403";
    pub const REVISION_OUT_OF_RANGE: &str = "BX404";
    pub const REFERENCE_MISSING: &str = "BX405";
    pub const LOCKED: &str = "BX406";
    pub const BAD_SIGNERS: &str = "BX407";
    pub const ARCHIVE_NOT_FOUND: &str = "BX408";
}

pub const GENERIC: &str = "BX000";

/// Code of the first typed failure in an error chain.
#[must_use]
pub fn code_of(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(cache) = cause.downcast_ref::<CacheError>() {
            return cache.code();
        }
        if let Some(dn) = cause.downcast_ref::<DnError>() {
            return dn.code();
        }
        if let Some(location) = cause.downcast_ref::<LocationError>() {
            return location.code();
        }
    }
    GENERIC
}
