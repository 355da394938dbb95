use std::path::PathBuf;

use crate::core::diagnostics::cache as codes;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("[BX401] bundle id must be greater than zero, got {0}")]
    InvalidId(i64),
    #[error("[BX402] data file path must be relative and may not reference '..': {0}")]
    InvalidDataPath(String),
    #[error("[BX403] no revision directories found under {}", .0.display())]
    NoRevisions(PathBuf),
    #[error("[BX404] revision {index} does not exist ({count} revisions)")]
    RevisionOutOfRange { index: usize, count: usize },
    #[error("[BX405] referenced file does not exist: {}", .0.display())]
    ReferenceMissing(PathBuf),
    #[error("[BX406] bundle cache {} is locked by another process", .0.display())]
    Locked(PathBuf),
    #[error("[BX407] bad signers: {0}")]
    BadSigners(String),
    #[error("[BX408] no archive for bundle {0}")]
    ArchiveNotFound(i64),
}

impl CacheError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidId(_) => codes::INVALID_ID,
            Self::InvalidDataPath(_) => codes::INVALID_DATA_PATH,
            Self::NoRevisions(_) => codes::NO_REVISIONS,
            Self::RevisionOutOfRange { .. } => codes::REVISION_OUT_OF_RANGE,
            Self::ReferenceMissing(_) => codes::REFERENCE_MISSING,
            Self::Locked(_) => codes::LOCKED,
            Self::BadSigners(_) => codes::BAD_SIGNERS,
            Self::ArchiveNotFound(_) => codes::ARCHIVE_NOT_FOUND,
        }
    }
}
