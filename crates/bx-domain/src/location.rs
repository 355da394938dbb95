use std::fmt;
use std::path::PathBuf;

use percent_encoding::percent_decode_str;

pub const REFERENCE_PROTOCOL: &str = "reference:";
pub const FILE_PROTOCOL: &str = "file:";
pub const INPUTSTREAM_PROTOCOL: &str = "inputstream:";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("[BX320] bundle location is empty")]
    Empty,
    #[error("[BX321] reference locations must point at files: {0}")]
    NotAFileReference(String),
    #[error("[BX322] reference location is not valid UTF-8 once decoded: {0}")]
    Undecodable(String),
}

impl LocationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "BX320",
            Self::NotAFileReference(_) => "BX321",
            Self::Undecodable(_) => "BX322",
        }
    }
}

/// Where the content of a revision comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Local file or directory used in place, never copied.
    Reference(PathBuf),
    /// Content supplied by the caller as a byte stream.
    InputStream,
    /// Anything else; fetched and copied into the revision.
    Url(String),
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self, LocationError> {
        if raw.is_empty() {
            return Err(LocationError::Empty);
        }
        if let Some(rest) = raw.strip_prefix(REFERENCE_PROTOCOL) {
            let Some(path) = rest.strip_prefix(FILE_PROTOCOL) else {
                return Err(LocationError::NotAFileReference(rest.to_string()));
            };
            return Ok(Self::Reference(PathBuf::from(decode_file_path(path)?)));
        }
        if raw.starts_with(INPUTSTREAM_PROTOCOL) {
            return Ok(Self::InputStream);
        }
        Ok(Self::Url(raw.to_string()))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    /// Local path for `file:` URLs that are not references.
    pub fn local_file(&self) -> Option<PathBuf> {
        match self {
            Self::Url(url) => url
                .strip_prefix(FILE_PROTOCOL)
                .and_then(|path| decode_file_path(path).ok())
                .map(PathBuf::from),
            _ => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference(path) => {
                write!(f, "{REFERENCE_PROTOCOL}{FILE_PROTOCOL}{}", path.display())
            }
            Self::InputStream => f.write_str(INPUTSTREAM_PROTOCOL),
            Self::Url(url) => f.write_str(url),
        }
    }
}

fn decode_file_path(path: &str) -> Result<String, LocationError> {
    // `file:///abs` carries an empty authority
    let path = match path.strip_prefix("//") {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    };
    percent_decode_str(path)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| LocationError::Undecodable(path.to_string()))
}
