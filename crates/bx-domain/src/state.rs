use std::fmt;

use serde::{Deserialize, Serialize};

/// Persisted lifecycle state of a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleState {
    #[default]
    Installed,
    Active,
    Uninstalled,
}

impl BundleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Active => "active",
            Self::Uninstalled => "uninstalled",
        }
    }

    /// Unrecognised values read back as `Installed`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "active" => Self::Active,
            "uninstalled" => Self::Uninstalled,
            _ => Self::Installed,
        }
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
