//! Internal implementation modules for `bx-core`.
//!
//! Callers go through the re-exports at the crate root.

pub mod archive;
pub mod cache;
pub mod config;
pub mod content;
pub mod diagnostics;
pub mod errors;
pub(crate) mod fs;
pub(crate) mod net;
pub mod revision;
pub mod trust;

#[cfg(test)]
pub(crate) mod test_support;
