#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod der;
pub mod dn;
pub mod location;
pub mod manifest;
pub mod state;

pub use der::{DerError, DerReader, Tlv};
pub use dn::{
    canonical_issuer_dn, canonical_subject_dn, certificate_tbs, tbs_names, DistinguishedName,
    DnAttribute, DnError, TbsNames,
};
pub use location::{Location, LocationError, FILE_PROTOCOL, INPUTSTREAM_PROTOCOL, REFERENCE_PROTOCOL};
pub use manifest::{
    parse_delimited, HeaderMap, Manifest, ManifestSection, BUNDLE_CLASSPATH, CLASS_PATH_DOT,
    MANIFEST_PATH,
};
pub use state::BundleState;
