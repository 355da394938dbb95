//! Signer discovery for signed jars.
//!
//! A signer is a `META-INF/<NAME>.SF` signature file paired with a PKCS#7
//! block (`.RSA`, `.DSA` or `.EC`). Digests are checked with SHA-256/384/512;
//! the PKCS#7 signature value itself is not verified.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bx_domain::der::{
    decode_oid, DerReader, TAG_CONTEXT_0, TAG_INTEGER, TAG_OID, TAG_SEQUENCE, TAG_SET,
};
use bx_domain::{HeaderMap, Manifest, MANIFEST_PATH};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use super::{names_match, Certificate};
use crate::core::errors::CacheError;

const META_INF: &str = "META-INF/";
const SIGNED_DATA_OID: &str = "1.2.840.113549.1.7.2";
const BLOCK_EXTENSIONS: [&str; 3] = [".RSA", ".DSA", ".EC"];

#[derive(Debug, Clone, Copy)]
enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    const SUPPORTED: [Self; 3] = [Self::Sha256, Self::Sha384, Self::Sha512];

    fn header_name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// `Some(true)` when every supported digest named `<ALG><suffix>` matches,
/// `None` when no supported digest is present.
fn digests_match(headers: &HeaderMap, suffix: &str, data: &[u8]) -> Option<bool> {
    let mut checked = false;
    for algorithm in DigestAlgorithm::SUPPORTED {
        let Some(expected) = headers.get(&format!("{}{suffix}", algorithm.header_name())) else {
            continue;
        };
        checked = true;
        match STANDARD.decode(expected.trim()) {
            Ok(expected) if expected == algorithm.digest(data) => {}
            _ => return Some(false),
        }
    }
    checked.then_some(true)
}

struct Signer {
    name: String,
    covered: HashSet<String>,
    block: Vec<u8>,
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Option<Vec<u8>>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {name}")),
    };
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to read {name}"))?;
    Ok(Some(bytes))
}

fn is_signature_file(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.starts_with(META_INF)
        && upper.ends_with(".SF")
        && !upper[META_INF.len()..].contains('/')
}

/// Entries of the signature file whose manifest sections verify, or `None`
/// when the signature file cannot vouch for the manifest.
fn verified_sections(
    signature: &Manifest,
    manifest_bytes: &[u8],
    manifest: &Manifest,
) -> Option<HashSet<String>> {
    let whole_manifest = digests_match(signature.main(), "-Digest-Manifest", manifest_bytes);
    let mut covered = HashSet::new();
    for (name, section) in signature.sections() {
        if whole_manifest == Some(true) {
            covered.insert(name.to_string());
            continue;
        }
        let target = manifest.section(name)?;
        if digests_match(&section.headers, "-Digest", &target.raw) != Some(true) {
            return None;
        }
        covered.insert(name.to_string());
    }
    Some(covered)
}

/// Certificates of every signer that covers all entries, each chain ordered
/// leaf to root. `None` when the jar, or any entry in it, is unsigned.
pub(crate) fn jar_certificates(path: &Path) -> Result<Option<Vec<Certificate>>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read jar {}", path.display()))?;
    let Some(manifest_bytes) = read_entry(&mut archive, MANIFEST_PATH)? else {
        return Ok(None);
    };
    let manifest = Manifest::parse(&manifest_bytes);
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();

    let mut signers = Vec::new();
    for signature_name in names.iter().filter(|name| is_signature_file(name)) {
        let base = &signature_name[..signature_name.len() - ".SF".len()];
        let block_name = BLOCK_EXTENSIONS.iter().find_map(|extension| {
            let wanted = format!("{base}{extension}");
            names.iter().find(|name| name.eq_ignore_ascii_case(&wanted))
        });
        let Some(block_name) = block_name else {
            warn!(signature = %signature_name, "signature file has no signature block");
            continue;
        };
        let Some(signature_bytes) = read_entry(&mut archive, signature_name)? else {
            continue;
        };
        let signature = Manifest::parse(&signature_bytes);
        let Some(covered) = verified_sections(&signature, &manifest_bytes, &manifest) else {
            warn!(signature = %signature_name, "signature file does not match the manifest");
            continue;
        };
        let Some(block) = read_entry(&mut archive, block_name)? else {
            continue;
        };
        signers.push(Signer {
            name: signature_name.clone(),
            covered,
            block,
        });
    }
    if signers.is_empty() {
        return Ok(None);
    }

    let mut surviving: Vec<usize> = (0..signers.len()).collect();
    let mut saw_entry = false;
    for name in &names {
        if name.ends_with('/') || name.to_ascii_uppercase().starts_with(META_INF) {
            continue;
        }
        saw_entry = true;
        let Some(section) = manifest.section(name) else {
            debug!(entry = %name, "entry has no manifest section");
            return Ok(None);
        };
        let bytes = read_entry(&mut archive, name)?.unwrap_or_default();
        match digests_match(&section.headers, "-Digest", &bytes) {
            Some(true) => {}
            Some(false) => {
                return Err(CacheError::BadSigners(format!("digest mismatch for {name}")).into())
            }
            None => return Ok(None),
        }
        if !signers.iter().any(|signer| signer.covered.contains(name)) {
            debug!(entry = %name, "entry is not covered by any signer");
            return Ok(None);
        }
        surviving.retain(|index| signers[*index].covered.contains(name));
        if surviving.is_empty() {
            return Err(CacheError::BadSigners(format!(
                "no signer of {} covers every entry",
                path.display()
            ))
            .into());
        }
    }
    if !saw_entry {
        return Ok(None);
    }

    let mut certificates = Vec::new();
    for index in surviving {
        let signer = &signers[index];
        let chain = pkcs7_certificates(&signer.block)
            .with_context(|| format!("invalid signature block for {}", signer.name))?;
        certificates.extend(chain);
    }
    Ok(Some(certificates))
}

/// Ordered certificate chains of every SignerInfo in a PKCS#7 SignedData.
pub(crate) fn pkcs7_certificates(block: &[u8]) -> Result<Vec<Certificate>> {
    let mut outer = DerReader::new(block);
    let content_info = outer.expect(TAG_SEQUENCE)?;
    let mut fields = content_info.children();
    let content_type = decode_oid(fields.expect(TAG_OID)?.content)?;
    if content_type != SIGNED_DATA_OID {
        bail!("unexpected PKCS#7 content type {content_type}");
    }
    let explicit = fields.expect(TAG_CONTEXT_0)?;
    let mut wrapper = explicit.children();
    let signed_data = wrapper.expect(TAG_SEQUENCE)?;
    let mut fields = signed_data.children();
    fields.expect(TAG_INTEGER)?;
    fields.expect(TAG_SET)?;
    fields.expect(TAG_SEQUENCE)?;

    let mut pool = Vec::new();
    let mut signer_infos = None;
    while !fields.is_empty() {
        let field = fields.read()?;
        match field.tag {
            TAG_CONTEXT_0 => {
                let mut certificates = field.children();
                while !certificates.is_empty() {
                    let certificate = certificates.read()?;
                    if certificate.tag == TAG_SEQUENCE {
                        pool.push(Certificate::from_der(certificate.raw)?);
                    }
                }
            }
            TAG_SET => signer_infos = Some(field),
            _ => {}
        }
    }
    let Some(signer_infos) = signer_infos else {
        bail!("PKCS#7 block has no signer infos");
    };

    let mut ordered = Vec::new();
    let mut infos = signer_infos.children();
    while !infos.is_empty() {
        let info = infos.expect(TAG_SEQUENCE)?;
        let mut info_fields = info.children();
        info_fields.expect(TAG_INTEGER)?;
        let sid = info_fields.read()?;
        if sid.tag != TAG_SEQUENCE {
            warn!("signer identified by key identifier is not supported");
            continue;
        }
        let mut sid_fields = sid.children();
        let issuer = sid_fields.expect(TAG_SEQUENCE)?;
        let serial = sid_fields.expect(TAG_INTEGER)?;
        let leaf = pool.iter().find(|candidate| {
            candidate.serial_raw() == serial.content
                && names_match(candidate.issuer_raw(), issuer.raw)
        });
        match leaf {
            Some(leaf) => ordered.extend(order_chain(leaf, &pool)),
            None => warn!("signer certificate missing from signature block"),
        }
    }
    Ok(ordered)
}

/// Follow issuers through `pool` starting at `leaf`.
fn order_chain(leaf: &Certificate, pool: &[Certificate]) -> Vec<Certificate> {
    let mut chain = vec![leaf.clone()];
    let mut current = leaf;
    while !current.is_self_issued() {
        let next = pool.iter().find(|candidate| {
            names_match(candidate.subject_raw(), current.issuer_raw()) && !chain.contains(candidate)
        });
        let Some(next) = next else {
            break;
        };
        chain.push(next.clone());
        current = next;
    }
    chain
}

/// Pack a directory into a temporary jar: the manifest first, then the rest
/// of `META-INF/`, then every other file.
pub(crate) fn synthesize_jar(dir: &Path) -> Result<NamedTempFile> {
    let mut meta_inf = Vec::new();
    let mut others = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if name == MANIFEST_PATH {
            continue;
        }
        if name.to_ascii_uppercase().starts_with(META_INF) {
            meta_inf.push((name, entry.into_path()));
        } else {
            others.push((name, entry.into_path()));
        }
    }

    let tmp = NamedTempFile::new().context("failed to create temporary jar")?;
    let mut writer = ZipWriter::new(tmp);
    let manifest = dir.join(MANIFEST_PATH);
    let ordered = manifest
        .is_file()
        .then(|| (MANIFEST_PATH.to_string(), manifest))
        .into_iter()
        .chain(meta_inf)
        .chain(others);
    for (name, path) in ordered {
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        writer
            .start_file(name.as_str(), FileOptions::default())
            .with_context(|| format!("failed to add {name} to temporary jar"))?;
        writer
            .write_all(&bytes)
            .with_context(|| format!("failed to add {name} to temporary jar"))?;
    }
    let tmp = writer.finish().context("failed to finish temporary jar")?;
    Ok(tmp)
}

/// Signer certificates of a directory, read through a synthesized jar.
pub(crate) fn directory_certificates(dir: &Path) -> Result<Option<Vec<Certificate>>> {
    let jar = synthesize_jar(dir)?;
    jar_certificates(jar.path())
}
