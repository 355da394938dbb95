//! Fixtures shared by the unit tests: jars, certificates and signed jars.

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, CertifiedKey, DistinguishedName, DnType, IsCa, KeyPair,
};
use sha2::{Digest, Sha256};
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::core::config::CacheSettings;
use crate::core::trust::Certificate;

pub(crate) fn settings() -> Arc<CacheSettings> {
    Arc::new(CacheSettings::default())
}

pub(crate) fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("jar parent");
    }
    let file = File::create(path).expect("create jar");
    let mut zip = ZipWriter::new(file);
    add_entries(&mut zip, entries);
    zip.finish().expect("finish jar");
}

pub(crate) fn jar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    add_entries(&mut zip, entries);
    zip.finish().expect("finish jar").into_inner()
}

fn add_entries<W: Write + std::io::Seek>(zip: &mut ZipWriter<W>, entries: &[(&str, &[u8])]) {
    let opts = FileOptions::default();
    for (name, bytes) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, opts).expect("add directory");
        } else {
            zip.start_file(*name, opts).expect("start entry");
            zip.write_all(bytes).expect("write entry");
        }
    }
}

pub(crate) fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(u8::try_from(len).expect("short length"));
    } else {
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|byte| *byte == 0)
            .collect();
        out.push(0x80 | u8::try_from(bytes.len()).expect("length octets"));
        out.extend(bytes);
    }
    out.extend_from_slice(content);
    out
}

pub(crate) fn der_oid(dotted: &str) -> Vec<u8> {
    let arcs: Vec<u64> = dotted
        .split('.')
        .map(|arc| arc.parse().expect("numeric arc"))
        .collect();
    let mut content = Vec::new();
    let mut values = vec![arcs[0] * 40 + arcs[1]];
    values.extend(&arcs[2..]);
    for value in values {
        let mut chunk = vec![u8::try_from(value & 0x7f).expect("low bits")];
        let mut rest = value >> 7;
        while rest > 0 {
            chunk.push(0x80 | u8::try_from(rest & 0x7f).expect("high bits"));
            rest >>= 7;
        }
        chunk.reverse();
        content.extend(chunk);
    }
    der(0x06, &content)
}

pub(crate) struct Issued {
    pub(crate) key: CertifiedKey,
    pub(crate) certificate: Certificate,
}

fn params(common_name: &str, ca: bool) -> CertificateParams {
    let mut params = CertificateParams::new(vec![]).expect("params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    if ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    }
    params
}

fn wrap(cert: rcgen::Certificate, key_pair: KeyPair) -> Issued {
    let certificate = Certificate::from_der(cert.der().to_vec()).expect("parse generated cert");
    Issued {
        key: CertifiedKey { cert, key_pair },
        certificate,
    }
}

pub(crate) fn self_signed_ca(common_name: &str) -> Issued {
    let key_pair = KeyPair::generate().expect("ca key");
    let cert = params(common_name, true)
        .self_signed(&key_pair)
        .expect("ca certificate");
    wrap(cert, key_pair)
}

pub(crate) fn issue(common_name: &str, issuer: &Issued, ca: bool) -> Issued {
    issue_with(params(common_name, ca), issuer)
}

pub(crate) fn issue_expired(common_name: &str, issuer: &Issued) -> Issued {
    let mut params = params(common_name, false);
    params.not_before = rcgen::date_time_ymd(1990, 1, 1);
    params.not_after = rcgen::date_time_ymd(2000, 1, 1);
    issue_with(params, issuer)
}

fn issue_with(params: CertificateParams, issuer: &Issued) -> Issued {
    let key_pair = KeyPair::generate().expect("leaf key");
    let cert = params
        .signed_by(&key_pair, &issuer.key.cert, &issuer.key.key_pair)
        .expect("issued certificate");
    wrap(cert, key_pair)
}

/// PKCS#7 SignedData carrying `pool` and one SignerInfo per leaf.
pub(crate) fn pkcs7_block(pool: &[&Certificate], leaves: &[&Certificate]) -> Vec<u8> {
    let certificates: Vec<u8> = pool.iter().flat_map(|cert| cert.der().to_vec()).collect();
    let signer_infos: Vec<u8> = leaves
        .iter()
        .flat_map(|leaf| {
            let mut sid = leaf.issuer_raw().to_vec();
            sid.extend(der(0x02, leaf.serial_raw()));
            let mut info = der(0x02, &[1]);
            info.extend(der(0x30, &sid));
            info.extend(der(0x30, &der_oid("2.16.840.1.101.3.4.2.1")));
            info.extend(der(0x30, &der_oid("1.2.840.10045.2.1")));
            info.extend(der(0x04, b"unverified"));
            der(0x30, &info)
        })
        .collect();

    let mut signed = der(0x02, &[1]);
    signed.extend(der(0x31, &der(0x30, &der_oid("2.16.840.1.101.3.4.2.1"))));
    signed.extend(der(0x30, &der_oid("1.2.840.113549.1.7.1")));
    signed.extend(der(0xa0, &certificates));
    signed.extend(der(0x31, &signer_infos));

    let mut content_info = der_oid("1.2.840.113549.1.7.2");
    content_info.extend(der(0xa0, &der(0x30, &signed)));
    der(0x30, &content_info)
}

fn sha256_b64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Manifest, signature file and signature block for `entries`, signed by
/// `signer` with `block` as its PKCS#7 content.
pub(crate) fn signing_entries(
    entries: &[(&str, &[u8])],
    signer: &str,
    block: Vec<u8>,
) -> Vec<(String, Vec<u8>)> {
    let mut manifest = String::from("Manifest-Version: 1.0\r\nCreated-By: bx tests\r\n\r\n");
    let mut sections = Vec::new();
    for (name, bytes) in entries {
        if name.ends_with('/') {
            continue;
        }
        let section = format!(
            "Name: {name}\r\nSHA-256-Digest: {}\r\n\r\n",
            sha256_b64(bytes)
        );
        manifest.push_str(&section);
        sections.push((name.to_string(), section));
    }
    let mut signature = format!(
        "Signature-Version: 1.0\r\nSHA-256-Digest-Manifest: {}\r\n\r\n",
        sha256_b64(manifest.as_bytes())
    );
    for (name, section) in &sections {
        signature.push_str(&format!(
            "Name: {name}\r\nSHA-256-Digest: {}\r\n\r\n",
            sha256_b64(section.as_bytes())
        ));
    }
    vec![
        ("META-INF/MANIFEST.MF".to_string(), manifest.into_bytes()),
        (format!("META-INF/{signer}.SF"), signature.into_bytes()),
        (format!("META-INF/{signer}.EC"), block),
    ]
}

/// A jar at `path` holding `entries` signed by the chain `leaf` .. `pool`.
pub(crate) fn write_signed_jar(
    path: &Path,
    entries: &[(&str, &[u8])],
    pool: &[&Certificate],
    leaf: &Certificate,
) {
    let block = pkcs7_block(pool, &[leaf]);
    let meta = signing_entries(entries, "SIGNER", block);
    let mut all: Vec<(&str, &[u8])> = meta
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
        .collect();
    all.extend_from_slice(entries);
    write_jar(path, &all);
}
