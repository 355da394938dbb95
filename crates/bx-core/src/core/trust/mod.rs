//! Signer certificates and trust evaluation.
//!
//! Jar signing hands back one flat list holding every signer's chain, each
//! ordered leaf to root. [`split_chains`] cuts that list wherever a
//! certificate was not issued by its successor, and [`TrustManager`] decides
//! which of the resulting chains end in a trusted authority.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use bx_domain::der::{DerReader, TAG_CONTEXT_0, TAG_INTEGER, TAG_SEQUENCE};
use bx_domain::{certificate_tbs, tbs_names, DistinguishedName, DnError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use x509_parser::pem::Pem;
use x509_parser::prelude::*;

pub(crate) mod signers;

#[cfg(test)]
mod tests;

/// A DER certificate with its issuer, subject and serial located.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    issuer: Vec<u8>,
    subject: Vec<u8>,
    serial: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        let tbs = certificate_tbs(&der)?;
        let names = tbs_names(tbs)?;
        let serial = tbs_serial(tbs)?;
        Ok(Self {
            issuer: names.issuer.raw.to_vec(),
            subject: names.subject.raw.to_vec(),
            serial,
            der,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn issuer_raw(&self) -> &[u8] {
        &self.issuer
    }

    pub fn subject_raw(&self) -> &[u8] {
        &self.subject
    }

    /// Content octets of the serial number INTEGER.
    pub fn serial_raw(&self) -> &[u8] {
        &self.serial
    }

    pub fn subject_dn(&self) -> Result<String, DnError> {
        Ok(DistinguishedName::from_der(&self.subject)?.canonical())
    }

    pub fn issuer_dn(&self) -> Result<String, DnError> {
        Ok(DistinguishedName::from_der(&self.issuer)?.canonical())
    }

    pub fn is_self_issued(&self) -> bool {
        names_match(&self.issuer, &self.subject)
    }

    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    fn parsed(&self) -> Result<X509Certificate<'_>> {
        X509Certificate::from_der(&self.der)
            .map(|(_, certificate)| certificate)
            .map_err(|err| anyhow!("failed to parse certificate: {err}"))
    }

    pub fn is_currently_valid(&self) -> bool {
        self.parsed()
            .map(|certificate| certificate.validity().is_valid())
            .unwrap_or(false)
    }

    /// Both certificates must be within their validity period.
    fn verify_issued_by(&self, issuer: &Certificate) -> Result<()> {
        let certificate = self.parsed()?;
        let authority = issuer.parsed()?;
        if !certificate.validity().is_valid() {
            bail!("certificate is outside its validity period");
        }
        if !authority.validity().is_valid() {
            bail!("issuing authority is outside its validity period");
        }
        certificate
            .verify_signature(Some(authority.public_key()))
            .map_err(|err| anyhow!("signature verification failed: {err}"))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject_dn().unwrap_or_default())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn tbs_serial(tbs: &[u8]) -> Result<Vec<u8>> {
    let mut outer = DerReader::new(tbs);
    let sequence = outer.expect(TAG_SEQUENCE)?;
    let mut fields = sequence.children();
    if fields.peek_tag() == Some(TAG_CONTEXT_0) {
        fields.skip()?;
    }
    Ok(fields.expect(TAG_INTEGER)?.content.to_vec())
}

/// Names match when byte-identical or canonically equal.
pub(crate) fn names_match(left: &[u8], right: &[u8]) -> bool {
    if left == right {
        return true;
    }
    match (
        DistinguishedName::from_der(left),
        DistinguishedName::from_der(right),
    ) {
        (Ok(left), Ok(right)) => left.canonical() == right.canonical(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerFilter {
    /// Only chains that end in a trusted authority, all certificates valid.
    Trusted,
    /// Every chain, unverified.
    All,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignerChain {
    #[serde(skip)]
    pub certificates: Vec<Certificate>,
    /// Canonical subject DNs, leaf first.
    pub dns: Vec<String>,
    pub trusted: bool,
}

/// Split a flattened leaf-to-root list at every issuer/subject break.
pub fn split_chains(certificates: &[Certificate]) -> Vec<Vec<Certificate>> {
    let mut chains = Vec::new();
    let mut current: Vec<Certificate> = Vec::new();
    for (index, certificate) in certificates.iter().enumerate() {
        current.push(certificate.clone());
        let continues = certificates
            .get(index + 1)
            .is_some_and(|next| names_match(next.subject_raw(), certificate.issuer_raw()));
        if !continues {
            chains.push(std::mem::take(&mut current));
        }
    }
    chains
}

#[derive(Debug, Clone, Default)]
pub struct TrustManager {
    authorities: Vec<Certificate>,
}

impl TrustManager {
    pub fn new(authorities: Vec<Certificate>) -> Self {
        Self { authorities }
    }

    /// Load PEM or DER certificates from files and directories.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut authorities = Vec::new();
        for path in paths {
            if path.is_dir() {
                let mut files: Vec<PathBuf> = fs::read_dir(path)
                    .with_context(|| format!("failed to read {}", path.display()))?
                    .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                    .filter(|candidate| candidate.is_file())
                    .collect();
                files.sort();
                for file in files {
                    authorities.extend(load_certificates(&file)?);
                }
            } else {
                authorities.extend(load_certificates(path)?);
            }
        }
        debug!(count = authorities.len(), "loaded trusted authorities");
        Ok(Self { authorities })
    }

    pub fn authorities(&self) -> &[Certificate] {
        &self.authorities
    }

    /// Equal to an authority, or directly issued and signed by one.
    pub fn is_trusted(&self, certificate: &Certificate) -> bool {
        for authority in &self.authorities {
            if certificate == authority {
                if certificate.is_currently_valid() {
                    return true;
                }
                warn!(
                    fingerprint = %certificate.fingerprint(),
                    "trusted certificate is outside its validity period"
                );
                continue;
            }
            if names_match(certificate.issuer_raw(), authority.subject_raw()) {
                match certificate.verify_issued_by(authority) {
                    Ok(()) => return true,
                    Err(err) => warn!(
                        fingerprint = %certificate.fingerprint(),
                        authority = %authority.fingerprint(),
                        error = %err,
                        "certificate not trusted"
                    ),
                }
            }
        }
        false
    }

    pub fn root_chains(
        &self,
        certificates: &[Certificate],
        filter: SignerFilter,
    ) -> Vec<Vec<Certificate>> {
        split_chains(certificates)
            .into_iter()
            .filter(|chain| match filter {
                SignerFilter::All => true,
                SignerFilter::Trusted => self.chain_is_trusted(chain),
            })
            .collect()
    }

    fn chain_is_trusted(&self, chain: &[Certificate]) -> bool {
        if let Some(invalid) = chain.iter().find(|cert| !cert.is_currently_valid()) {
            warn!(
                fingerprint = %invalid.fingerprint(),
                "chain contains a certificate outside its validity period"
            );
            return false;
        }
        chain.last().is_some_and(|root| self.is_trusted(root))
    }

    /// Root chains with canonical subject DNs; unknown attribute types fail.
    pub fn signer_chains(
        &self,
        certificates: &[Certificate],
        filter: SignerFilter,
    ) -> Result<Vec<SignerChain>> {
        self.root_chains(certificates, filter)
            .into_iter()
            .map(|chain| {
                let dns = chain
                    .iter()
                    .map(Certificate::subject_dn)
                    .collect::<Result<Vec<_>, _>>()?;
                let trusted = match filter {
                    SignerFilter::Trusted => true,
                    SignerFilter::All => self.chain_is_trusted(&chain),
                };
                Ok(SignerChain {
                    certificates: chain,
                    dns,
                    trusted,
                })
            })
            .collect()
    }
}

fn load_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if !contains_pem_marker(&data) {
        return Ok(vec![Certificate::from_der(data)
            .with_context(|| format!("invalid certificate in {}", path.display()))?]);
    }
    let mut certificates = Vec::new();
    for pem in Pem::iter_from_buffer(&data) {
        let pem = pem.map_err(|err| anyhow!("invalid PEM in {}: {err}", path.display()))?;
        if pem.label == "CERTIFICATE" {
            certificates.push(
                Certificate::from_der(pem.contents)
                    .with_context(|| format!("invalid certificate in {}", path.display()))?,
            );
        }
    }
    Ok(certificates)
}

fn contains_pem_marker(data: &[u8]) -> bool {
    data.windows(b"-----BEGIN".len())
        .any(|window| window == b"-----BEGIN")
}
