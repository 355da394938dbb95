use std::fs;

use tempfile::tempdir;

use super::signers::{directory_certificates, jar_certificates, pkcs7_certificates};
use super::*;
use crate::core::errors::CacheError;
use crate::core::test_support::{
    issue, issue_expired, pkcs7_block, self_signed_ca, signing_entries, write_jar,
    write_signed_jar,
};

#[test]
fn canonical_names_come_from_the_certificate() {
    let ca = self_signed_ca("Acme Root");
    let leaf = issue("Acme Leaf", &ca, false);
    assert_eq!(leaf.certificate.subject_dn().unwrap(), "cn=acme leaf");
    assert_eq!(leaf.certificate.issuer_dn().unwrap(), "cn=acme root");
    assert!(ca.certificate.is_self_issued());
    assert!(!leaf.certificate.is_self_issued());
}

#[test]
fn authorities_and_their_direct_issues_are_trusted() {
    let ca = self_signed_ca("Trusted Root");
    let other = self_signed_ca("Other Root");
    let leaf = issue("Leaf", &ca, false);
    let stranger = issue("Stranger", &other, false);

    let trust = TrustManager::new(vec![ca.certificate.clone()]);
    assert!(trust.is_trusted(&ca.certificate));
    assert!(trust.is_trusted(&leaf.certificate));
    assert!(!trust.is_trusted(&other.certificate));
    assert!(!trust.is_trusted(&stranger.certificate));
}

#[test]
fn impostor_with_matching_issuer_name_is_not_trusted() {
    let ca = self_signed_ca("Shared Name");
    let impostor_ca = self_signed_ca("Shared Name");
    let forged = issue("Forged", &impostor_ca, false);

    let trust = TrustManager::new(vec![ca.certificate.clone()]);
    assert!(!trust.is_trusted(&forged.certificate));
}

#[test]
fn expired_certificates_break_trust() {
    let ca = self_signed_ca("Root");
    let expired = issue_expired("Old Leaf", &ca);
    let trust = TrustManager::new(vec![ca.certificate.clone()]);

    assert!(!trust.is_trusted(&expired.certificate));
    let chain = vec![expired.certificate.clone(), ca.certificate.clone()];
    assert!(trust.root_chains(&chain, SignerFilter::Trusted).is_empty());
    assert_eq!(trust.root_chains(&chain, SignerFilter::All).len(), 1);
}

#[test]
fn flattened_lists_split_at_issuer_breaks() {
    let first_root = self_signed_ca("First Root");
    let first_leaf = issue("First Leaf", &first_root, false);
    let second_root = self_signed_ca("Second Root");
    let second_leaf = issue("Second Leaf", &second_root, false);

    let flat = vec![
        first_leaf.certificate.clone(),
        first_root.certificate.clone(),
        second_leaf.certificate.clone(),
        second_root.certificate.clone(),
    ];
    let chains = split_chains(&flat);
    assert_eq!(chains.len(), 2);
    assert_eq!(chains[0], vec![first_leaf.certificate, first_root.certificate]);
    assert_eq!(chains[1][0], second_leaf.certificate);

    let trust = TrustManager::new(vec![second_root.certificate.clone()]);
    let signers = trust.signer_chains(&flat, SignerFilter::Trusted).unwrap();
    assert_eq!(signers.len(), 1);
    assert_eq!(signers[0].dns, vec!["cn=second leaf", "cn=second root"]);

    let all = trust.signer_chains(&flat, SignerFilter::All).unwrap();
    assert_eq!(all.len(), 2);
    assert!(!all[0].trusted);
    assert!(all[1].trusted);
}

#[test]
fn authorities_load_from_pem_and_der() {
    let temp = tempdir().unwrap();
    let first = self_signed_ca("Pem Root");
    let second = self_signed_ca("Der Root");
    let dir = temp.path().join("cas");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("a.pem"), first.key.cert.pem()).unwrap();
    fs::write(dir.join("b.der"), second.certificate.der()).unwrap();

    let trust = TrustManager::load(&[dir]).unwrap();
    assert_eq!(
        trust.authorities(),
        &[first.certificate.clone(), second.certificate.clone()]
    );
}

#[test]
fn pkcs7_chains_are_ordered_from_the_signer() {
    let root = self_signed_ca("Root");
    let intermediate = issue("Intermediate", &root, true);
    let leaf = issue("Leaf", &intermediate, false);

    let block = pkcs7_block(
        &[&root.certificate, &leaf.certificate, &intermediate.certificate],
        &[&leaf.certificate],
    );
    let chain = pkcs7_certificates(&block).unwrap();
    assert_eq!(
        chain,
        vec![leaf.certificate, intermediate.certificate, root.certificate]
    );
}

#[test]
fn signed_jar_yields_its_signer_chain() {
    let temp = tempdir().unwrap();
    let root = self_signed_ca("Signing Root");
    let leaf = issue("Signer", &root, false);
    let jar = temp.path().join("signed.jar");
    write_signed_jar(
        &jar,
        &[("com/", b""), ("com/App.class", b"app"), ("plugin.xml", b"<plugin/>")],
        &[&root.certificate, &leaf.certificate],
        &leaf.certificate,
    );

    let certificates = jar_certificates(&jar).unwrap().expect("signed");
    assert_eq!(certificates, vec![leaf.certificate.clone(), root.certificate.clone()]);

    let trust = TrustManager::new(vec![root.certificate.clone()]);
    let chains = trust
        .signer_chains(&certificates, SignerFilter::Trusted)
        .unwrap();
    assert_eq!(chains[0].dns, vec!["cn=signer", "cn=signing root"]);
}

#[test]
fn unsigned_entry_means_unsigned_jar() {
    let temp = tempdir().unwrap();
    let root = self_signed_ca("Root");
    let signed_entries: [(&str, &[u8]); 1] = [("App.class", b"app")];
    let mut entries: Vec<(String, Vec<u8>)> = signing_entries(
        &signed_entries,
        "SIGNER",
        pkcs7_block(&[&root.certificate], &[&root.certificate]),
    );
    entries.push(("App.class".to_string(), b"app".to_vec()));
    entries.push(("Extra.class".to_string(), b"extra".to_vec()));
    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
        .collect();
    let jar = temp.path().join("partial.jar");
    write_jar(&jar, &borrowed);

    assert!(jar_certificates(&jar).unwrap().is_none());
}

#[test]
fn tampered_entry_is_rejected() {
    let temp = tempdir().unwrap();
    let root = self_signed_ca("Root");
    let signed_entries: [(&str, &[u8]); 1] = [("App.class", b"app")];
    let mut entries = signing_entries(
        &signed_entries,
        "SIGNER",
        pkcs7_block(&[&root.certificate], &[&root.certificate]),
    );
    entries.push(("App.class".to_string(), b"patched".to_vec()));
    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
        .collect();
    let jar = temp.path().join("tampered.jar");
    write_jar(&jar, &borrowed);

    let err = jar_certificates(&jar).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CacheError>(),
        Some(CacheError::BadSigners(_))
    ));
}

#[test]
fn jar_without_signature_files_is_unsigned() {
    let temp = tempdir().unwrap();
    let jar = temp.path().join("plain.jar");
    write_jar(
        &jar,
        &[
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\n\r\n"),
            ("App.class", b"app"),
        ],
    );
    assert!(jar_certificates(&jar).unwrap().is_none());
}

#[test]
fn signed_directory_is_verified_through_a_synthesized_jar() {
    let temp = tempdir().unwrap();
    let root = self_signed_ca("Directory Root");
    let files: [(&str, &[u8]); 2] = [("App.class", b"app"), ("res/data.txt", b"data")];
    let dir = temp.path().join("bundle");
    for (name, bytes) in signing_entries(
        &files,
        "SIGNER",
        pkcs7_block(&[&root.certificate], &[&root.certificate]),
    )
    .into_iter()
    .chain(files.iter().map(|(name, bytes)| (name.to_string(), bytes.to_vec())))
    {
        let path = dir.join(&name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    let certificates = directory_certificates(&dir).unwrap().expect("signed");
    assert_eq!(certificates, vec![root.certificate]);
}
