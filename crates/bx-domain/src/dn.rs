//! Distinguished-name extraction and RFC 2253 style canonical form.
//!
//! Certificates are walked by hand up to the subject `Name` so the exact
//! attribute bytes are available; the canonical string produced here is
//! compared byte-for-byte by consumers of signer information.

use crate::der::{
    decode_oid, DerError, DerReader, Tlv, TAG_BMP_STRING, TAG_CONTEXT_0, TAG_GENERAL_STRING,
    TAG_IA5_STRING, TAG_INTEGER, TAG_OID, TAG_PRINTABLE_STRING, TAG_SEQUENCE, TAG_SET,
    TAG_TELETEX_STRING, TAG_UNIVERSAL_STRING, TAG_UTF8_STRING,
};

const OID_SHORT_NAMES: &[(&str, &str)] = &[
    ("2.5.4.3", "cn"),
    ("2.5.4.4", "sn"),
    ("2.5.4.5", "serialnumber"),
    ("2.5.4.6", "c"),
    ("2.5.4.7", "l"),
    ("2.5.4.8", "st"),
    ("2.5.4.9", "street"),
    ("2.5.4.10", "o"),
    ("2.5.4.11", "ou"),
    ("2.5.4.12", "title"),
    ("2.5.4.42", "givenname"),
    ("2.5.4.43", "initials"),
    ("2.5.4.44", "generationqualifier"),
    ("2.5.4.46", "dnqualifier"),
    ("0.9.2342.19200300.100.1.1", "uid"),
    ("0.9.2342.19200300.100.1.25", "dc"),
    ("1.2.840.113549.1.9.1", "emailaddress"),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DnError {
    #[error("[BX310] unknown attribute type oid {0}")]
    UnknownOid(String),
    #[error("[BX311] malformed certificate structure: {0}")]
    Malformed(#[from] DerError),
}

impl DnError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownOid(_) => "BX310",
            Self::Malformed(_) => "BX311",
        }
    }
}

/// Map an attribute type OID to its lowercase short name.
pub fn short_name(oid: &str) -> Result<&'static str, DnError> {
    OID_SHORT_NAMES
        .iter()
        .find(|(known, _)| *known == oid)
        .map(|(_, name)| *name)
        .ok_or_else(|| DnError::UnknownOid(oid.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnAttribute {
    pub name: &'static str,
    pub value: String,
}

/// A parsed `Name`, relative distinguished names kept in encoding order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistinguishedName {
    rdns: Vec<Vec<DnAttribute>>,
}

impl DistinguishedName {
    /// Parse a complete `Name` element (SEQUENCE OF SET OF AttributeTypeAndValue).
    pub fn from_der(name: &[u8]) -> Result<Self, DnError> {
        let mut reader = DerReader::new(name);
        let sequence = reader.expect(TAG_SEQUENCE)?;
        Self::from_name(&sequence)
    }

    fn from_name(name: &Tlv<'_>) -> Result<Self, DnError> {
        let mut rdns = Vec::new();
        let mut sets = name.children();
        while !sets.is_empty() {
            let set = sets.expect(TAG_SET)?;
            let mut rdn = Vec::new();
            let mut pairs = set.children();
            while !pairs.is_empty() {
                let pair = pairs.expect(TAG_SEQUENCE)?;
                let mut fields = pair.children();
                let oid = fields.expect(TAG_OID)?;
                let name = short_name(&decode_oid(oid.content)?)?;
                let value = fields.read()?;
                rdn.push(DnAttribute {
                    name,
                    value: escape_value(&attribute_value(&value)),
                });
            }
            rdns.push(rdn);
        }
        Ok(Self { rdns })
    }

    pub fn rdns(&self) -> &[Vec<DnAttribute>] {
        &self.rdns
    }

    /// Root-most RDN first, multi-valued RDNs sorted by short name, lowercased.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (position, rdn) in self.rdns.iter().rev().enumerate() {
            if position > 0 {
                out.push(',');
            }
            let mut attributes: Vec<&DnAttribute> = rdn.iter().collect();
            attributes.sort_by(|a, b| a.name.cmp(b.name));
            for (index, attribute) in attributes.iter().enumerate() {
                if index > 0 {
                    out.push('+');
                }
                out.push_str(attribute.name);
                out.push('=');
                out.push_str(&attribute.value);
            }
        }
        out.to_uppercase().to_lowercase()
    }
}

/// Raw issuer and subject `Name` elements of a TBSCertificate.
#[derive(Debug, Clone, Copy)]
pub struct TbsNames<'a> {
    pub issuer: Tlv<'a>,
    pub subject: Tlv<'a>,
}

/// Walk a TBSCertificate up to and including its subject.
pub fn tbs_names(tbs: &[u8]) -> Result<TbsNames<'_>, DnError> {
    let mut outer = DerReader::new(tbs);
    let certificate = outer.expect(TAG_SEQUENCE)?;
    let mut fields = certificate.children();
    if fields.peek_tag() == Some(TAG_CONTEXT_0) {
        fields.skip()?;
    }
    fields.expect(TAG_INTEGER)?;
    fields.expect(TAG_SEQUENCE)?;
    let issuer = fields.expect(TAG_SEQUENCE)?;
    fields.expect(TAG_SEQUENCE)?;
    let subject = fields.expect(TAG_SEQUENCE)?;
    Ok(TbsNames { issuer, subject })
}

/// The encoded TBSCertificate inside a DER certificate.
pub fn certificate_tbs(certificate: &[u8]) -> Result<&[u8], DnError> {
    let mut outer = DerReader::new(certificate);
    let sequence = outer.expect(TAG_SEQUENCE)?;
    let mut fields = sequence.children();
    Ok(fields.expect(TAG_SEQUENCE)?.raw)
}

pub fn canonical_subject_dn(tbs: &[u8]) -> Result<String, DnError> {
    let names = tbs_names(tbs)?;
    Ok(DistinguishedName::from_name(&names.subject)?.canonical())
}

pub fn canonical_issuer_dn(tbs: &[u8]) -> Result<String, DnError> {
    let names = tbs_names(tbs)?;
    Ok(DistinguishedName::from_name(&names.issuer)?.canonical())
}

/// BMPString and UniversalString are decoded as UTF-16BE and UCS-4 instead
/// of being copied byte for byte, so their canonical form differs from
/// tools that pass the raw bytes through as text.
fn attribute_value(value: &Tlv<'_>) -> String {
    match value.tag {
        TAG_UTF8_STRING
        | TAG_PRINTABLE_STRING
        | TAG_IA5_STRING
        | TAG_TELETEX_STRING
        | TAG_GENERAL_STRING => String::from_utf8_lossy(value.content).into_owned(),
        TAG_BMP_STRING => {
            let units: Vec<u16> = value
                .content
                .chunks(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        TAG_UNIVERSAL_STRING => value
            .content
            .chunks(4)
            .filter(|quad| quad.len() == 4)
            .map(|quad| {
                char::from_u32(u32::from_be_bytes([quad[0], quad[1], quad[2], quad[3]]))
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
            })
            .collect(),
        _ => format!("#{}", hex::encode(value.raw)),
    }
}

/// Escape special characters, collapse runs of spaces and trim the ends.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    if chars.peek() == Some(&'#') {
        out.push_str("\\#");
        chars.next();
    }
    for ch in chars {
        match ch {
            ' ' => {
                if !out.is_empty() && !out.ends_with(' ') {
                    out.push(' ');
                }
            }
            '"' | '\\' | ',' | '+' | '<' | '>' | ';' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    let trimmed = out.trim_end_matches(' ').len();
    out.truncate(trimmed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        let len = content.len();
        if len < 0x80 {
            out.push(len as u8);
        } else if len < 0x100 {
            out.extend([0x81, len as u8]);
        } else {
            out.extend([0x82, (len >> 8) as u8, len as u8]);
        }
        out.extend_from_slice(content);
        out
    }

    fn attr(oid: &[u8], tag: u8, value: &[u8]) -> Vec<u8> {
        let mut body = tlv(TAG_OID, oid);
        body.extend(tlv(tag, value));
        tlv(TAG_SEQUENCE, &body)
    }

    fn rdn(attrs: &[Vec<u8>]) -> Vec<u8> {
        tlv(TAG_SET, &attrs.concat())
    }

    fn name(rdns: &[Vec<u8>]) -> Vec<u8> {
        tlv(TAG_SEQUENCE, &rdns.concat())
    }

    const CN: &[u8] = &[0x55, 0x04, 0x03];
    const O: &[u8] = &[0x55, 0x04, 0x0a];
    const OU: &[u8] = &[0x55, 0x04, 0x0b];
    const C: &[u8] = &[0x55, 0x04, 0x06];

    fn tbs(with_version: bool, issuer: &[u8], subject: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        if with_version {
            body.extend(tlv(TAG_CONTEXT_0, &tlv(TAG_INTEGER, &[2])));
        }
        body.extend(tlv(TAG_INTEGER, &[0x01, 0x23]));
        body.extend(tlv(TAG_SEQUENCE, &tlv(TAG_OID, &[0x2a, 0x03])));
        body.extend_from_slice(issuer);
        body.extend(tlv(
            TAG_SEQUENCE,
            &[tlv(0x17, b"200101000000Z"), tlv(0x17, b"300101000000Z")].concat(),
        ));
        body.extend_from_slice(subject);
        body.extend(tlv(TAG_SEQUENCE, &[0u8; 4]));
        tlv(TAG_SEQUENCE, &body)
    }

    #[test]
    fn canonical_form_reverses_rdn_order() {
        let subject = name(&[
            rdn(&[attr(CN, TAG_UTF8_STRING, b"a")]),
            rdn(&[attr(O, TAG_PRINTABLE_STRING, b"b")]),
        ]);
        let issuer = name(&[rdn(&[attr(CN, TAG_UTF8_STRING, b"Issuer")])]);
        let encoded = tbs(true, &issuer, &subject);
        assert_eq!(canonical_subject_dn(&encoded).unwrap(), "o=b,cn=a");
        assert_eq!(canonical_issuer_dn(&encoded).unwrap(), "cn=issuer");
    }

    #[test]
    fn version_field_is_optional() {
        let subject = name(&[rdn(&[attr(C, TAG_PRINTABLE_STRING, b"DE")])]);
        let encoded = tbs(false, &name(&[]), &subject);
        assert_eq!(canonical_subject_dn(&encoded).unwrap(), "c=de");
        assert_eq!(canonical_issuer_dn(&encoded).unwrap(), "");
    }

    #[test]
    fn multi_valued_rdns_sort_by_short_name() {
        let forward = name(&[
            rdn(&[attr(C, TAG_PRINTABLE_STRING, b"US")]),
            rdn(&[
                attr(OU, TAG_UTF8_STRING, b"Eng"),
                attr(CN, TAG_UTF8_STRING, b"Bob"),
            ]),
        ]);
        let swapped = name(&[
            rdn(&[attr(C, TAG_PRINTABLE_STRING, b"US")]),
            rdn(&[
                attr(CN, TAG_UTF8_STRING, b"Bob"),
                attr(OU, TAG_UTF8_STRING, b"Eng"),
            ]),
        ]);
        let first = DistinguishedName::from_der(&forward).unwrap().canonical();
        let second = DistinguishedName::from_der(&swapped).unwrap().canonical();
        assert_eq!(first, "cn=bob+ou=eng,c=us");
        assert_eq!(first, second);
    }

    #[test]
    fn special_characters_are_escaped() {
        let subject = name(&[rdn(&[attr(
            CN,
            TAG_UTF8_STRING,
            b"#  Smith,  John + \"Jr\" <x>;\\  ",
        )])]);
        let dn = DistinguishedName::from_der(&subject).unwrap();
        assert_eq!(
            dn.canonical(),
            "cn=\\# smith\\, john \\+ \\\"jr\\\" \\<x\\>\\;\\\\"
        );
    }

    #[test]
    fn non_string_values_render_as_escaped_hex() {
        let subject = name(&[rdn(&[attr(CN, 0x04, &[0xde, 0xad])])]);
        let dn = DistinguishedName::from_der(&subject).unwrap();
        assert_eq!(dn.canonical(), "cn=\\#0402dead");
    }

    #[test]
    fn bmp_strings_decode_as_utf16() {
        let subject = name(&[rdn(&[attr(CN, TAG_BMP_STRING, &[0x00, b'Z', 0x00, b'e'])])]);
        let dn = DistinguishedName::from_der(&subject).unwrap();
        assert_eq!(dn.canonical(), "cn=ze");
    }

    #[test]
    fn universal_strings_decode_as_ucs4() {
        let value = [0, 0, 0, b'Q', 0, 0, 0x00, 0xe9];
        let subject = name(&[rdn(&[attr(CN, TAG_UNIVERSAL_STRING, &value)])]);
        let dn = DistinguishedName::from_der(&subject).unwrap();
        assert_eq!(dn.canonical(), "cn=qé");
    }

    #[test]
    fn unknown_oids_are_rejected() {
        let subject = name(&[rdn(&[attr(&[0x55, 0x04, 0x63], TAG_UTF8_STRING, b"x")])]);
        let err = DistinguishedName::from_der(&subject).unwrap_err();
        assert_eq!(err, DnError::UnknownOid("2.5.4.99".to_string()));
        assert_eq!(err.code(), "BX310");
    }

    #[test]
    fn certificate_tbs_returns_inner_sequence() {
        let inner = tbs(true, &name(&[]), &name(&[]));
        let mut cert_body = inner.clone();
        cert_body.extend(tlv(TAG_SEQUENCE, &tlv(TAG_OID, &[0x2a, 0x03])));
        cert_body.extend(tlv(0x03, &[0x00, 0x01]));
        let cert = tlv(TAG_SEQUENCE, &cert_body);
        assert_eq!(certificate_tbs(&cert).unwrap(), inner.as_slice());
    }

    #[test]
    fn truncated_tbs_is_malformed() {
        let encoded = tbs(true, &name(&[]), &name(&[]));
        let err = canonical_subject_dn(&encoded[..encoded.len() - 8]).unwrap_err();
        assert!(matches!(err, DnError::Malformed(_)));
    }
}
