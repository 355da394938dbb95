//! Minimal DER tag/length/value cursor.
//!
//! The reader is a plain value over a borrowed buffer; every parse creates its
//! own cursor, so nothing is shared between concurrent callers.

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_TELETEX_STRING: u8 = 0x14;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_GENERAL_STRING: u8 = 0x1b;
pub const TAG_UNIVERSAL_STRING: u8 = 0x1c;
pub const TAG_BMP_STRING: u8 = 0x1e;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;
pub const TAG_CONTEXT_0: u8 = 0xa0;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DerError {
    #[error("DER value truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("DER length at offset {offset} does not fit in memory")]
    LengthOverflow { offset: usize },
    #[error("indefinite DER length at offset {offset}")]
    IndefiniteLength { offset: usize },
    #[error("expected DER tag 0x{expected:02x} at offset {offset}, found 0x{found:02x}")]
    UnexpectedTag {
        offset: usize,
        expected: u8,
        found: u8,
    },
    #[error("malformed object identifier")]
    MalformedOid,
}

/// One decoded element: its tag, its content bytes and the full encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub offset: usize,
    pub content: &'a [u8],
    pub raw: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Cursor over the children of a constructed element.
    pub fn children(&self) -> DerReader<'a> {
        DerReader::new(self.content)
    }
}

#[derive(Debug, Clone)]
pub struct DerReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn read(&mut self) -> Result<Tlv<'a>, DerError> {
        let start = self.pos;
        let tag = self.byte(start)?;
        let first = self.byte(start + 1)?;
        let mut cursor = start + 2;
        let length = if first & 0x80 == 0 {
            usize::from(first)
        } else {
            let octets = usize::from(first & 0x7f);
            if octets == 0 {
                return Err(DerError::IndefiniteLength { offset: start });
            }
            if octets > std::mem::size_of::<usize>() {
                return Err(DerError::LengthOverflow { offset: start });
            }
            let mut length = 0usize;
            for _ in 0..octets {
                let octet = self.byte(cursor)?;
                cursor += 1;
                length = length
                    .checked_mul(256)
                    .and_then(|value| value.checked_add(usize::from(octet)))
                    .ok_or(DerError::LengthOverflow { offset: start })?;
            }
            length
        };
        let end = cursor
            .checked_add(length)
            .ok_or(DerError::LengthOverflow { offset: start })?;
        if end > self.buf.len() {
            return Err(DerError::Truncated { offset: start });
        }
        self.pos = end;
        Ok(Tlv {
            tag,
            offset: start,
            content: &self.buf[cursor..end],
            raw: &self.buf[start..end],
        })
    }

    pub fn expect(&mut self, tag: u8) -> Result<Tlv<'a>, DerError> {
        let offset = self.pos;
        let tlv = self.read()?;
        if tlv.tag != tag {
            return Err(DerError::UnexpectedTag {
                offset,
                expected: tag,
                found: tlv.tag,
            });
        }
        Ok(tlv)
    }

    /// Skip one element, returning its tag.
    pub fn skip(&mut self) -> Result<u8, DerError> {
        self.read().map(|tlv| tlv.tag)
    }

    fn byte(&self, index: usize) -> Result<u8, DerError> {
        self.buf
            .get(index)
            .copied()
            .ok_or(DerError::Truncated { offset: self.pos })
    }
}

/// Render the content octets of an OBJECT IDENTIFIER in dotted form.
pub fn decode_oid(content: &[u8]) -> Result<String, DerError> {
    let mut arcs: Vec<u64> = Vec::new();
    let mut value: u64 = 0;
    let mut pending = false;
    for &octet in content {
        value = value
            .checked_mul(128)
            .map(|shifted| shifted | u64::from(octet & 0x7f))
            .ok_or(DerError::MalformedOid)?;
        if octet & 0x80 != 0 {
            pending = true;
            continue;
        }
        pending = false;
        if arcs.is_empty() {
            let (first, second) = match value {
                0..=39 => (0, value),
                40..=79 => (1, value - 40),
                _ => (2, value - 80),
            };
            arcs.push(first);
            arcs.push(second);
        } else {
            arcs.push(value);
        }
        value = 0;
    }
    if pending || arcs.is_empty() {
        return Err(DerError::MalformedOid);
    }
    let rendered: Vec<String> = arcs.iter().map(u64::to_string).collect();
    Ok(rendered.join("."))
}
