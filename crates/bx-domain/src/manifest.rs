//! Jar manifest parsing.
//!
//! Header names are matched case-insensitively while the spelling of the
//! first occurrence is kept for display. Per-entry sections keep their raw
//! bytes, terminating blank line included, so signature files can digest
//! them exactly as written.

use indexmap::IndexMap;

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
pub const BUNDLE_CLASSPATH: &str = "Bundle-ClassPath";
pub const CLASS_PATH_DOT: &str = ".";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: IndexMap<String, (String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Later values for the same header replace earlier ones.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(slot) => slot.1 = value,
            None => {
                self.entries.insert(key, (name, value));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSection {
    pub headers: HeaderMap,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    main: ManifestSection,
    sections: IndexMap<String, ManifestSection>,
}

impl Manifest {
    /// Parse leniently: lines without a `:` separator are ignored.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut manifest = Self::default();
        let mut current: Option<ManifestSection> = None;
        let mut section_start = 0;
        let mut in_main = true;
        let mut pending: Option<(String, Vec<u8>)> = None;

        for line in split_lines(bytes) {
            let text = &bytes[line.start..line.content_end];
            if text.is_empty() {
                flush_header(current.as_mut(), pending.take());
                let raw = bytes[section_start..line.end].to_vec();
                finish_section(&mut manifest, &mut in_main, current.take(), raw);
                section_start = line.end;
                continue;
            }
            let section = current.get_or_insert_with(ManifestSection::default);
            if text[0] == b' ' {
                if let Some((_, value)) = pending.as_mut() {
                    value.extend_from_slice(&text[1..]);
                }
                continue;
            }
            flush_header(Some(section), pending.take());
            let Some(colon) = text.iter().position(|byte| *byte == b':') else {
                continue;
            };
            let name = String::from_utf8_lossy(&text[..colon]).trim().to_string();
            let value = &text[colon + 1..];
            let value = value.strip_prefix(b" ").unwrap_or(value);
            pending = Some((name, value.to_vec()));
        }
        flush_header(current.as_mut(), pending);
        if current.is_some() || section_start < bytes.len() {
            let raw = bytes[section_start..].to_vec();
            finish_section(&mut manifest, &mut in_main, current, raw);
        }
        manifest
    }

    pub fn main(&self) -> &HeaderMap {
        &self.main.headers
    }

    pub fn main_section(&self) -> &ManifestSection {
        &self.main
    }

    pub fn section(&self, name: &str) -> Option<&ManifestSection> {
        self.sections.get(name)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &ManifestSection)> {
        self.sections
            .iter()
            .map(|(name, section)| (name.as_str(), section))
    }

    /// Entries of `Bundle-ClassPath`, leading slashes and parameters removed.
    pub fn class_path(&self) -> Vec<String> {
        let Some(header) = self.main().get(BUNDLE_CLASSPATH) else {
            return Vec::new();
        };
        parse_delimited(header, ',')
            .into_iter()
            .filter_map(|clause| {
                let path = clause.split(';').next().unwrap_or_default().trim();
                let path = path.trim_matches('"');
                let path = path.strip_prefix('/').unwrap_or(path);
                (!path.is_empty()).then(|| path.to_string())
            })
            .collect()
    }
}

/// Values are decoded only once complete; a 72-byte wrap may split a
/// multi-byte character across lines.
fn flush_header(section: Option<&mut ManifestSection>, pending: Option<(String, Vec<u8>)>) {
    if let (Some(section), Some((name, value))) = (section, pending) {
        section
            .headers
            .insert(name, String::from_utf8_lossy(&value).into_owned());
    }
}

fn finish_section(
    manifest: &mut Manifest,
    in_main: &mut bool,
    section: Option<ManifestSection>,
    raw: Vec<u8>,
) {
    if *in_main {
        *in_main = false;
        let headers = section.map(|section| section.headers).unwrap_or_default();
        manifest.main = ManifestSection { headers, raw };
        return;
    }
    let Some(mut section) = section else {
        return;
    };
    let Some(name) = section.headers.get("Name").map(str::to_string) else {
        return;
    };
    section.raw = raw;
    manifest.sections.insert(name, section);
}

struct Line {
    start: usize,
    content_end: usize,
    end: usize,
}

fn split_lines(bytes: &[u8]) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'\r' => {
                let end = if bytes.get(index + 1) == Some(&b'\n') {
                    index + 2
                } else {
                    index + 1
                };
                lines.push(Line {
                    start,
                    content_end: index,
                    end,
                });
                start = end;
                index = end;
            }
            b'\n' => {
                lines.push(Line {
                    start,
                    content_end: index,
                    end: index + 1,
                });
                start = index + 1;
                index += 1;
            }
            _ => index += 1,
        }
    }
    if start < bytes.len() {
        lines.push(Line {
            start,
            content_end: bytes.len(),
            end: bytes.len(),
        });
    }
    lines
}

/// Split a header value on `delimiter`, ignoring delimiters inside double
/// quotes. Quotes are kept; empty clauses are dropped.
pub fn parse_delimited(value: &str, delimiter: char) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in value.chars() {
        if ch == '"' {
            quoted = !quoted;
            current.push(ch);
        } else if ch == delimiter && !quoted {
            push_clause(&mut clauses, &current);
            current.clear();
        } else {
            current.push(ch);
        }
    }
    push_clause(&mut clauses, &current);
    clauses
}

fn push_clause(clauses: &mut Vec<String>, clause: &str) {
    let trimmed = clause.trim();
    if !trimmed.is_empty() {
        clauses.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"Manifest-Version: 1.0\r\nBundle-SymbolicName: demo\r\nBundle-ClassPath: .,\r\n lib/x.jar;x=1, \"/lib/q,r.jar\"\r\n\r\nName: a/B.class\r\nSHA-256-Digest: abc=\r\n\r\nName: c.txt\r\nSHA-256-Digest: def=\r\n\r\n";

    #[test]
    fn headers_are_case_insensitive() {
        let manifest = Manifest::parse(SAMPLE);
        assert_eq!(manifest.main().get("bundle-symbolicname"), Some("demo"));
        assert_eq!(manifest.main().get("MANIFEST-VERSION"), Some("1.0"));
        let names: Vec<&str> = manifest.main().iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            ["Manifest-Version", "Bundle-SymbolicName", "Bundle-ClassPath"]
        );
    }

    #[test]
    fn continuation_lines_join_and_class_path_splits() {
        let manifest = Manifest::parse(SAMPLE);
        assert_eq!(manifest.class_path(), [".", "lib/x.jar", "lib/q,r.jar"]);
    }

    #[test]
    fn wrapped_multibyte_characters_survive_continuations() {
        let manifest = Manifest::parse(
            b"Bundle-Name: caf\xc3\r\n \xa9\r\n\r\nName: docs/r\xc3\r\n \xa9sum\xc3\xa9.txt\r\nSHA-256-Digest: abc=\r\n\r\n",
        );
        assert_eq!(manifest.main().get("Bundle-Name"), Some("café"));
        let section = manifest.section("docs/résumé.txt").expect("section");
        assert_eq!(section.headers.get("SHA-256-Digest"), Some("abc="));
    }

    #[test]
    fn entry_sections_keep_raw_bytes() {
        let manifest = Manifest::parse(SAMPLE);
        let section = manifest.section("a/B.class").expect("section");
        assert_eq!(section.headers.get("sha-256-digest"), Some("abc="));
        assert_eq!(section.raw, b"Name: a/B.class\r\nSHA-256-Digest: abc=\r\n\r\n");
        let names: Vec<&str> = manifest.sections().map(|(name, _)| name).collect();
        assert_eq!(names, ["a/B.class", "c.txt"]);
    }

    #[test]
    fn missing_class_path_is_empty() {
        let manifest = Manifest::parse(b"Manifest-Version: 1.0\n");
        assert!(manifest.class_path().is_empty());
        assert!(Manifest::parse(b"").main().is_empty());
    }

    #[test]
    fn delimited_values_respect_quotes() {
        assert_eq!(
            parse_delimited("a, \"b,c\" ,,d", ','),
            ["a", "\"b,c\"", "d"]
        );
    }
}
