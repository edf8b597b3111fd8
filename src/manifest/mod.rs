//! Manifest records and generations.
//!
//! A manifest is a plain-text file with one `path:hash:size` record per line.
//! Paths travel with forward slashes and are rewritten to the host separator
//! when parsed, so serialising an entry always yields the wire form again.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::str::FromStr;

use log::debug;
use thiserror::Error;

use crate::engine::models::PendingDownload;
use crate::util::strip_line_noise;

pub mod store;

const FIELD_SEPARATOR: char = ':';
const WIRE_SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty manifest line")]
    Empty,
    #[error("expected 3 fields separated by ':', found {0}")]
    FieldCount(usize),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("invalid size '{0}'")]
    InvalidSize(String),
    #[error("path '{0}' escapes the install directory")]
    UnsafePath(String),
    #[error("{0} contains a field separator or line break")]
    ReservedCharacter(&'static str),
}

/// One tracked file: where it lives, what it hashes to, and how large it is.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManifestEntry {
    relative_path: String,
    content_hash: String,
    size_bytes: u64,
}

impl ManifestEntry {
    pub fn new(
        relative_path: &str,
        content_hash: impl Into<String>,
        size_bytes: u64,
    ) -> Result<Self, ParseError> {
        if relative_path.is_empty() {
            return Err(ParseError::MissingField("path"));
        }
        let content_hash = content_hash.into();
        if content_hash.is_empty() {
            return Err(ParseError::MissingField("hash"));
        }
        if has_reserved_chars(relative_path) {
            return Err(ParseError::ReservedCharacter("path"));
        }
        if has_reserved_chars(&content_hash) {
            return Err(ParseError::ReservedCharacter("hash"));
        }
        if is_unsafe_path(relative_path) {
            return Err(ParseError::UnsafePath(relative_path.to_owned()));
        }
        Ok(Self {
            relative_path: to_host_separators(relative_path),
            content_hash,
            size_bytes,
        })
    }

    /// Parse a single manifest line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let cleaned = strip_line_noise(line);
        if cleaned.is_empty() {
            return Err(ParseError::Empty);
        }
        let fields: Vec<&str> = cleaned.split(FIELD_SEPARATOR).collect();
        let [path, hash, size] = fields.as_slice() else {
            return Err(ParseError::FieldCount(fields.len()));
        };
        let size = size
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidSize((*size).to_owned()))?;
        Self::new(path, *hash, size)
    }

    /// Serialise back to the `path:hash:size` wire form.
    pub fn serialize(&self) -> String {
        format!(
            "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}",
            self.wire_path(),
            self.content_hash,
            self.size_bytes
        )
    }

    /// Path using the host's separator.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Path using forward slashes, suitable for URLs and manifest files.
    pub fn wire_path(&self) -> String {
        self.relative_path.replace(MAIN_SEPARATOR, "/")
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn local_path(&self, base: &Path) -> PathBuf {
        base.join(&self.relative_path)
    }

    /// File name component, used for progress labels and executable detection.
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit(MAIN_SEPARATOR)
            .next()
            .unwrap_or(&self.relative_path)
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl FromStr for ManifestEntry {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Self::parse(line)
    }
}

fn to_host_separators(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c == WIRE_SEPARATOR || c == '\\' {
                MAIN_SEPARATOR
            } else {
                c
            }
        })
        .collect()
}

fn has_reserved_chars(field: &str) -> bool {
    field.contains([FIELD_SEPARATOR, '\r', '\n', '\0'])
}

fn is_unsafe_path(path: &str) -> bool {
    path.starts_with(['/', '\\']) || path.split(['/', '\\']).any(|part| part == "..")
}

/// Ordered list of tracked files. Order is significant for resuming bulk installs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Parse manifest text, skipping lines that are not valid entries.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .enumerate()
            .filter_map(|(index, line)| match ManifestEntry::parse(line) {
                Ok(entry) => Some(entry),
                Err(ParseError::Empty) => None,
                Err(err) => {
                    debug!("manifest: skipping line {}: {}", index + 1, err);
                    None
                }
            })
            .collect();
        Self { entries }
    }

    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|entry| format!("{}\n", entry.serialize()))
            .collect()
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ManifestEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, entry: &ManifestEntry) -> Option<usize> {
        self.entries.iter().position(|candidate| candidate == entry)
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(ManifestEntry::size_bytes).sum()
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a ManifestEntry;
    type IntoIter = std::slice::Iter<'a, ManifestEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Entries of `current` that are not in `previous`, in manifest order.
///
/// When `previous` tracked a different version of the same path, that old entry
/// is attached as a replacement hint so the stale file can be discarded instead
/// of being resumed into.
pub fn diff(previous: &Manifest, current: &Manifest) -> Vec<PendingDownload> {
    let unchanged: HashSet<&ManifestEntry> = previous.iter().collect();
    let by_path: HashMap<&str, &ManifestEntry> = previous
        .iter()
        .map(|entry| (entry.relative_path(), entry))
        .collect();

    current
        .iter()
        .filter(|entry| !unchanged.contains(entry))
        .map(|entry| PendingDownload {
            entry: entry.clone(),
            replaces: by_path.get(entry.relative_path()).map(|old| (*old).clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(line: &str) -> ManifestEntry {
        ManifestEntry::parse(line).expect("valid entry")
    }

    #[test]
    fn parses_well_formed_line() {
        let parsed = entry("dat/a.bin:abc123:100");
        assert_eq!(parsed.wire_path(), "dat/a.bin");
        assert_eq!(parsed.content_hash(), "abc123");
        assert_eq!(parsed.size_bytes(), 100);
        assert_eq!(parsed.file_name(), "a.bin");
    }

    #[test]
    fn serialisation_round_trips() {
        for line in [
            "dat/a.bin:abc123:100",
            "readme.txt:d41d8cd98f00b204e9800998ecf8427e:0",
            "bin/x86_64/game:ffff:18446744073709551615",
        ] {
            let parsed = entry(line);
            assert_eq!(parsed.serialize(), line);
            assert_eq!(ManifestEntry::parse(&parsed.serialize()), Ok(parsed));
        }
    }

    #[test]
    fn strips_line_noise_before_splitting() {
        let parsed = entry("dat/a.bin:abc123:100\r\n\0");
        assert_eq!(parsed.size_bytes(), 100);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(ManifestEntry::parse(""), Err(ParseError::Empty));
        assert_eq!(ManifestEntry::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(
            ManifestEntry::parse("dat/a.bin:abc123"),
            Err(ParseError::FieldCount(2))
        );
        assert_eq!(
            ManifestEntry::parse("dat/a.bin:abc:123:100"),
            Err(ParseError::FieldCount(4))
        );
        assert_eq!(
            ManifestEntry::parse("dat/a.bin:abc123:ten"),
            Err(ParseError::InvalidSize("ten".into()))
        );
        assert_eq!(
            ManifestEntry::parse("dat/a.bin:abc123:-1"),
            Err(ParseError::InvalidSize("-1".into()))
        );
        assert_eq!(
            ManifestEntry::parse(":abc123:1"),
            Err(ParseError::MissingField("path"))
        );
    }

    #[test]
    fn rejects_paths_outside_install_dir() {
        assert!(matches!(
            ManifestEntry::parse("../etc/passwd:abc:1"),
            Err(ParseError::UnsafePath(_))
        ));
        assert!(matches!(
            ManifestEntry::parse("/etc/passwd:abc:1"),
            Err(ParseError::UnsafePath(_))
        ));
        assert!(matches!(
            ManifestEntry::parse("dat\\..\\..\\x:abc:1"),
            Err(ParseError::UnsafePath(_))
        ));
    }

    #[test]
    fn constructor_rejects_fields_that_would_not_parse_back() {
        assert_eq!(
            ManifestEntry::new("dat/a.bin", "ab:cd", 4),
            Err(ParseError::ReservedCharacter("hash"))
        );
        assert_eq!(
            ManifestEntry::new("dat/a:b.bin", "abcd", 4),
            Err(ParseError::ReservedCharacter("path"))
        );
        assert_eq!(
            ManifestEntry::new("dat/a.bin\n", "abcd", 4),
            Err(ParseError::ReservedCharacter("path"))
        );
        assert_eq!(
            ManifestEntry::new("dat/a.bin", "ab\0cd", 4),
            Err(ParseError::ReservedCharacter("hash"))
        );

        let built = ManifestEntry::new("dat/a.bin", "abcd", 4).expect("valid");
        assert_eq!(ManifestEntry::parse(&built.serialize()), Ok(built));
    }

    #[test]
    fn backslashes_become_host_separators() {
        let parsed = entry("dat\\sub\\a.bin:abc:1");
        assert_eq!(parsed.wire_path(), "dat/sub/a.bin");
        assert_eq!(
            parsed.relative_path(),
            format!("dat{MAIN_SEPARATOR}sub{MAIN_SEPARATOR}a.bin")
        );
    }

    #[test]
    fn equality_covers_all_fields() {
        assert_eq!(entry("a:h:1"), entry("a:h:1"));
        assert_ne!(entry("a:h:1"), entry("a:h:2"));
        assert_ne!(entry("a:h:1"), entry("a:H:1"));
        assert_ne!(entry("a:h:1"), entry("b:h:1"));
    }

    #[test]
    fn manifest_skips_unparsable_lines_and_keeps_order() {
        let manifest = Manifest::parse("b.bin:h2:2\nnot a record\n\na.bin:h1:1\nc.bin:h3:x\n");
        let paths: Vec<String> = manifest.iter().map(ManifestEntry::wire_path).collect();
        assert_eq!(paths, vec!["b.bin", "a.bin"]);
        assert_eq!(manifest.total_bytes(), 3);
        assert_eq!(manifest.to_text(), "b.bin:h2:2\na.bin:h1:1\n");
    }

    #[test]
    fn diff_selects_new_and_changed_entries() {
        let a = entry("dat/a.bin:aaa:10");
        let b = entry("dat/b.bin:bbb:20");
        let b2 = entry("dat/b.bin:b22:21");
        let c = entry("dat/c.bin:ccc:30");
        let previous = Manifest::new(vec![a.clone(), b.clone()]);
        let current = Manifest::new(vec![a, b2.clone(), c.clone()]);

        let pending = diff(&previous, &current);
        assert_eq!(
            pending,
            vec![
                PendingDownload {
                    entry: b2,
                    replaces: Some(b),
                },
                PendingDownload {
                    entry: c,
                    replaces: None,
                },
            ]
        );
    }

    #[test]
    fn diff_against_empty_previous_takes_everything() {
        let current = Manifest::parse("a:h:1\nb:h:2\n");
        let pending = diff(&Manifest::default(), &current);
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|p| p.replaces.is_none()));
    }
}
