use std::cmp::Ordering;
use std::fmt;

/// Dotted numeric version such as `1.4.2`; missing components compare as zero.
#[derive(Clone, Debug)]
pub struct Version {
    parts: Vec<u32>,
}

impl Version {
    /// Parse a version string, tolerating a leading `v` and surrounding whitespace.
    ///
    /// # Errors
    /// Returns the normalised input when any component is not a number.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = normalize_version(raw);
        if normalized.is_empty() {
            return Err(normalized);
        }
        let parts = normalized
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| normalized.clone())?;
        Ok(Self { parts })
    }

    pub fn zero() -> Self {
        Self { parts: vec![0] }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let max_len = self.parts.len().max(other.parts.len());
        for i in 0..max_len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: Vec<String> = self.parts.iter().map(u32::to_string).collect();
        f.write_str(&text.join("."))
    }
}

/// Normalize version string by removing 'v' prefix and cleaning up.
fn normalize_version(version: &str) -> String {
    version.trim().trim_start_matches('v').to_owned()
}

/// True when `local` is older than `remote`.
pub fn is_outdated(local: &Version, remote: &Version) -> bool {
    local < remote
}
