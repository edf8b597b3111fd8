use std::fs;
use std::io::{self, Read};
use std::path::Path;

use log::{debug, warn};
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::manifest::ManifestEntry;

const READ_BUFFER: usize = 64 * 1024;

/// Digest family, inferred from the length of the expected hex string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl HashAlgorithm {
    pub fn for_digest(hex: &str) -> Self {
        if hex.trim().len() == 64 {
            HashAlgorithm::Sha256
        } else {
            HashAlgorithm::Md5
        }
    }
}

/// Hex digest of a whole file.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    match algorithm {
        HashAlgorithm::Md5 => digest_file::<Md5>(path),
        HashAlgorithm::Sha256 => digest_file::<Sha256>(path),
    }
}

fn digest_file<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

/// Whether the file at `path` hashes to `expected`, compared case-insensitively.
pub fn digest_matches(path: &Path, expected: &str) -> io::Result<bool> {
    let expected = expected.trim();
    let actual = hash_file(path, HashAlgorithm::for_digest(expected))?;
    Ok(actual.eq_ignore_ascii_case(expected))
}

/// Full-file check of a local copy against its manifest entry.
pub fn is_intact(path: &Path, entry: &ManifestEntry) -> bool {
    let size = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return false,
    };
    if size != entry.size_bytes() {
        debug!(
            "integrity: {} has {} bytes, expected {}",
            path.display(),
            size,
            entry.size_bytes()
        );
        return false;
    }
    match digest_matches(path, entry.content_hash()) {
        Ok(matches) => {
            if !matches {
                debug!("integrity: {} hash mismatch", path.display());
            }
            matches
        }
        Err(err) => {
            warn!("integrity: unable to hash {}: {}", path.display(), err);
            false
        }
    }
}
