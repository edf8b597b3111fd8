use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::fs;

use crate::manifest::ManifestEntry;
use crate::util::strip_line_noise;

/// Persisted state of a bulk operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkerState {
    Idle,
    InProgress(ManifestEntry),
}

/// Single-line tagfile naming the entry currently being transferred.
///
/// The file is emptied rather than removed when nothing is in flight, so its
/// presence also records that the module has been installed at least once.
#[derive(Clone, Debug)]
pub struct ResumeMarker {
    path: PathBuf,
}

impl ResumeMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty marker if none exists yet.
    pub async fn ensure(&self) -> io::Result<()> {
        if fs::metadata(&self.path).await.is_ok() {
            return Ok(());
        }
        self.write_line("").await
    }

    pub async fn read(&self) -> io::Result<MarkerState> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(MarkerState::Idle),
            Err(err) => return Err(err),
        };
        let line = strip_line_noise(&String::from_utf8_lossy(&bytes));
        if line.trim().is_empty() {
            return Ok(MarkerState::Idle);
        }
        match ManifestEntry::parse(&line) {
            Ok(entry) => Ok(MarkerState::InProgress(entry)),
            Err(err) => {
                warn!(
                    "resume marker: ignoring unreadable marker {} ({})",
                    self.path.display(),
                    err
                );
                Ok(MarkerState::Idle)
            }
        }
    }

    pub async fn begin(&self, entry: &ManifestEntry) -> io::Result<()> {
        debug!("resume marker: in progress {}", entry.wire_path());
        self.write_line(&entry.serialize()).await
    }

    pub async fn clear(&self) -> io::Result<()> {
        self.write_line("").await
    }

    async fn write_line(&self, line: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, line.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walks_through_idle_and_in_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = ResumeMarker::new(dir.path().join("state").join("game.tag"));

        assert_eq!(marker.read().await.expect("read"), MarkerState::Idle);
        marker.ensure().await.expect("ensure");
        assert!(marker.path().exists());
        assert_eq!(marker.read().await.expect("read"), MarkerState::Idle);

        let entry = ManifestEntry::parse("dat/a.bin:abc123:100").expect("entry");
        marker.begin(&entry).await.expect("begin");
        assert_eq!(
            marker.read().await.expect("read"),
            MarkerState::InProgress(entry)
        );

        marker.clear().await.expect("clear");
        assert_eq!(marker.read().await.expect("read"), MarkerState::Idle);
        assert_eq!(std::fs::read(marker.path()).expect("raw").len(), 0);
    }

    #[tokio::test]
    async fn ensure_keeps_existing_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = ResumeMarker::new(dir.path().join("launcher.tag"));
        let entry = ManifestEntry::parse("bin/l.exe:ff:1").expect("entry");
        marker.begin(&entry).await.expect("begin");
        marker.ensure().await.expect("ensure");
        assert_eq!(
            marker.read().await.expect("read"),
            MarkerState::InProgress(entry)
        );
    }

    #[tokio::test]
    async fn garbage_marker_reads_as_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = ResumeMarker::new(dir.path().join("game.tag"));
        std::fs::write(marker.path(), "not-an-entry").expect("write");
        assert_eq!(marker.read().await.expect("read"), MarkerState::Idle);
    }
}
