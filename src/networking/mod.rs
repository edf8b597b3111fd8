//! Transfer protocol abstraction.
//!
//! The engine only ever talks to a [`TransferProtocol`]; the FTP and HTTP
//! variants are the only places that know about command verbs or range headers.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use log::warn;

use crate::config::PatchConfig;
use crate::error::TransferError;
use crate::util::cancel_requested;

pub mod ftp;
pub mod http;

pub use ftp::FtpTransfer;
pub use http::HttpTransfer;

/// One remote file to fetch into a local path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub local_path: PathBuf,
    /// Expected final size, when known. Used for progress and completeness checks.
    pub total_size: Option<u64>,
    /// Append starting at this byte instead of downloading from scratch.
    pub resume_offset: u64,
    pub anonymous: bool,
}

/// Chunk callback plus cancellation flag handed to a running transfer.
#[derive(Clone)]
pub struct TransferMonitor {
    on_chunk: Arc<dyn Fn(u64, Option<u64>) + Send + Sync>,
    cancel: Arc<AtomicBool>,
}

impl TransferMonitor {
    pub fn new<F>(cancel: Arc<AtomicBool>, on_chunk: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        Self {
            on_chunk: Arc::new(on_chunk),
            cancel,
        }
    }

    pub fn silent(cancel: Arc<AtomicBool>) -> Self {
        Self::new(cancel, |_, _| {})
    }

    /// Report the file's size on disk after a chunk was written.
    pub fn chunk_written(&self, on_disk: u64, total: Option<u64>) {
        (self.on_chunk)(on_disk, total);
    }

    pub fn is_cancelled(&self) -> bool {
        cancel_requested(&self.cancel)
    }
}

#[async_trait]
pub trait TransferProtocol: Send + Sync {
    /// Short-timeout connectivity probe; never used inside a download loop.
    async fn can_reach(&self) -> bool;

    async fn exists(&self, url: &str) -> bool;

    /// Fetch a small remote file as text with line noise removed.
    async fn read_text(&self, url: &str, anonymous: bool) -> Result<String, TransferError>;

    /// Transfer a remote file to disk, returning the number of bytes received.
    async fn download(
        &self,
        request: &DownloadRequest,
        monitor: &TransferMonitor,
    ) -> Result<u64, TransferError>;
}

/// Pick the protocol variant from the configured address scheme.
pub fn connect(config: &PatchConfig) -> Result<Arc<dyn TransferProtocol>, TransferError> {
    let scheme = config
        .remote_address
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("ftp") => Ok(Arc::new(FtpTransfer::new(config)?)),
        Some("http" | "https") => Ok(Arc::new(HttpTransfer::new(config)?)),
        _ => Err(TransferError::InvalidAddress(config.remote_address.clone())),
    }
}

/// Open the destination for writing at `offset`.
///
/// Appends when the file on disk is exactly `offset` bytes long; otherwise the
/// file is truncated and the returned start offset is zero.
pub(crate) fn open_destination(path: &Path, offset: u64) -> io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if offset > 0 {
        let on_disk = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        if on_disk == offset {
            let file = OpenOptions::new().append(true).open(path)?;
            return Ok((file, offset));
        }
        warn!(
            "transfer: {} is {} bytes, cannot resume at {}; starting over",
            path.display(),
            on_disk,
            offset
        );
    }
    Ok((File::create(path)?, 0))
}

pub(crate) fn check_complete(on_disk: u64, expected: Option<u64>) -> Result<(), TransferError> {
    match expected {
        Some(expected) if on_disk != expected => Err(TransferError::Incomplete {
            received: on_disk,
            expected,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    #[test]
    fn appends_when_offset_matches_file_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("a.bin");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, b"abcd").expect("seed");

        let (mut file, start) = open_destination(&path, 4).expect("open");
        assert_eq!(start, 4);
        file.write_all(b"ef").expect("append");
        drop(file);
        assert_eq!(fs::read(&path).expect("read"), b"abcdef");
    }

    #[test]
    fn truncates_when_offset_disagrees_with_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        fs::write(&path, b"abcd").expect("seed");

        let (_file, start) = open_destination(&path, 2).expect("open");
        assert_eq!(start, 0);
        assert_eq!(fs::metadata(&path).expect("meta").len(), 0);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x").join("y").join("z.bin");
        let (_file, start) = open_destination(&path, 0).expect("open");
        assert_eq!(start, 0);
        assert!(path.exists());
    }

    #[test]
    fn completeness_requires_exact_size() {
        assert!(check_complete(10, Some(10)).is_ok());
        assert!(check_complete(10, None).is_ok());
        assert!(matches!(
            check_complete(9, Some(10)),
            Err(TransferError::Incomplete {
                received: 9,
                expected: 10
            })
        ));
    }

    #[test]
    fn monitor_forwards_chunks_and_cancel() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = Arc::new(AtomicBool::new(false));
        let sink = seen.clone();
        let monitor = TransferMonitor::new(cancel.clone(), move |done, total| {
            sink.lock().expect("lock").push((done, total));
        });
        monitor.chunk_written(4, Some(8));
        assert!(!monitor.is_cancelled());
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(monitor.is_cancelled());
        assert_eq!(*seen.lock().expect("lock"), vec![(4, Some(8))]);
    }

    #[test]
    fn connect_rejects_unknown_schemes() {
        let config = PatchConfig::new("gopher://old.example.com");
        assert!(matches!(
            connect(&config),
            Err(TransferError::InvalidAddress(_))
        ));
        assert!(connect(&PatchConfig::new("https://cdn.example.com")).is_ok());
        assert!(connect(&PatchConfig::new("ftp://files.example.com")).is_ok());
    }
}
