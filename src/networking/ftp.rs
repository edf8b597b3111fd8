use std::io::{ErrorKind, Read, Write};
use std::net::ToSocketAddrs;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Url;
use suppaftp::FtpStream;
use suppaftp::types::FileType;

use super::{DownloadRequest, TransferMonitor, TransferProtocol, check_complete, open_destination};
use crate::config::PatchConfig;
use crate::error::TransferError;
use crate::util::strip_line_noise;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// FTP transfers over a fresh control connection per call; resumes with `REST`.
///
/// suppaftp's client is blocking, so every call runs on tokio's blocking pool.
#[derive(Clone, Debug)]
pub struct FtpTransfer {
    host: String,
    port: u16,
    base_path: String,
    credentials: Option<(String, String)>,
    probe_timeout: Duration,
    read_timeout: Duration,
    buffer_size: usize,
}

impl FtpTransfer {
    pub fn new(config: &PatchConfig) -> Result<Self, TransferError> {
        let invalid = || TransferError::InvalidAddress(config.remote_address.clone());
        let url = Url::parse(&config.remote_address).map_err(|_| invalid())?;
        if url.scheme() != "ftp" {
            return Err(invalid());
        }
        let host = url.host_str().ok_or_else(invalid)?.to_owned();
        let port = url.port_or_known_default().unwrap_or(21);
        let base_path = remote_path(&config.remote_address).unwrap_or("/").to_owned();
        Ok(Self {
            host,
            port,
            base_path,
            credentials: config
                .has_credentials()
                .then(|| (config.username.clone(), config.password.clone())),
            probe_timeout: config.probe_timeout(),
            read_timeout: READ_TIMEOUT,
            buffer_size: config.buffer_size,
        })
    }

    fn session(&self, anonymous: bool, timeout: Duration) -> Result<FtpStream, TransferError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TransferError::Connect(format!("{}: {e}", self.host)))?
            .next()
            .ok_or_else(|| TransferError::Connect(format!("{} did not resolve", self.host)))?;
        let mut ftp = FtpStream::connect_timeout(addr, timeout)
            .map_err(|e| TransferError::Connect(format!("{}:{}: {e}", self.host, self.port)))?;
        ftp.get_ref().set_read_timeout(Some(self.read_timeout))?;

        let (user, password) = match &self.credentials {
            Some((user, password)) if !anonymous => (user.as_str(), password.as_str()),
            _ => (ANONYMOUS_USER, ANONYMOUS_PASSWORD),
        };
        ftp.login(user, password)?;
        ftp.transfer_type(FileType::Binary)?;
        Ok(ftp)
    }

    fn probe_blocking(&self) -> Result<(), TransferError> {
        let mut ftp = self.session(false, self.probe_timeout)?;
        ftp.nlst(Some(self.base_path.as_str()))?;
        let _ = ftp.quit();
        Ok(())
    }

    fn exists_blocking(&self, path: &str) -> Result<(), TransferError> {
        let mut ftp = self.session(false, self.probe_timeout)?;
        ftp.size(path)?;
        let _ = ftp.quit();
        Ok(())
    }

    fn read_text_blocking(&self, path: &str, anonymous: bool) -> Result<String, TransferError> {
        let mut ftp = self.session(anonymous, CONNECT_TIMEOUT)?;
        let buffer = ftp.retr_as_buffer(path)?;
        let _ = ftp.quit();
        Ok(strip_line_noise(&String::from_utf8_lossy(
            &buffer.into_inner(),
        )))
    }

    fn download_blocking(
        &self,
        path: &str,
        request: &DownloadRequest,
        monitor: &TransferMonitor,
    ) -> Result<u64, TransferError> {
        if monitor.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let mut ftp = self.session(request.anonymous, CONNECT_TIMEOUT)?;

        let (mut file, mut start) = open_destination(&request.local_path, request.resume_offset)?;
        if start > 0
            && let Err(err) = ftp.resume_transfer(start as usize)
        {
            warn!("ftp: REST {} refused for {} ({}); downloading in full", start, path, err);
            (file, start) = open_destination(&request.local_path, 0)?;
        }
        debug!(
            "ftp: RETR {} -> {} from byte {}",
            path,
            request.local_path.display(),
            start
        );

        let mut stream = ftp.retr_as_stream(path)?;
        // The data connection is a separate socket; a stalled server must not hang the worker.
        stream.get_ref().set_read_timeout(Some(self.read_timeout))?;
        let mut buf = vec![0u8; self.buffer_size];
        let mut on_disk = start;
        let mut received = 0u64;
        let mut failure = None;

        loop {
            if monitor.is_cancelled() {
                failure = Some(TransferError::Cancelled);
                break;
            }
            let read = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    failure = Some(TransferError::Stream(err.to_string()));
                    break;
                }
            };
            if let Err(err) = file.write_all(&buf[..read]) {
                failure = Some(err.into());
                break;
            }
            on_disk += read as u64;
            received += read as u64;
            monitor.chunk_written(on_disk, request.total_size);
        }

        file.flush()?;
        match failure {
            Some(err) => {
                drop(stream);
                let _ = ftp.quit();
                Err(err)
            }
            None => {
                ftp.finalize_retr_stream(stream)?;
                let _ = ftp.quit();
                check_complete(on_disk, request.total_size)?;
                Ok(received)
            }
        }
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, TransferError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| TransferError::Stream(format!("ftp worker failed: {e}")))?
}

/// Path component of an `ftp://host[:port]/path` address, left undecoded.
fn remote_path(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("://")?;
    rest.find('/').map(|index| &rest[index..])
}

fn path_of(url: &str) -> Result<String, TransferError> {
    remote_path(url)
        .map(str::to_owned)
        .ok_or_else(|| TransferError::InvalidAddress(url.to_owned()))
}

#[async_trait]
impl TransferProtocol for FtpTransfer {
    async fn can_reach(&self) -> bool {
        let this = self.clone();
        match run_blocking(move || this.probe_blocking()).await {
            Ok(()) => true,
            Err(err) => {
                warn!("ftp: probe {}:{} failed: {}", self.host, self.port, err);
                false
            }
        }
    }

    async fn exists(&self, url: &str) -> bool {
        let Ok(path) = path_of(url) else {
            return false;
        };
        let this = self.clone();
        match run_blocking(move || this.exists_blocking(&path)).await {
            Ok(()) => true,
            Err(err) => {
                debug!("ftp: {} not available: {}", url, err);
                false
            }
        }
    }

    async fn read_text(&self, url: &str, anonymous: bool) -> Result<String, TransferError> {
        let path = path_of(url)?;
        let this = self.clone();
        run_blocking(move || this.read_text_blocking(&path, anonymous)).await
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        monitor: &TransferMonitor,
    ) -> Result<u64, TransferError> {
        let path = path_of(&request.url)?;
        let this = self.clone();
        let request = request.clone();
        let monitor = monitor.clone();
        run_blocking(move || this.download_blocking(&path, &request, &monitor)).await
    }
}
