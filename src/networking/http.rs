use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::header::{CONTENT_RANGE, RANGE, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{DownloadRequest, TransferMonitor, TransferProtocol, check_complete, open_destination};
use crate::config::PatchConfig;
use crate::error::TransferError;
use crate::util::strip_line_noise;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const AGENT: &str = concat!("launchpatch/", env!("CARGO_PKG_VERSION"));

/// HTTP(S) transfers; resumes with `Range` requests.
#[derive(Clone)]
pub struct HttpTransfer {
    client: Client,
    base_url: String,
    credentials: Option<(String, String)>,
    probe_timeout: Duration,
    buffer_size: usize,
}

impl HttpTransfer {
    pub fn new(config: &PatchConfig) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| TransferError::Connect(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.remote_address.trim_end_matches('/').to_owned(),
            credentials: config
                .has_credentials()
                .then(|| (config.username.clone(), config.password.clone())),
            probe_timeout: config.probe_timeout(),
            buffer_size: config.buffer_size,
        })
    }

    fn get(&self, url: &str, anonymous: bool) -> RequestBuilder {
        self.authorize(self.client.get(url), anonymous)
    }

    fn head(&self, url: &str) -> RequestBuilder {
        self.authorize(self.client.head(url), false)
            .timeout(self.probe_timeout)
    }

    fn authorize(&self, request: RequestBuilder, anonymous: bool) -> RequestBuilder {
        let request = request.header(USER_AGENT, AGENT);
        match &self.credentials {
            Some((user, password)) if !anonymous => request.basic_auth(user, Some(password)),
            _ => request,
        }
    }

    async fn write_body(
        &self,
        response: Response,
        file: std::fs::File,
        start: u64,
        request: &DownloadRequest,
        monitor: &TransferMonitor,
    ) -> Result<u64, TransferError> {
        let mut file = BufWriter::with_capacity(self.buffer_size, tokio::fs::File::from_std(file));
        let mut stream = response.bytes_stream();
        let mut on_disk = start;
        let mut received = 0u64;
        let mut failure = None;

        while let Some(chunk) = stream.next().await {
            if monitor.is_cancelled() {
                failure = Some(TransferError::Cancelled);
                break;
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    failure = Some(TransferError::from(err));
                    break;
                }
            };
            if let Err(err) = file.write_all(&chunk).await {
                failure = Some(err.into());
                break;
            }
            on_disk += chunk.len() as u64;
            received += chunk.len() as u64;
            monitor.chunk_written(on_disk, request.total_size);
        }

        // Keep whatever arrived so the next attempt can resume from it.
        file.flush().await?;
        if let Some(err) = failure {
            return Err(err);
        }
        check_complete(on_disk, request.total_size)?;
        Ok(received)
    }
}

/// First byte position of a `Content-Range: bytes start-end/total` header.
fn range_start(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .trim()
        .strip_prefix("bytes ")?
        .split_once('-')?
        .0
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl TransferProtocol for HttpTransfer {
    async fn can_reach(&self) -> bool {
        match self.head(&self.base_url).send().await {
            Ok(resp) => {
                debug!("http: probe {} answered {}", self.base_url, resp.status());
                true
            }
            Err(err) => {
                warn!("http: probe {} failed: {}", self.base_url, err);
                false
            }
        }
    }

    async fn exists(&self, url: &str) -> bool {
        match self.head(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                warn!("http: HEAD {} failed: {}", url, err);
                false
            }
        }
    }

    async fn read_text(&self, url: &str, anonymous: bool) -> Result<String, TransferError> {
        let response = self.get(url, anonymous).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        Ok(strip_line_noise(&body))
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        monitor: &TransferMonitor,
    ) -> Result<u64, TransferError> {
        let mut offset = request.resume_offset;
        loop {
            if monitor.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let mut builder = self.get(&request.url, request.anonymous);
            if offset > 0 {
                builder = builder.header(RANGE, format!("bytes={offset}-"));
            }
            let response = builder.send().await?;
            let status = response.status();

            if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
                warn!(
                    "http: {} rejected range at {}; downloading in full",
                    request.url, offset
                );
                offset = 0;
                continue;
            }
            if !status.is_success() {
                return Err(TransferError::Status {
                    url: request.url.clone(),
                    status: status.as_u16(),
                });
            }
            if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
                warn!(
                    "http: {} ignored range request; downloading in full",
                    request.url
                );
                offset = 0;
            }
            if offset > 0 && range_start(&response) != Some(offset) {
                warn!(
                    "http: {} answered a range not starting at {}; downloading in full",
                    request.url, offset
                );
                offset = 0;
                continue;
            }

            let (file, start) = open_destination(&request.local_path, offset)?;
            if start != offset {
                // The local file changed under us; ask again from the start.
                offset = 0;
                continue;
            }
            debug!(
                "http: GET {} -> {} from byte {}",
                request.url,
                request.local_path.display(),
                start
            );
            return self.write_body(response, file, start, request, monitor).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const BODY: &[u8] = b"0123456789";

    #[derive(Clone, Copy)]
    enum Ranges {
        Honour,
        Ignore,
        Reject,
        /// Answer 206 but always from byte zero.
        Misaligned,
    }

    /// Serve `BODY` once per connection, treating `Range` according to `ranges`.
    async fn serve(ranges: Ranges) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(Ok((mut socket, _))) =
                tokio::time::timeout(Duration::from_millis(500), listener.accept()).await
            {
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.expect("read");
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&raw).to_lowercase();
                let range = head
                    .lines()
                    .find_map(|line| line.strip_prefix("range: bytes="))
                    .and_then(|value| value.trim_end_matches('-').parse::<usize>().ok());
                seen.push(head.lines().next().unwrap_or_default().to_owned());

                let last = BODY.len() - 1;
                let (status, extra, body) = match (range, ranges) {
                    (Some(start), Ranges::Honour) => (
                        "206 Partial Content",
                        format!("content-range: bytes {start}-{last}/{}\r\n", BODY.len()),
                        &BODY[start..],
                    ),
                    (Some(_), Ranges::Reject) => {
                        ("416 Range Not Satisfiable", String::new(), &BODY[..0])
                    }
                    (Some(_), Ranges::Misaligned) => (
                        "206 Partial Content",
                        format!("content-range: bytes 0-{last}/{}\r\n", BODY.len()),
                        BODY,
                    ),
                    _ => ("200 OK", String::new(), BODY),
                };
                let is_head = head.starts_with("head");
                let reply = format!(
                    "HTTP/1.1 {status}\r\n{extra}content-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.expect("write head");
                if !is_head {
                    socket.write_all(body).await.expect("write body");
                }
                socket.shutdown().await.ok();
            }
            seen
        });
        (format!("http://{addr}"), handle)
    }

    fn transfer(base: &str) -> HttpTransfer {
        HttpTransfer::new(&PatchConfig::new(base)).expect("client")
    }

    fn request(url: String, local_path: std::path::PathBuf, offset: u64) -> DownloadRequest {
        DownloadRequest {
            url,
            local_path,
            total_size: Some(BODY.len() as u64),
            resume_offset: offset,
            anonymous: true,
        }
    }

    #[tokio::test]
    async fn resumes_with_range_request() {
        let (base, server) = serve(Ranges::Honour).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        std::fs::write(&path, &BODY[..4]).expect("seed");

        let monitor = TransferMonitor::silent(Arc::new(AtomicBool::new(false)));
        let received = transfer(&base)
            .download(&request(format!("{base}/a.bin"), path.clone(), 4), &monitor)
            .await
            .expect("download");

        assert_eq!(received, 6);
        assert_eq!(std::fs::read(&path).expect("read"), BODY);
        drop(server);
    }

    #[tokio::test]
    async fn falls_back_to_full_download_when_range_ignored() {
        let (base, server) = serve(Ranges::Ignore).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        std::fs::write(&path, &BODY[..4]).expect("seed");

        let monitor = TransferMonitor::silent(Arc::new(AtomicBool::new(false)));
        let received = transfer(&base)
            .download(&request(format!("{base}/a.bin"), path.clone(), 4), &monitor)
            .await
            .expect("download");

        assert_eq!(received, BODY.len() as u64);
        assert_eq!(std::fs::read(&path).expect("read"), BODY);
        drop(server);
    }

    #[tokio::test]
    async fn restarts_in_full_when_range_is_rejected() {
        let (base, server) = serve(Ranges::Reject).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        std::fs::write(&path, &BODY[..4]).expect("seed");

        let monitor = TransferMonitor::silent(Arc::new(AtomicBool::new(false)));
        let received = transfer(&base)
            .download(&request(format!("{base}/a.bin"), path.clone(), 4), &monitor)
            .await
            .expect("download");

        assert_eq!(received, BODY.len() as u64);
        assert_eq!(std::fs::read(&path).expect("read"), BODY);
        let requests = server.await.expect("server");
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn restarts_in_full_when_content_range_is_misaligned() {
        let (base, server) = serve(Ranges::Misaligned).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        std::fs::write(&path, &BODY[..4]).expect("seed");

        let monitor = TransferMonitor::silent(Arc::new(AtomicBool::new(false)));
        let received = transfer(&base)
            .download(&request(format!("{base}/a.bin"), path.clone(), 4), &monitor)
            .await
            .expect("download");

        assert_eq!(received, BODY.len() as u64);
        assert_eq!(std::fs::read(&path).expect("read"), BODY);
        let requests = server.await.expect("server");
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn reads_text_without_line_noise() {
        let (base, server) = serve(Ranges::Ignore).await;
        let text = transfer(&base)
            .read_text(&format!("{base}/version.txt"), true)
            .await
            .expect("text");
        assert_eq!(text, "0123456789");
        assert!(transfer(&base).exists(&format!("{base}/.provides")).await);
        let requests = server.await.expect("server");
        assert!(requests[0].starts_with("get /version.txt"));
        assert!(requests[1].starts_with("head /.provides"));
    }

    #[tokio::test]
    async fn cancelled_download_stops_before_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let monitor = TransferMonitor::silent(Arc::new(AtomicBool::new(true)));
        let result = transfer("http://127.0.0.1:9")
            .download(
                &request("http://127.0.0.1:9/a.bin".into(), dir.path().join("a.bin"), 0),
                &monitor,
            )
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}
