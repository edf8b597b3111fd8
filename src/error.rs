use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::models::{FailureStage, Module};

/// Failures raised by a transfer protocol implementation.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid remote address '{0}'")]
    InvalidAddress(String),
    #[error("unable to reach server: {0}")]
    Connect(String),
    #[error("server answered {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("download incomplete: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error("FTP error: {0}")]
    Ftp(String),
    #[error("local I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Interrupted or short transfers are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Stream(_) | TransferError::Timeout(_) | TransferError::Incomplete { .. }
        )
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_builder() {
            TransferError::Connect(err.to_string())
        } else if let Some(status) = err.status() {
            TransferError::Status {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                status: status.as_u16(),
            }
        } else {
            TransferError::Stream(err.to_string())
        }
    }
}

impl From<suppaftp::FtpError> for TransferError {
    fn from(err: suppaftp::FtpError) -> Self {
        match err {
            suppaftp::FtpError::ConnectionError(io) => TransferError::Stream(io.to_string()),
            other => TransferError::Ftp(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PatchErrorKind {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("local I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{} still damaged after {attempts} attempt(s)", path.display())]
    Integrity { path: PathBuf, attempts: u32 },
    #[error("unparsable version '{0}'")]
    VersionParse(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Structured failure reported to the caller: which module, which stage, and why.
#[derive(Debug, Error)]
#[error("{module} {stage} failed: {kind}")]
pub struct PatchError {
    pub module: Module,
    pub stage: FailureStage,
    #[source]
    pub kind: PatchErrorKind,
}

impl PatchError {
    pub fn new(module: Module, stage: FailureStage, kind: impl Into<PatchErrorKind>) -> Self {
        let kind = match kind.into() {
            PatchErrorKind::Transfer(TransferError::Cancelled) => PatchErrorKind::Cancelled,
            other => other,
        };
        Self {
            module,
            stage,
            kind,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, PatchErrorKind::Cancelled)
    }

    pub fn is_transient(&self) -> bool {
        matches!(&self.kind, PatchErrorKind::Transfer(err) if err.is_transient())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration key {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("unable to read config: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
