//! Manifest-driven install, update and verify for launcher and game content.

pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod integrity;
pub mod manifest;
pub mod networking;
pub mod storage;
pub mod updater;
pub mod util;

pub use config::{ConfigProvider, PatchConfig};
pub use engine::PatchEngine;
pub use engine::models::{Availability, FailureStage, Module, Operation, OperationReport};
pub use engine::state::{ProgressEvent, ProgressSink};
pub use error::{ConfigError, PatchError, PatchErrorKind, TransferError};
pub use manifest::{Manifest, ManifestEntry};
pub use networking::TransferProtocol;
