use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::manifest::ManifestEntry;

/// Which installable unit an operation applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Module {
    Launcher,
    Game,
}

impl Module {
    pub const ALL: [Module; 2] = [Module::Launcher, Module::Game];

    pub fn label(self) -> &'static str {
        match self {
            Module::Launcher => "Launcher",
            Module::Game => "Game",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Module {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("launcher") {
            Ok(Module::Launcher)
        } else if value.eq_ignore_ascii_case("game") {
            Ok(Module::Game)
        } else {
            Err(format!("unknown module '{value}' (expected launcher or game)"))
        }
    }
}

/// Bulk operations the engine drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Install,
    Update,
    Verify,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Install => "install",
            Operation::Update => "update",
            Operation::Verify => "verify",
        })
    }
}

/// Where in a workflow a failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureStage {
    Changelog,
    ManifestRefresh,
    Download,
    Verify,
    VersionCheck,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureStage::Changelog => "changelog fetch",
            FailureStage::ManifestRefresh => "manifest refresh",
            FailureStage::Download => "download",
            FailureStage::Verify => "verify",
            FailureStage::VersionCheck => "version check",
        })
    }
}

/// An entry scheduled for download, optionally replacing an older entry at the same path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingDownload {
    pub entry: ManifestEntry,
    pub replaces: Option<ManifestEntry>,
}

impl PendingDownload {
    pub fn fresh(entry: ManifestEntry) -> Self {
        Self {
            entry,
            replaces: None,
        }
    }
}

/// What Download-One did with a single entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    /// The local copy already matched the manifest.
    Skipped,
    /// Bytes were transferred, starting at `resumed_from`.
    Downloaded { bytes: u64, resumed_from: u64 },
}

/// Result of checking whether a module can be patched right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    Ready,
    Unreachable,
    PlatformUnsupported,
}

/// Summary of a successful bulk operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationReport {
    pub module: Module,
    pub operation: Operation,
    pub downloaded: usize,
    pub skipped: usize,
    pub repaired: usize,
    pub bytes: u64,
}

impl OperationReport {
    pub fn new(module: Module, operation: Operation) -> Self {
        Self {
            module,
            operation,
            downloaded: 0,
            skipped: 0,
            repaired: 0,
            bytes: 0,
        }
    }

    pub fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Downloaded { bytes, .. } => {
                self.downloaded += 1;
                self.bytes += bytes;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_names_case_insensitively() {
        assert_eq!("game".parse::<Module>(), Ok(Module::Game));
        assert_eq!("Launcher".parse::<Module>(), Ok(Module::Launcher));
        assert!("client".parse::<Module>().is_err());
    }

    #[test]
    fn report_counts_outcomes() {
        let mut report = OperationReport::new(Module::Game, Operation::Update);
        report.record(FileOutcome::Skipped);
        report.record(FileOutcome::Downloaded {
            bytes: 40,
            resumed_from: 10,
        });
        report.record(FileOutcome::Downloaded {
            bytes: 5,
            resumed_from: 0,
        });
        assert_eq!(report.skipped, 1);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.bytes, 45);
    }
}
