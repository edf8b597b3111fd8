use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::fs;

use crate::config::PatchConfig;
use crate::engine::models::{
    Availability, FailureStage, FileOutcome, Module, Operation, OperationReport, PendingDownload,
};
use crate::engine::state::{ProgressEvent, ProgressSink};
use crate::error::{PatchError, PatchErrorKind, TransferError};
use crate::integrity;
use crate::manifest::store::{Generation, ManifestStore};
use crate::manifest::{self, Manifest, ManifestEntry};
use crate::networking::{self, DownloadRequest, TransferMonitor, TransferProtocol};
use crate::storage::MarkerState;
use crate::updater::{self, Version};
use crate::util::{format_speed, progress_percent, strip_line_noise};

pub mod models;
pub mod state;


/// File name suffixes that get the executable bit on POSIX hosts.
const EXECUTABLE_SUFFIXES: [&str; 4] = [".sh", ".x86", ".x86_64", ".AppImage"];

/// Drives install, update and verify for one module at a time.
///
/// Entries are processed strictly in manifest order, one transfer at a time.
/// Callers must not run two bulk operations against the same module at once.
pub struct PatchEngine {
    protocol: Arc<dyn TransferProtocol>,
    store: ManifestStore,
    config: PatchConfig,
    progress: Arc<dyn ProgressSink>,
    cancel_flag: Arc<AtomicBool>,
}

impl PatchEngine {
    pub fn new(
        protocol: Arc<dyn TransferProtocol>,
        store: ManifestStore,
        config: PatchConfig,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            protocol,
            store,
            config,
            progress,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire up the protocol variant and manifest store named by `config`.
    pub fn from_config(
        config: PatchConfig,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, TransferError> {
        let protocol = networking::connect(&config)?;
        let store = ManifestStore::new(&config);
        Ok(Self::new(protocol, store, config, progress))
    }

    /// Raising this flag aborts the running operation between chunks or files.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    /// Up-front "can we patch at all" check.
    pub async fn check_availability(&self, module: Module) -> Availability {
        if !self.protocol.can_reach().await {
            warn!("availability: server unreachable for {}", module);
            return Availability::Unreachable;
        }
        if let Some(url) = self.store.provides_url(module)
            && !self.protocol.exists(&url).await
        {
            warn!(
                "availability: no {} build published for {}",
                module, self.config.system_target
            );
            return Availability::PlatformUnsupported;
        }
        Availability::Ready
    }

    pub async fn changelog(&self) -> Result<String, PatchError> {
        self.protocol
            .read_text(&self.store.changelog_url(), true)
            .await
            .map_err(|e| PatchError::new(Module::Launcher, FailureStage::Changelog, e))
    }

    /// Compare the published version file with the installed copy.
    ///
    /// An unparsable remote version is an error rather than a silent "up to date";
    /// a missing or unparsable local version counts as never installed.
    pub async fn is_module_outdated(&self, module: Module) -> Result<bool, PatchError> {
        let stage = FailureStage::VersionCheck;
        let remote_raw = self
            .protocol
            .read_text(&self.store.version_url(module), true)
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;
        let remote = Version::parse(&remote_raw)
            .map_err(|raw| PatchError::new(module, stage, PatchErrorKind::VersionParse(raw)))?;

        let local_path = self.store.local_version_path(module);
        let local = match fs::read_to_string(&local_path).await {
            Ok(text) => Version::parse(&strip_line_noise(&text)).unwrap_or_else(|raw| {
                warn!(
                    "version check: local {} version '{}' unreadable; assuming not installed",
                    module, raw
                );
                Version::zero()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Version::zero(),
            Err(err) => return Err(PatchError::new(module, stage, err)),
        };
        let outdated = updater::is_outdated(&local, &remote);
        info!(
            "version check: {} local {} remote {} outdated={}",
            module, local, remote, outdated
        );
        Ok(outdated)
    }

    /// Fetch the manifest, download every entry, then verify the result.
    pub async fn install(&self, module: Module) -> Result<OperationReport, PatchError> {
        self.reset_cancel_flag();
        info!("install: starting {}", module);
        let result = self.run_install(module).await;
        self.finish(module, Operation::Install, &result);
        result
    }

    /// Download only entries that changed since the previous manifest generation.
    pub async fn update(&self, module: Module) -> Result<OperationReport, PatchError> {
        self.reset_cancel_flag();
        info!("update: starting {}", module);
        let result = self.run_update(module).await;
        self.finish(module, Operation::Update, &result);
        result
    }

    /// Check every file of the current manifest and redownload broken ones.
    pub async fn verify(&self, module: Module) -> Result<OperationReport, PatchError> {
        self.reset_cancel_flag();
        info!("verify: starting {}", module);
        let result = self.run_verify(module).await;
        self.finish(module, Operation::Verify, &result);
        result
    }

    async fn run_install(&self, module: Module) -> Result<OperationReport, PatchError> {
        let stage = FailureStage::Download;
        let marker = self.store.marker(module);
        self.store
            .ensure_dirs(module)
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;
        marker
            .ensure()
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;

        let manifest = self.refresh_manifest(module).await?;
        info!(
            "install: {} manifest lists {} files ({} bytes)",
            module,
            manifest.len(),
            manifest.total_bytes()
        );
        let resume_from = match marker
            .read()
            .await
            .map_err(|e| PatchError::new(module, stage, e))?
        {
            MarkerState::InProgress(entry) => manifest.position(&entry).unwrap_or(0),
            MarkerState::Idle => 0,
        };
        if resume_from > 0 {
            info!(
                "install: resuming {} at entry {} of {}",
                module,
                resume_from + 1,
                manifest.len()
            );
        }

        self.emit(ProgressEvent::OperationStarted {
            module,
            operation: Operation::Install,
            total_files: manifest.len(),
        });
        let mut report = OperationReport::new(module, Operation::Install);
        for (index, entry) in manifest.iter().enumerate().skip(resume_from) {
            self.ensure_not_cancelled(module, stage)?;
            self.announce(module, entry, index, manifest.len());
            let pending = PendingDownload::fresh(entry.clone());
            let outcome = self.fetch_with_retries(module, &pending, false, stage).await?;
            report.record(outcome);
        }
        marker
            .clear()
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;

        let verified = self.verify_manifest(module, &manifest).await?;
        report.repaired = verified.repaired;
        report.bytes += verified.bytes;
        Ok(report)
    }

    async fn run_update(&self, module: Module) -> Result<OperationReport, PatchError> {
        let stage = FailureStage::Download;
        self.store
            .ensure_dirs(module)
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;
        self.store
            .marker(module)
            .ensure()
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;

        let current = self.refresh_manifest(module).await?;
        let previous = self
            .store
            .load_previous(module)
            .await
            .map_err(|e| PatchError::new(module, FailureStage::ManifestRefresh, e))?;
        let pending = manifest::diff(&previous, &current);
        info!(
            "update: {} of {} {} entries require update",
            pending.len(),
            current.len(),
            module
        );

        self.emit(ProgressEvent::OperationStarted {
            module,
            operation: Operation::Update,
            total_files: pending.len(),
        });
        let mut report = OperationReport::new(module, Operation::Update);
        for (index, item) in pending.iter().enumerate() {
            self.ensure_not_cancelled(module, stage)?;
            self.announce(module, &item.entry, index, pending.len());
            let outcome = self.fetch_with_retries(module, item, true, stage).await?;
            report.record(outcome);
        }
        Ok(report)
    }

    async fn run_verify(&self, module: Module) -> Result<OperationReport, PatchError> {
        let loaded = self
            .store
            .load(module, Generation::Current)
            .await
            .map_err(|e| PatchError::new(module, FailureStage::Verify, e))?;
        let manifest = match loaded {
            Some(manifest) => manifest,
            None => {
                info!("verify: no local {} manifest; refreshing first", module);
                self.refresh_manifest(module).await?
            }
        };
        self.verify_manifest(module, &manifest).await
    }

    /// Hash every entry, then repair the broken ones in manifest order.
    async fn verify_manifest(
        &self,
        module: Module,
        manifest: &Manifest,
    ) -> Result<OperationReport, PatchError> {
        let stage = FailureStage::Verify;
        let base = self.store.local_dir(module);
        self.emit(ProgressEvent::OperationStarted {
            module,
            operation: Operation::Verify,
            total_files: manifest.len(),
        });

        let mut broken = Vec::new();
        for entry in manifest {
            self.ensure_not_cancelled(module, stage)?;
            if !integrity::is_intact(&entry.local_path(base), entry) {
                debug!("verify: {} is broken", entry.wire_path());
                self.emit(ProgressEvent::FileBroken {
                    module,
                    file: entry.wire_path(),
                });
                broken.push(entry);
            }
        }
        info!(
            "verify: {} of {} {} files need repair",
            broken.len(),
            manifest.len(),
            module
        );

        let mut report = OperationReport::new(module, Operation::Verify);
        report.skipped = manifest.len() - broken.len();
        for (index, entry) in broken.iter().enumerate() {
            self.ensure_not_cancelled(module, stage)?;
            self.announce(module, entry, index, broken.len());
            let pending = PendingDownload::fresh((*entry).clone());
            match self.fetch_with_retries(module, &pending, true, stage).await? {
                FileOutcome::Downloaded { bytes, .. } => {
                    report.bytes += bytes;
                    report.repaired += 1;
                }
                FileOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// Make sure the local manifest matches the server's, then load it.
    pub async fn refresh_manifest(&self, module: Module) -> Result<Manifest, PatchError> {
        let stage = FailureStage::ManifestRefresh;
        self.store
            .ensure_dirs(module)
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;

        if self.manifest_outdated(module).await? {
            info!("manifest refresh: downloading new {} manifest", module);
            self.store
                .rotate(module)
                .await
                .map_err(|e| PatchError::new(module, stage, e))?;
            let request = DownloadRequest {
                url: self.store.manifest_url(module),
                local_path: self.store.staging_path(module),
                total_size: None,
                resume_offset: 0,
                anonymous: false,
            };
            let monitor = TransferMonitor::silent(self.cancel_flag.clone());
            self.protocol
                .download(&request, &monitor)
                .await
                .map_err(|e| PatchError::new(module, stage, e))?;
            self.store
                .promote_staged(module)
                .await
                .map_err(|e| PatchError::new(module, stage, e))?;
        } else {
            debug!("manifest refresh: {} manifest up to date", module);
        }

        self.store
            .load(module, Generation::Current)
            .await
            .map_err(|e| PatchError::new(module, stage, e))?
            .ok_or_else(|| {
                PatchError::new(
                    module,
                    stage,
                    PatchErrorKind::Unavailable("manifest missing after refresh".into()),
                )
            })
    }

    async fn manifest_outdated(&self, module: Module) -> Result<bool, PatchError> {
        let stage = FailureStage::ManifestRefresh;
        let current = self.store.manifest_path(module, Generation::Current);
        if fs::metadata(&current).await.is_err() {
            return Ok(true);
        }
        let remote = self
            .protocol
            .read_text(&self.store.checksum_url(module), false)
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;
        let Some(remote) = remote.split_whitespace().next() else {
            warn!("manifest refresh: empty {} checksum; refetching", module);
            return Ok(true);
        };
        let matches = integrity::digest_matches(&current, remote)
            .map_err(|e| PatchError::new(module, stage, e))?;
        Ok(!matches)
    }

    /// Download-One with the caller's retry policy applied.
    ///
    /// Transient transfer failures consume one attempt each. When
    /// `check_integrity` is set, the first hash mismatch after a completed
    /// download earns one free redownload; later mismatches consume attempts.
    async fn fetch_with_retries(
        &self,
        module: Module,
        pending: &PendingDownload,
        check_integrity: bool,
        stage: FailureStage,
    ) -> Result<FileOutcome, PatchError> {
        let budget = self.config.attempt_budget();
        let local = pending.entry.local_path(self.store.local_dir(module));
        let mut attempt = 0;
        let mut transfers = 0;
        let mut redownload_granted = false;
        loop {
            attempt += 1;
            transfers += 1;
            let failure = match self.download_one(module, pending).await {
                Ok(outcome) if !check_integrity || integrity::is_intact(&local, &pending.entry) => {
                    return Ok(outcome);
                }
                Ok(_) if !redownload_granted => {
                    warn!(
                        "{}: {} failed integrity check; downloading again",
                        stage,
                        pending.entry.wire_path()
                    );
                    redownload_granted = true;
                    attempt -= 1;
                    continue;
                }
                Ok(_) => {
                    warn!(
                        "{}: {} failed integrity check (attempt {}/{})",
                        stage,
                        pending.entry.wire_path(),
                        attempt,
                        budget
                    );
                    PatchError::new(
                        module,
                        stage,
                        PatchErrorKind::Integrity {
                            path: local.clone(),
                            attempts: transfers,
                        },
                    )
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        "{}: {} interrupted (attempt {}/{}): {}",
                        stage,
                        pending.entry.wire_path(),
                        attempt,
                        budget,
                        err
                    );
                    err
                }
                Err(err) => return Err(err),
            };
            if attempt >= budget {
                error!(
                    "{}: giving up on {} after {} transfer(s)",
                    stage,
                    pending.entry.wire_path(),
                    transfers
                );
                return Err(PatchError { stage, ..failure });
            }
        }
    }

    /// Bring one local file in line with its manifest entry.
    pub async fn download_one(
        &self,
        module: Module,
        pending: &PendingDownload,
    ) -> Result<FileOutcome, PatchError> {
        let stage = FailureStage::Download;
        self.ensure_not_cancelled(module, stage)?;
        let entry = &pending.entry;
        let local = entry.local_path(self.store.local_dir(module));
        let marker = self.store.marker(module);

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PatchError::new(module, stage, e))?;
        }
        marker
            .begin(entry)
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;

        if let Some(old) = &pending.replaces
            && integrity::is_intact(&local, old)
        {
            debug!(
                "download: discarding outdated {} before replacement",
                entry.wire_path()
            );
            remove_file(&local)
                .await
                .map_err(|e| PatchError::new(module, stage, e))?;
        }

        let resume_offset = match self.resume_offset(&local, entry).await {
            Ok(Some(offset)) => offset,
            Ok(None) => {
                debug!("download: {} already up to date", entry.wire_path());
                marker
                    .clear()
                    .await
                    .map_err(|e| PatchError::new(module, stage, e))?;
                self.emit(ProgressEvent::FileFinished {
                    module,
                    file: entry.wire_path(),
                    outcome: FileOutcome::Skipped,
                });
                return Ok(FileOutcome::Skipped);
            }
            Err(err) => return Err(PatchError::new(module, stage, err)),
        };

        let request = DownloadRequest {
            url: self.store.content_url(module, entry),
            local_path: local.clone(),
            total_size: Some(entry.size_bytes()),
            resume_offset,
            anonymous: false,
        };
        let sink = self.progress.clone();
        let file = entry.wire_path();
        let monitor = TransferMonitor::new(self.cancel_flag.clone(), move |on_disk, total| {
            sink.emit(ProgressEvent::Bytes {
                module,
                file: file.clone(),
                downloaded: on_disk,
                total,
                progress: progress_percent(on_disk, total),
            });
        });

        let started = Instant::now();
        let bytes = self
            .protocol
            .download(&request, &monitor)
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;

        if self.needs_exec_bit(entry) {
            mark_executable(&local);
        }
        marker
            .clear()
            .await
            .map_err(|e| PatchError::new(module, stage, e))?;

        let elapsed = started.elapsed().as_secs_f32();
        let speed = if elapsed > 0.0 {
            bytes as f32 / elapsed
        } else {
            0.0
        };
        info!(
            "download: {} complete ({} bytes from offset {}, {})",
            entry.wire_path(),
            bytes,
            resume_offset,
            format_speed(speed)
        );
        let outcome = FileOutcome::Downloaded {
            bytes,
            resumed_from: resume_offset,
        };
        self.emit(ProgressEvent::FileFinished {
            module,
            file: entry.wire_path(),
            outcome,
        });
        Ok(outcome)
    }

    /// Where to start transferring `entry`, or `None` when the local copy is already correct.
    async fn resume_offset(
        &self,
        local: &Path,
        entry: &ManifestEntry,
    ) -> std::io::Result<Option<u64>> {
        let size = match fs::metadata(local).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Some(0)),
            Err(err) => return Err(err),
        };
        let expected = entry.size_bytes();
        if size == expected {
            if integrity::digest_matches(local, entry.content_hash())? {
                return Ok(None);
            }
            debug!("download: {} has wrong content; refetching", entry.wire_path());
            remove_file(local).await?;
            Ok(Some(0))
        } else if size < expected {
            Ok(Some(size))
        } else {
            debug!(
                "download: {} is larger than expected ({} > {}); refetching",
                entry.wire_path(),
                size,
                expected
            );
            remove_file(local).await?;
            Ok(Some(0))
        }
    }

    fn needs_exec_bit(&self, entry: &ManifestEntry) -> bool {
        let name = entry.file_name();
        (!self.config.game_binary.is_empty() && name == self.config.game_binary)
            || EXECUTABLE_SUFFIXES
                .iter()
                .any(|suffix| name.ends_with(suffix))
    }

    fn announce(&self, module: Module, entry: &ManifestEntry, index: usize, total_files: usize) {
        self.emit(ProgressEvent::FileStarted {
            module,
            file: entry.wire_path(),
            index,
            total_files,
            size: entry.size_bytes(),
        });
    }

    fn finish(
        &self,
        module: Module,
        operation: Operation,
        result: &Result<OperationReport, PatchError>,
    ) {
        match result {
            Ok(report) => info!(
                "{}: {} finished (downloaded {}, skipped {}, repaired {})",
                operation, module, report.downloaded, report.skipped, report.repaired
            ),
            Err(err) if err.is_cancelled() => warn!("{}: {} cancelled", operation, module),
            Err(err) => error!("{}: {}", operation, err),
        }
        self.emit(ProgressEvent::OperationFinished {
            module,
            operation,
            success: result.is_ok(),
        });
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.emit(event);
    }

    fn ensure_not_cancelled(&self, module: Module, stage: FailureStage) -> Result<(), PatchError> {
        if self.cancel_flag.load(Ordering::SeqCst) {
            debug!("cancel flag observed set");
            return Err(PatchError::new(module, stage, PatchErrorKind::Cancelled));
        }
        Ok(())
    }

    fn reset_cancel_flag(&self) {
        self.cancel_flag.store(false, Ordering::SeqCst);
        debug!("cancel flag reset");
    }
}

async fn remove_file(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)) {
        warn!("download: unable to mark {} executable: {}", path.display(), err);
    }
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) {}
