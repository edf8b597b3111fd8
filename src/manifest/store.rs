//! Module → location mapping and the on-disk manifest generations.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use tokio::fs;

use crate::config::PatchConfig;
use crate::engine::models::Module;
use crate::manifest::{Manifest, ManifestEntry};
use crate::storage::ResumeMarker;

const PREVIOUS_SUFFIX: &str = ".old";
const STAGING_SUFFIX: &str = ".part";
const CONTENT_DIR: &str = "bin";
const PROVIDES_MARKER: &str = ".provides";
const CHANGELOG_FILE: &str = "changelog.txt";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Generation {
    Current,
    Previous,
}

#[derive(Clone, Debug)]
pub struct ManifestStore {
    remote_address: String,
    system_target: String,
    launcher_dir: PathBuf,
    game_dir: PathBuf,
    state_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(config: &PatchConfig) -> Self {
        Self {
            remote_address: config.remote_address.trim_end_matches('/').to_owned(),
            system_target: config.system_target.clone(),
            launcher_dir: config.launcher_dir.clone(),
            game_dir: config.game_dir.clone(),
            state_dir: config.state_dir.clone(),
        }
    }

    fn manifest_name(module: Module) -> &'static str {
        match module {
            Module::Launcher => "LauncherManifest",
            Module::Game => "GameManifest",
        }
    }

    fn version_file(module: Module) -> &'static str {
        match module {
            Module::Launcher => "LauncherVersion.txt",
            Module::Game => "GameVersion.txt",
        }
    }

    fn remote_root(&self, module: Module) -> String {
        match module {
            Module::Launcher => format!("{}/launcher", self.remote_address),
            Module::Game => format!("{}/game/{}", self.remote_address, self.system_target),
        }
    }

    pub fn manifest_url(&self, module: Module) -> String {
        format!(
            "{}/{}.txt",
            self.remote_root(module),
            Self::manifest_name(module)
        )
    }

    pub fn checksum_url(&self, module: Module) -> String {
        format!(
            "{}/{}.checksum",
            self.remote_root(module),
            Self::manifest_name(module)
        )
    }

    /// Base URL that manifest paths are relative to.
    pub fn content_base_url(&self, module: Module) -> String {
        format!("{}/{CONTENT_DIR}", self.remote_root(module))
    }

    pub fn content_url(&self, module: Module, entry: &ManifestEntry) -> String {
        format!("{}/{}", self.content_base_url(module), entry.wire_path())
    }

    pub fn version_url(&self, module: Module) -> String {
        format!(
            "{}/{}",
            self.content_base_url(module),
            Self::version_file(module)
        )
    }

    /// Existence-only marker a server publishes for each platform it builds for.
    pub fn provides_url(&self, module: Module) -> Option<String> {
        match module {
            Module::Launcher => None,
            Module::Game => Some(format!("{}/{PROVIDES_MARKER}", self.remote_root(module))),
        }
    }

    pub fn changelog_url(&self) -> String {
        format!("{}/{CHANGELOG_FILE}", self.remote_root(Module::Launcher))
    }

    /// Directory the module's content is installed into.
    pub fn local_dir(&self, module: Module) -> &Path {
        match module {
            Module::Launcher => &self.launcher_dir,
            Module::Game => &self.game_dir,
        }
    }

    pub fn local_version_path(&self, module: Module) -> PathBuf {
        self.local_dir(module).join(Self::version_file(module))
    }

    pub fn manifest_path(&self, module: Module, generation: Generation) -> PathBuf {
        let name = format!("{}.txt", Self::manifest_name(module));
        match generation {
            Generation::Current => self.state_dir.join(name),
            Generation::Previous => self.state_dir.join(format!("{name}{PREVIOUS_SUFFIX}")),
        }
    }

    /// Where a freshly downloaded manifest lands before it replaces the current one.
    pub fn staging_path(&self, module: Module) -> PathBuf {
        self.state_dir.join(format!(
            "{}.txt{STAGING_SUFFIX}",
            Self::manifest_name(module)
        ))
    }

    pub fn marker(&self, module: Module) -> ResumeMarker {
        let name = match module {
            Module::Launcher => "launcher.tag",
            Module::Game => "game.tag",
        };
        ResumeMarker::new(self.state_dir.join(name))
    }

    /// Read a manifest generation. `None` means the file does not exist.
    pub async fn load(
        &self,
        module: Module,
        generation: Generation,
    ) -> io::Result<Option<Manifest>> {
        let path = self.manifest_path(module, generation);
        match fs::read(&path).await {
            Ok(bytes) => {
                let manifest = Manifest::parse(&String::from_utf8_lossy(&bytes));
                debug!(
                    "manifest store: loaded {} entries from {}",
                    manifest.len(),
                    path.display()
                );
                Ok(Some(manifest))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The previous generation, or an empty manifest when there is none.
    pub async fn load_previous(&self, module: Module) -> io::Result<Manifest> {
        Ok(self
            .load(module, Generation::Previous)
            .await?
            .unwrap_or_default())
    }

    /// Move current → previous, discarding any stale previous generation.
    pub async fn rotate(&self, module: Module) -> io::Result<()> {
        let current = self.manifest_path(module, Generation::Current);
        if fs::metadata(&current).await.is_err() {
            debug!("manifest store: nothing to rotate for {}", module);
            return Ok(());
        }
        let previous = self.manifest_path(module, Generation::Previous);
        if fs::metadata(&previous).await.is_ok() {
            fs::remove_file(&previous).await?;
        }
        fs::rename(&current, &previous).await?;
        info!("manifest store: rotated {} manifest", module);
        Ok(())
    }

    /// Promote the staged download to the current generation.
    pub async fn promote_staged(&self, module: Module) -> io::Result<()> {
        let staged = self.staging_path(module);
        let current = self.manifest_path(module, Generation::Current);
        fs::rename(&staged, &current).await
    }

    pub async fn ensure_dirs(&self, module: Module) -> io::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(self.local_dir(module)).await
    }
}
