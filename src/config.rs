use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env;
use crate::error::ConfigError;

const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const MIN_BUFFER_SIZE: usize = 4 * 1024;
const MAX_BUFFER_SIZE: usize = 256 * 1024;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Read-only key/value source the launcher's own config loader hands to the engine.
pub trait ConfigProvider {
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigProvider for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Transfer credentials and install layout consumed by the engine.
#[derive(Clone, Debug, Deserialize)]
pub struct PatchConfig {
    pub remote_address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "env::platform_tag")]
    pub system_target: String,
    #[serde(default = "env::launcher_dir")]
    pub launcher_dir: PathBuf,
    #[serde(default = "env::game_dir")]
    pub game_dir: PathBuf,
    #[serde(default = "env::state_dir")]
    pub state_dir: PathBuf,
    /// File name of the game executable, marked executable after download on POSIX hosts.
    #[serde(default)]
    pub game_binary: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

impl PatchConfig {
    pub fn new(remote_address: impl Into<String>) -> Self {
        Self {
            remote_address: remote_address.into(),
            username: String::new(),
            password: String::new(),
            retry_count: DEFAULT_RETRY_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            system_target: env::platform_tag(),
            launcher_dir: env::launcher_dir(),
            game_dir: env::game_dir(),
            state_dir: env::state_dir(),
            game_binary: String::new(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }

    /// Load from a JSON document on disk.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validated()
    }

    /// Build from an opaque key/value provider, falling back to defaults for optional keys.
    pub fn from_provider(provider: &impl ConfigProvider) -> Result<Self, ConfigError> {
        let remote = provider
            .get("RemoteAddress")
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::Missing("RemoteAddress"))?;
        let mut config = Self::new(remote.trim());

        if let Some(value) = provider.get("Username") {
            config.username = value;
        }
        if let Some(value) = provider.get("Password") {
            config.password = value;
        }
        if let Some(value) = provider.get("RetryCount") {
            config.retry_count = parse_number("RetryCount", &value)?;
        }
        if let Some(value) = provider.get("BufferSize") {
            config.buffer_size = parse_number("BufferSize", &value)?;
        }
        if let Some(value) = provider.get("SystemTarget").filter(|v| !v.is_empty()) {
            config.system_target = value;
        }
        if let Some(value) = provider.get("GameBinary") {
            config.game_binary = value;
        }
        if let Some(value) = provider.get("LauncherDir") {
            config.launcher_dir = PathBuf::from(value);
        }
        if let Some(value) = provider.get("GameDir") {
            config.game_dir = PathBuf::from(value);
        }
        if let Some(value) = provider.get("StateDir") {
            config.state_dir = PathBuf::from(value);
        }
        if let Some(value) = provider.get("ProbeTimeout") {
            config.probe_timeout_secs = parse_number("ProbeTimeout", &value)?;
        }
        config.validated()
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        self.remote_address = self.remote_address.trim_end_matches('/').to_owned();
        if !self.remote_address.contains("://") {
            return Err(ConfigError::Invalid {
                key: "RemoteAddress",
                value: self.remote_address,
            });
        }
        self.buffer_size = self.buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        Ok(self)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Number of download attempts allowed per file; never less than one.
    pub fn attempt_budget(&self) -> u32 {
        self.retry_count.max(1)
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn reads_keys_from_provider() {
        let config = PatchConfig::from_provider(&provider(&[
            ("RemoteAddress", "ftp://patch.example.com/"),
            ("Username", "player"),
            ("Password", "secret"),
            ("RetryCount", "5"),
            ("BufferSize", "8192"),
            ("SystemTarget", "linux-amd64"),
            ("GameBinary", "Game.x86_64"),
        ]))
        .expect("valid config");

        assert_eq!(config.remote_address, "ftp://patch.example.com");
        assert_eq!(config.username, "player");
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.system_target, "linux-amd64");
        assert_eq!(config.game_binary, "Game.x86_64");
        assert!(config.has_credentials());
    }

    #[test]
    fn missing_address_is_an_error() {
        let err = PatchConfig::from_provider(&provider(&[("Username", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("RemoteAddress")));
    }

    #[test]
    fn rejects_non_numeric_retry_count() {
        let err = PatchConfig::from_provider(&provider(&[
            ("RemoteAddress", "http://host"),
            ("RetryCount", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "RetryCount", .. }));
    }

    #[test]
    fn clamps_buffer_size() {
        let config = PatchConfig::from_provider(&provider(&[
            ("RemoteAddress", "http://host"),
            ("BufferSize", "1"),
        ]))
        .expect("valid config");
        assert_eq!(config.buffer_size, MIN_BUFFER_SIZE);
    }

    #[test]
    fn parses_json_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("patch.json");
        std::fs::write(&path, r#"{ "remote_address": "https://cdn.example.com" }"#)
            .expect("write config");
        let config = PatchConfig::from_json_file(&path).expect("valid json");
        assert_eq!(config.retry_count, DEFAULT_RETRY_COUNT);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.attempt_budget(), DEFAULT_RETRY_COUNT);
        assert!(!config.has_credentials());
    }
}
