//! Application configuration management.
//!
//! Holds the backend URL, request and refresh timing, the storage backend
//! choice and the last used login email.
//!
//! Configuration is stored at `~/.config/labtrack/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "labtrack";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "LABTRACK_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on one whole refresh, retries included.
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;
const MIN_REFRESH_TIMEOUT_SECS: u64 = 10;
const MAX_REFRESH_TIMEOUT_SECS: u64 = 30;

/// Attempts for the refresh call on network errors and 5xx.
const DEFAULT_REFRESH_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between refresh attempts; doubles per attempt.
const DEFAULT_REFRESH_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub refresh_max_attempts: u32,
    pub refresh_backoff_ms: u64,
    pub storage: StorageBackend,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            refresh_max_attempts: DEFAULT_REFRESH_MAX_ATTEMPTS,
            refresh_backoff_ms: DEFAULT_REFRESH_BACKOFF_MS,
            storage: StorageBackend::default(),
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Base URL with the `LABTRACK_API_URL` override applied. The override
    /// is never written back to the config file.
    pub fn effective_api_base_url(&self) -> String {
        std::env::var(API_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.api_base_url.clone())
    }

    /// Directory for the file-backed credential store.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Refresh timeout, clamped to 10-30 seconds.
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(
            self.refresh_timeout_secs
                .clamp(MIN_REFRESH_TIMEOUT_SECS, MAX_REFRESH_TIMEOUT_SECS),
        )
    }

    pub fn refresh_backoff(&self) -> Duration {
        Duration::from_millis(self.refresh_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = Config::load_from(&dir.path().join("config.json")).expect("load");
        assert_eq!(config, Config::default());
        assert_eq!(config.storage, StorageBackend::File);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api_base_url":"https://labs.example.edu/api","storage":"keyring"}"#)
            .expect("write");

        let config = Config::load_from(&path).expect("load");
        assert_eq!(config.api_base_url, "https://labs.example.edu/api");
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert_eq!(config.refresh_max_attempts, DEFAULT_REFRESH_MAX_ATTEMPTS);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            last_email: Some("clerk@example.edu".to_string()),
            ..Config::default()
        };
        config.save_to(&path).expect("save");
        assert_eq!(Config::load_from(&path).expect("load"), config);
    }

    #[test]
    fn test_refresh_timeout_is_clamped() {
        let mut config = Config {
            refresh_timeout_secs: 2,
            ..Config::default()
        };
        assert_eq!(config.refresh_timeout(), Duration::from_secs(10));
        config.refresh_timeout_secs = 120;
        assert_eq!(config.refresh_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").expect("write");
        assert!(Config::load_from(&path).is_err());
    }
}
