//! Application configuration management.
//!
//! Configuration is stored at `~/.config/fitsession/config.json`. The API base
//! URL can be overridden with the `API_BASE_URL` environment variable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::{AuthApi, DEFAULT_API_BASE_URL};
use crate::auth::{FileStore, KeyringStore, SessionSettings, SessionStore};

/// Application name used for config/data directory paths
const APP_NAME: &str = "fitsession";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the API base URL
pub const API_BASE_URL_ENV: &str = "API_BASE_URL";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub storage: StorageBackend,
    pub data_dir: Option<PathBuf>,
    pub refresh_window_secs: Option<i64>,
    pub refresh_check_interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub last_email: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
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

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Environment first, then the config file, then the local default.
    pub fn api_base_url(&self) -> Result<Url> {
        let env_value = std::env::var(API_BASE_URL_ENV).ok();
        self.resolve_base_url(env_value.as_deref())
    }

    fn resolve_base_url(&self, env_value: Option<&str>) -> Result<Url> {
        let raw = env_value
            .filter(|v| !v.trim().is_empty())
            .or(self.api_base_url.as_deref())
            .unwrap_or(DEFAULT_API_BASE_URL);
        Url::parse(raw.trim()).with_context(|| format!("Invalid API base URL: {}", raw))
    }

    pub fn session_settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            refresh_window: self
                .refresh_window_secs
                .map(Duration::seconds)
                .unwrap_or(defaults.refresh_window),
            check_interval: self
                .refresh_check_interval_secs
                .filter(|secs| *secs > 0)
                .map(StdDuration::from_secs)
                .unwrap_or(defaults.check_interval),
        }
    }

    pub fn auth_api(&self) -> Result<AuthApi> {
        let timeout = self.request_timeout_secs.map(StdDuration::from_secs);
        AuthApi::new(self.api_base_url()?, timeout).context("Failed to create API client")
    }

    pub fn open_store(&self) -> Result<Arc<dyn SessionStore>> {
        Ok(match self.storage {
            StorageBackend::File => Arc::new(FileStore::new(&self.data_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_precedence() {
        let mut config = Config::default();
        assert_eq!(config.resolve_base_url(None).unwrap().as_str(), "http://localhost:8080/");

        config.api_base_url = Some("https://api.example.com".to_string());
        assert_eq!(config.resolve_base_url(None).unwrap().as_str(), "https://api.example.com/");
        assert_eq!(config.resolve_base_url(Some("  ")).unwrap().as_str(), "https://api.example.com/");
        assert_eq!(
            config.resolve_base_url(Some("http://staging:9000")).unwrap().as_str(),
            "http://staging:9000/"
        );

        config.api_base_url = Some("not a url".to_string());
        assert!(config.resolve_base_url(None).is_err());
    }

    #[test]
    fn test_session_settings_defaults_and_overrides() {
        let config = Config::default();
        let settings = config.session_settings();
        assert_eq!(settings.refresh_window, Duration::minutes(5));
        assert_eq!(settings.check_interval, StdDuration::from_secs(300));

        let config = Config {
            refresh_window_secs: Some(60),
            refresh_check_interval_secs: Some(0),
            ..Config::default()
        };
        let settings = config.session_settings();
        assert_eq!(settings.refresh_window, Duration::minutes(1));
        assert_eq!(settings.check_interval, StdDuration::from_secs(300));
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = serde_json::from_str(r#"{"storage": "keyring", "last_email": "a@b.com"}"#).unwrap();
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert_eq!(config.last_email.as_deref(), Some("a@b.com"));
        assert!(config.api_base_url.is_none());
    }
}
