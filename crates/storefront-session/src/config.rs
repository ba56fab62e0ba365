//! Client configuration management.
//!
//! This module handles loading and saving the client configuration: API and
//! auth endpoints, the renewal margin, request timeout, and where the session
//! is persisted.
//!
//! Configuration is stored at `~/.config/storefront/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::expiry::DEFAULT_RENEWAL_MARGIN_SECS;
use crate::auth::StorageKind;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "storefront";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on the renewal margin (one day)
const MAX_RENEWAL_MARGIN_SECS: u64 = 24 * 60 * 60;

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

const DEFAULT_AUTH_BASE_URL: &str = "http://localhost:8080/api/auth";

/// Environment variable overriding `api_base_url`
pub const ENV_API_URL: &str = "STOREFRONT_API_URL";

/// Environment variable overriding `auth_base_url`
pub const ENV_AUTH_URL: &str = "STOREFRONT_AUTH_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub auth_base_url: String,
    pub renewal_margin_secs: u64,
    pub request_timeout_secs: u64,
    pub storage: StorageKind,
    pub session_dir: Option<PathBuf>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
            renewal_margin_secs: DEFAULT_RENEWAL_MARGIN_SECS as u64,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage: StorageKind::default(),
            session_dir: None,
            last_email: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults if absent) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
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

    /// Override endpoints from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(url) = lookup(ENV_AUTH_URL).filter(|u| !u.is_empty()) {
            self.auth_base_url = url;
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session for the file backend.
    pub fn session_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.session_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn renewal_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.renewal_margin_secs.min(MAX_RENEWAL_MARGIN_SECS) as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.renewal_margin(), chrono::Duration::minutes(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.storage, StorageKind::File);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"storage": "memory", "renewal_margin_secs": 60}"#).expect("parse");
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.renewal_margin(), chrono::Duration::minutes(1));
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            ENV_API_URL => Some("https://shop.example.com/api".to_string()),
            ENV_AUTH_URL => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.api_base_url, "https://shop.example.com/api");
        assert_eq!(config.auth_base_url, DEFAULT_AUTH_BASE_URL);
    }

    #[test]
    fn test_explicit_session_dir() {
        let config = Config {
            session_dir: Some(PathBuf::from("/tmp/storefront-test")),
            ..Config::default()
        };
        assert_eq!(config.session_dir().expect("dir"), PathBuf::from("/tmp/storefront-test"));
    }
}
