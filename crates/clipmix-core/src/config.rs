//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend location, request timeout, renewal endpoint, where credentials
//! are kept, and the last email used to log in.
//!
//! Configuration is stored at `~/.config/clipmix/config.json`. The
//! `CLIPMIX_BACKEND_URL` and `CLIPMIX_STORAGE` environment variables
//! override the file.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::HttpTransport;
use crate::auth::{
    CredentialStore, FileStore, KeyringStore, MemoryStore, SessionManager, DEFAULT_RENEWAL_PATH,
};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "clipmix";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing else is configured
const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// OS keychain
    #[default]
    Keyring,
    /// JSON file in the cache directory
    File,
    /// Process memory only
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(StorageBackend::Keyring),
            "file" => Ok(StorageBackend::File),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    pub request_timeout_secs: u64,
    pub renewal_path: String,
    pub storage: StorageBackend,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            renewal_path: DEFAULT_RENEWAL_PATH.to_string(),
            storage: StorageBackend::default(),
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
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

    /// Apply `CLIPMIX_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var("CLIPMIX_BACKEND_URL").ok(),
            std::env::var("CLIPMIX_STORAGE").ok(),
        );
    }

    fn apply_overrides(&mut self, backend_url: Option<String>, storage: Option<String>) {
        if let Some(url) = backend_url.filter(|u| !u.trim().is_empty()) {
            self.backend_url = url.trim().to_string();
        }
        if let Some(storage) = storage {
            match storage.parse() {
                Ok(backend) => self.storage = backend,
                Err(e) => warn!(error = %e, "Ignoring CLIPMIX_STORAGE"),
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the credential store selected by `storage`
    pub fn credential_store(&self) -> Result<Box<dyn CredentialStore>> {
        Ok(match self.storage {
            StorageBackend::Keyring => Box::new(KeyringStore::default()),
            StorageBackend::File => Box::new(FileStore::new(&self.cache_dir()?)),
            StorageBackend::Memory => Box::new(MemoryStore::new()),
        })
    }

    /// Wire up a session manager against the configured backend and store
    pub fn session_manager(&self) -> Result<SessionManager> {
        let transport = HttpTransport::new(&self.backend_url, self.request_timeout())
            .context("Failed to build HTTP client")?;
        let store = self.credential_store()?;
        Ok(SessionManager::with_renewal_path(
            store,
            Arc::new(transport),
            &self.renewal_path,
        ))
    }
}
