//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: where
//! the API lives, which endpoints issue and renew credentials, how the
//! refresh endpoint rotates refresh credentials, and where credentials are
//! kept.
//!
//! Configuration is stored at `~/.config/taskdesk/config.json`. The
//! `TASKDESK_BASE_URL`, `TASKDESK_CREDENTIAL_BACKEND` and
//! `TASKDESK_REFRESH_ROTATION` environment variables override the file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::api::transport::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::auth::credentials::DEFAULT_SERVICE_NAME;
use crate::auth::{
    CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore, RefreshRotation,
};

/// Application name used for config/data directory paths
const APP_NAME: &str = "taskdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Credentials file name, used by the `file` backend
const CREDENTIALS_FILE: &str = "credentials.json";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_LOGIN_PATH: &str = "/api/token/";
pub const DEFAULT_REFRESH_PATH: &str = "/api/token/refresh/";

const ENV_BASE_URL: &str = "TASKDESK_BASE_URL";
const ENV_CREDENTIAL_BACKEND: &str = "TASKDESK_CREDENTIAL_BACKEND";
const ENV_REFRESH_ROTATION: &str = "TASKDESK_REFRESH_ROTATION";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    Keyring,
    File,
    Memory,
}

impl FromStr for CredentialBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(CredentialBackend::Keyring),
            "file" => Ok(CredentialBackend::File),
            "memory" => Ok(CredentialBackend::Memory),
            other => Err(anyhow::anyhow!(
                "Unknown credential backend '{}' (expected keyring, file or memory)",
                other
            )),
        }
    }
}

fn parse_rotation(s: &str) -> Result<RefreshRotation> {
    match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "never" => Ok(RefreshRotation::Never),
        "when_provided" => Ok(RefreshRotation::WhenProvided),
        "always" => Ok(RefreshRotation::Always),
        other => Err(anyhow::anyhow!(
            "Unknown refresh rotation '{}' (expected never, when_provided or always)",
            other
        )),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub refresh_rotation: RefreshRotation,
    pub request_timeout_secs: u64,
    pub credential_backend: CredentialBackend,
    /// Overrides the default credentials file location for the `file` backend
    pub credentials_file: Option<PathBuf>,
    pub last_username: Option<String>,
    /// When set, logs are also written to a file in this directory
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            refresh_rotation: RefreshRotation::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            credential_backend: CredentialBackend::default(),
            credentials_file: None,
            last_username: None,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

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

    /// Persist `last_username` without writing environment overrides to disk.
    pub fn remember_username(username: &str) -> Result<()> {
        let path = Self::config_path()?;
        let mut stored = Self::load_from(&path)?;
        stored.last_username = Some(username.to_string());
        stored.save_to(&path)
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

    /// Apply overrides from `lookup` (the process environment in `load`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = url;
        }
        if let Some(backend) = lookup(ENV_CREDENTIAL_BACKEND).filter(|v| !v.is_empty()) {
            self.credential_backend = backend
                .parse()
                .with_context(|| format!("Invalid {}", ENV_CREDENTIAL_BACKEND))?;
        }
        if let Some(rotation) = lookup(ENV_REFRESH_ROTATION).filter(|v| !v.is_empty()) {
            self.refresh_rotation =
                parse_rotation(&rotation).with_context(|| format!("Invalid {}", ENV_REFRESH_ROTATION))?;
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url).with_context(|| format!("Invalid base URL '{}'", self.base_url))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn credentials_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.credentials_file {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(CREDENTIALS_FILE))
    }

    /// Open the configured credential store backend.
    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.credential_backend {
            CredentialBackend::Keyring => Arc::new(KeyringCredentialStore::new(DEFAULT_SERVICE_NAME)),
            CredentialBackend::File => Arc::new(FileCredentialStore::new(self.credentials_path()?)),
            CredentialBackend::Memory => Arc::new(MemoryCredentialStore::new()),
        })
    }
}

/// Join an endpoint path onto the base URL, keeping any path prefix the base
/// URL carries (e.g. `https://host/backend/` + `/api/token/`).
pub(crate) fn resolve(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .with_context(|| format!("Invalid endpoint path '{}'", path))
}
