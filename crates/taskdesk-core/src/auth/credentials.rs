//! Persistent storage for the access and refresh credentials.
//!
//! Three backends implement `CredentialStore`:
//! - `KeyringCredentialStore`: the OS keychain (default)
//! - `FileCredentialStore`: a JSON file readable only by the owner
//! - `MemoryCredentialStore`: process-local, for tests and throwaway sessions

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Keychain service name the credentials are filed under
pub const DEFAULT_SERVICE_NAME: &str = "taskdesk";

/// File permissions for the credentials file (Unix only): owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKey {
    Access,
    Refresh,
}

impl CredentialKey {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKey::Access => "access",
            CredentialKey::Refresh => "refresh",
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("credential file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("credential store task failed: {0}")]
    Join(String),
}

/// Key/value storage that outlives the process.
///
/// Removing a key that is not present succeeds.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError>;

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: CredentialKey) -> Result<(), StoreError>;

    /// Backend name for diagnostics.
    fn name(&self) -> &str;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }
    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }
    fn remove(&self, key: CredentialKey) -> Result<(), StoreError> {
        (**self).remove(key)
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

// ============================================================================
// OS keychain
// ============================================================================

pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: CredentialKey) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, key.as_str())?)
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    fn remove(&self, key: CredentialKey) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        "keyring"
    }
}

// ============================================================================
// JSON file
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    entries: HashMap<CredentialKey, String>,
}

/// Credentials kept in a single JSON file.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written file behind.
pub struct FileCredentialStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> Result<CredentialFile, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CredentialFile::default()),
            Err(e) => return Err(self.io_error(e)),
        };
        if contents.trim().is_empty() {
            return Ok(CredentialFile::default());
        }
        serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, file: &CredentialFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let contents = serde_json::to_string_pretty(file).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let temp_path = self.path.with_extension("tmp");
        write_private(&temp_path, contents.as_bytes()).map_err(|e| self.io_error(e))?;
        std::fs::rename(&temp_path, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut CredentialFile)) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read()?;
        apply(&mut file);
        self.write(&file)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

impl CredentialStore for FileCredentialStore {
    #[instrument(skip(self))]
    fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.entries.remove(&key))
    }

    #[instrument(skip(self, value))]
    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        self.update(|file| {
            file.entries.insert(key, value.to_string());
        })
    }

    #[instrument(skip(self))]
    fn remove(&self, key: CredentialKey) -> Result<(), StoreError> {
        if !self.path.exists() {
            debug!("No credential file, nothing to remove");
            return Ok(());
        }
        self.update(|file| {
            file.entries.remove(&key);
        })
    }

    fn name(&self) -> &str {
        "file"
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Clone shares the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<RwLock<HashMap<CredentialKey, String>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with an access and optional refresh credential.
    pub fn with_credentials(access: &str, refresh: Option<&str>) -> Self {
        let mut map = HashMap::new();
        map.insert(CredentialKey::Access, access.to_string());
        if let Some(refresh) = refresh {
            map.insert(CredentialKey::Refresh, refresh.to_string());
        }
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(&key).cloned())
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, key: CredentialKey) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(&key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
