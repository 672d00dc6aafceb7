use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::credentials::{CredentialKey, CredentialStore, StoreError};

/// Access credential plus the longer-lived credential used to renew it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: Option<String>) -> Self {
        Self {
            access: access.into(),
            refresh,
        }
    }

    /// Expiry of the access credential, if it is a JWT carrying an `exp`
    /// claim. The signature is not checked; this is for display only.
    pub fn access_expiry(&self) -> Option<DateTime<Utc>> {
        jwt_expiry(&self.access)
    }
}

// Never print credentials, even in debug output
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

/// Snapshot of the derived session state, for display.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub has_refresh: bool,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub backend: String,
}

impl SessionStatus {
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.access_expires_at.map(|expiry| expiry - Utc::now())
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.time_until_expiry().map(|d| d.num_minutes().max(0))
    }
}

/// Typed view over a `CredentialStore`, shared by the session client and the
/// refresh coordinator.
///
/// Whether the user is logged in is always read from the store; nothing here
/// caches it. Every write bumps the session epoch, which lets concurrent
/// requests agree on whether a forced logout for their session already
/// happened.
#[derive(Clone)]
pub struct Credentials {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    // Guards writes and the epoch together
    epoch: Mutex<u64>,
}

impl Credentials {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                epoch: Mutex::new(0),
            }),
        }
    }

    fn read(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        Ok(self.inner.store.get(key)?.filter(|v| !v.is_empty()))
    }

    pub fn access(&self) -> Result<Option<String>, StoreError> {
        self.read(CredentialKey::Access)
    }

    pub fn refresh(&self) -> Result<Option<String>, StoreError> {
        self.read(CredentialKey::Refresh)
    }

    pub fn pair(&self) -> Result<Option<CredentialPair>, StoreError> {
        let Some(access) = self.access()? else {
            return Ok(None);
        };
        Ok(Some(CredentialPair {
            access,
            refresh: self.refresh()?,
        }))
    }

    pub fn is_authenticated(&self) -> Result<bool, StoreError> {
        Ok(self.access()?.is_some())
    }

    /// The session epoch and the access credential that belongs to it.
    ///
    /// Both are read under the epoch lock, so no credential write can land
    /// between the two reads.
    pub fn snapshot(&self) -> Result<(u64, Option<String>), StoreError> {
        let epoch = self.inner.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        let access = self.access()?;
        Ok((*epoch, access))
    }

    pub fn status(&self) -> Result<SessionStatus, StoreError> {
        let refresh = self.refresh()?;
        let pair = self.access()?.map(|access| CredentialPair::new(access, refresh.clone()));
        Ok(SessionStatus {
            authenticated: pair.is_some(),
            has_refresh: refresh.is_some(),
            access_expires_at: pair.as_ref().and_then(CredentialPair::access_expiry),
            backend: self.inner.store.name().to_string(),
        })
    }

    /// Run `op` on the blocking thread pool. The keychain and file backends
    /// do synchronous I/O.
    pub(crate) async fn run_blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Credentials) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let credentials = self.clone();
        tokio::task::spawn_blocking(move || op(&credentials))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Replace the whole session with a freshly issued pair.
    pub(crate) fn establish(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        let mut epoch = self.inner.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        self.inner.store.set(CredentialKey::Access, &pair.access)?;
        match pair.refresh.as_deref() {
            Some(refresh) => self.inner.store.set(CredentialKey::Refresh, refresh)?,
            None => self.inner.store.remove(CredentialKey::Refresh)?,
        }
        info!(backend = self.inner.store.name(), "Session established");
        Ok(())
    }

    /// Store the result of a refresh. A `None` refresh credential keeps the
    /// one already stored.
    pub(crate) fn store_refreshed(&self, access: &str, refresh: Option<&str>) -> Result<(), StoreError> {
        let mut epoch = self.inner.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        self.inner.store.set(CredentialKey::Access, access)?;
        if let Some(refresh) = refresh {
            self.inner.store.set(CredentialKey::Refresh, refresh)?;
        }
        debug!(rotated = refresh.is_some(), "Stored refreshed credentials");
        Ok(())
    }

    /// Remove both credentials. Both removals are attempted even if the
    /// first fails.
    pub(crate) fn clear(&self) -> Result<(), StoreError> {
        let mut epoch = self.inner.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        self.remove_both()
    }

    /// Clear only if no credential write happened since `observed`.
    /// Returns whether this call performed the clear.
    pub(crate) fn clear_if_epoch(&self, observed: u64) -> Result<bool, StoreError> {
        let mut epoch = self.inner.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *epoch != observed {
            return Ok(false);
        }
        *epoch += 1;
        self.remove_both()?;
        Ok(true)
    }

    fn remove_both(&self) -> Result<(), StoreError> {
        let access = self.inner.store.remove(CredentialKey::Access);
        let refresh = self.inner.store.remove(CredentialKey::Refresh);
        access.and(refresh)
    }
}
