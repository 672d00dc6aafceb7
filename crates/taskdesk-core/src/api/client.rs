//! Session-aware API client for the taskdesk backend.
//!
//! `SessionClient::send` is the single entry point for protected calls. It
//! attaches the stored access credential, and when the backend answers 401
//! it obtains a new credential through the shared `RefreshCoordinator` and
//! resubmits the request once. When the session cannot be renewed the
//! credentials are cleared and the configured `LogoutTrigger` fires.

use std::sync::Arc;

use anyhow::Context;
use reqwest::{Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info, warn};

use super::{ApiError, ApiResponse, ReqwestTransport, RequestDescriptor, Transport};
use crate::auth::refresh::TokenResponse;
use crate::auth::{
    CredentialPair, CredentialStore, Credentials, LogoutTrigger, RefreshCoordinator, RefreshFailure, RefreshRotation,
    SessionStatus,
};
use crate::config::{self, Config};

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// API client bound to one session.
/// Clone is cheap - all clones share the credential store, transport and
/// refresh coordinator.
#[derive(Clone)]
pub struct SessionClient {
    base_url: Url,
    login_url: Url,
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    coordinator: RefreshCoordinator,
    logout: Arc<dyn LogoutTrigger>,
}

impl SessionClient {
    pub fn builder(base_url: Url) -> SessionClientBuilder {
        SessionClientBuilder::new(base_url)
    }

    /// Build a client from configuration, using the configured credential
    /// backend and a `reqwest` transport.
    pub fn from_config(config: &Config, logout: Arc<dyn LogoutTrigger>) -> anyhow::Result<Self> {
        let transport =
            ReqwestTransport::new(config.request_timeout()).context("Failed to build HTTP client")?;

        SessionClient::builder(config.base_url()?)
            .login_path(&config.login_path)
            .refresh_path(&config.refresh_path)
            .rotation(config.refresh_rotation)
            .store(config.credential_store()?)
            .transport(Arc::new(transport))
            .logout(logout)
            .build()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Derived from the credential store on every call.
    pub fn is_authenticated(&self) -> Result<bool, ApiError> {
        Ok(self.credentials.is_authenticated()?)
    }

    pub fn status(&self) -> Result<SessionStatus, ApiError> {
        Ok(self.credentials.status()?)
    }

    // ===== Session lifecycle =====

    /// Exchange a username and password for a credential pair and store it.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError> {
        let request = RequestDescriptor::post(self.login_url.clone()).with_json(&LoginRequest { username, password })?;

        // Straight to the transport: a 401 here means bad credentials, not an expired session
        let response = self.transport.execute(&request).await?.error_for_status()?;
        let body: TokenResponse = response.json()?;

        let access = body
            .access
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("login response has no access credential".into()))?;
        let pair = CredentialPair::new(access, body.refresh.filter(|r| !r.is_empty()));

        self.establish(&pair).await?;
        info!(username = username, has_refresh = pair.refresh.is_some(), "Logged in");
        Ok(pair)
    }

    /// Start a session from a credential pair, replacing whatever was stored.
    pub async fn establish(&self, pair: &CredentialPair) -> Result<(), ApiError> {
        let pair = pair.clone();
        Ok(self.credentials.run_blocking(move |c| c.establish(&pair)).await?)
    }

    /// User-initiated logout. Clears both credentials; the logout trigger is
    /// reserved for sessions that expire on their own.
    pub fn logout(&self) -> Result<(), ApiError> {
        self.credentials.clear()?;
        info!("Logged out");
        Ok(())
    }

    // ===== Request path =====

    /// Send a request with the current session.
    ///
    /// Responses of any status come back as `Ok`; only transport and
    /// credential store failures are errors. A 401 is answered by one
    /// credential refresh and one resubmission. A request that is already a
    /// resubmission is never retried again.
    pub async fn send(&self, request: RequestDescriptor) -> Result<ApiResponse, ApiError> {
        let (epoch, sent_access) = self.credentials.run_blocking(Credentials::snapshot).await?;

        let response = self.submit(&request, sent_access.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED || request.is_retried() {
            return Ok(response);
        }

        debug!(method = %request.method(), url = %request.url(), "Access credential rejected");
        let access = match self.coordinator.replace_rejected(sent_access.as_deref()).await {
            Ok(pair) => pair.access,
            Err(failure) => {
                self.force_logout(epoch, &failure).await?;
                return Ok(response);
            }
        };

        let retry = request.retry();
        debug!(method = %retry.method(), url = %retry.url(), "Retrying with renewed credential");
        self.submit(&retry, Some(&access)).await
    }

    async fn submit(&self, request: &RequestDescriptor, access: Option<&str>) -> Result<ApiResponse, ApiError> {
        let request = request.with_bearer(access)?;
        Ok(self.transport.execute(&request).await?)
    }

    /// Clear the session and fire the logout trigger, once per session epoch.
    async fn force_logout(&self, epoch: u64, reason: &RefreshFailure) -> Result<(), ApiError> {
        match self.credentials.run_blocking(move |c| c.clear_if_epoch(epoch)).await {
            Ok(true) => {
                warn!(reason = %reason, "Session could not be renewed, logging out");
                self.logout.force_logout();
                Ok(())
            }
            Ok(false) => {
                debug!(reason = %reason, "Session already ended by another request");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to clear credentials after refresh failure");
                self.logout.force_logout();
                Err(e.into())
            }
        }
    }

    // ===== Typed helpers =====

    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        config::resolve(&self.base_url, path).map_err(|e| ApiError::InvalidRequest(format!("{:#}", e)))
    }

    /// Send `method path` with an optional JSON body, mapping non-2xx
    /// statuses to errors.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, ApiError> {
        let mut request = RequestDescriptor::new(method, self.url(path)?);
        if let Some(body) = body {
            request = request.with_json(body)?;
        }
        self.send(request).await?.error_for_status()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path, None).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let request = RequestDescriptor::post(self.url(path)?).with_json(body)?;
        self.send(request).await?.error_for_status()?.json()
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let request = RequestDescriptor::put(self.url(path)?).with_json(body)?;
        self.send(request).await?.error_for_status()?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let request = RequestDescriptor::delete(self.url(path)?);
        self.send(request).await?.error_for_status()?;
        Ok(())
    }
}

pub struct SessionClientBuilder {
    base_url: Url,
    login_path: String,
    refresh_path: String,
    rotation: RefreshRotation,
    store: Option<Arc<dyn CredentialStore>>,
    transport: Option<Arc<dyn Transport>>,
    logout: Option<Arc<dyn LogoutTrigger>>,
}

impl SessionClientBuilder {
    fn new(base_url: Url) -> Self {
        Self {
            base_url,
            login_path: config::DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: config::DEFAULT_REFRESH_PATH.to_string(),
            rotation: RefreshRotation::default(),
            store: None,
            transport: None,
            logout: None,
        }
    }

    pub fn login_path(mut self, path: &str) -> Self {
        self.login_path = path.to_string();
        self
    }

    pub fn refresh_path(mut self, path: &str) -> Self {
        self.refresh_path = path.to_string();
        self
    }

    pub fn rotation(mut self, rotation: RefreshRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn logout(mut self, logout: Arc<dyn LogoutTrigger>) -> Self {
        self.logout = Some(logout);
        self
    }

    /// Fails if the store, transport or logout trigger is missing.
    pub fn build(self) -> anyhow::Result<SessionClient> {
        let store = self.store.ok_or_else(|| anyhow::anyhow!("credential store not set"))?;
        let transport = self.transport.ok_or_else(|| anyhow::anyhow!("transport not set"))?;
        let logout = self.logout.ok_or_else(|| anyhow::anyhow!("logout trigger not set"))?;

        let login_url = config::resolve(&self.base_url, &self.login_path)?;
        let refresh_url = config::resolve(&self.base_url, &self.refresh_path)?;
        let credentials = Credentials::new(store);
        let coordinator = RefreshCoordinator::new(
            credentials.clone(),
            Arc::clone(&transport),
            refresh_url,
            self.rotation,
        );

        Ok(SessionClient {
            base_url: self.base_url,
            login_url,
            transport,
            credentials,
            coordinator,
            logout,
        })
    }
}
