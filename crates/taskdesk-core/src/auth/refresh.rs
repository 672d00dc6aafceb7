//! Single-flight renewal of the access credential.
//!
//! At most one refresh request is outstanding at any time. Every caller that
//! asks for a new credential while a refresh is running waits on that same
//! refresh and receives its outcome, so one expiry costs one refresh call no
//! matter how many requests noticed it.
//!
//! The refresh itself runs on its own task. Dropping a waiter, including the
//! one that started the refresh, never cancels it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::{CredentialPair, Credentials};
use crate::api::{RequestDescriptor, Transport, TransportError};

/// How the refresh endpoint treats the refresh credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshRotation {
    /// Ignore any refresh credential in the response and keep the stored one.
    Never,
    /// Store a new refresh credential when the response carries one.
    #[default]
    WhenProvided,
    /// Every response must carry a new refresh credential.
    Always,
}

/// Why a new access credential could not be obtained. Always terminal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh credential stored")]
    NoRefreshCredential,

    #[error("refresh rejected with status {0}")]
    Rejected(u16),

    #[error("refresh request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed refresh response: {0}")]
    MalformedPayload(String),

    #[error("credential store failure during refresh: {0}")]
    Store(String),

    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

pub type RefreshOutcome = Result<CredentialPair, RefreshFailure>;

type SharedOutcome = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Body returned by both the login and the refresh endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) access: Option<String>,
    pub(crate) refresh: Option<String>,
}

struct Flight {
    id: u64,
    outcome: SharedOutcome,
}

/// The most recent flight to finish, and the refresh credential it used.
struct Finished {
    id: u64,
    refresh: String,
    outcome: RefreshOutcome,
}

#[derive(Default)]
struct FlightState {
    current: Option<Flight>,
    last: Option<Finished>,
}

impl FlightState {
    fn last_id(&self) -> Option<u64> {
        self.last.as_ref().map(|finished| finished.id)
    }
}

/// Clone is cheap and every clone coordinates with the others.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    endpoint: Url,
    rotation: RefreshRotation,
    // Never held across store I/O or an await
    flights: Mutex<FlightState>,
    flights_started: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        credentials: Credentials,
        transport: Arc<dyn Transport>,
        endpoint: Url,
        rotation: RefreshRotation,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                credentials,
                transport,
                endpoint,
                rotation,
                flights: Mutex::new(FlightState::default()),
                flights_started: AtomicU64::new(0),
            }),
        }
    }

    /// Number of refresh requests issued so far.
    pub fn refresh_calls(&self) -> u64 {
        self.inner.flights_started.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.state().current.is_some()
    }

    /// Get a new access credential, joining the refresh in flight if there
    /// is one. Must be called from within a tokio runtime.
    ///
    /// Without a stored refresh credential this fails immediately and makes
    /// no network call. A refresh credential the endpoint already refused
    /// is not sent again; the earlier failure is returned instead.
    pub async fn obtain_new_credential(&self) -> RefreshOutcome {
        self.obtain(|_| false).await
    }

    /// Replace an access credential the backend rejected. If the store
    /// already holds a different one, that is the answer and no refresh is
    /// made.
    pub(crate) async fn replace_rejected(&self, rejected: Option<&str>) -> RefreshOutcome {
        self.obtain(|stored| Some(stored) != rejected).await
    }

    async fn obtain(&self, already_renewed: impl Fn(&str) -> bool) -> RefreshOutcome {
        let (joined, seen) = {
            let state = self.inner.state();
            let joined = state.current.as_ref().map(|flight| {
                debug!(flight = flight.id, "Refresh already in flight, waiting on it");
                flight.outcome.clone()
            });
            (joined, state.last_id())
        };
        if let Some(outcome) = joined {
            return outcome.await;
        }

        let (access, refresh) = self
            .inner
            .credentials
            .run_blocking(|c| Ok((c.access()?, c.refresh()?)))
            .await
            .map_err(|e| RefreshFailure::Store(e.to_string()))?;

        if let Some(access) = access.filter(|a| already_renewed(a.as_str())) {
            debug!("Credential already renewed, skipping refresh");
            return Ok(CredentialPair { access, refresh });
        }

        let outcome = self.join_or_start(seen, refresh)?;
        outcome.await
    }

    /// `seen` is the last finished flight before the credentials were read.
    fn join_or_start(&self, seen: Option<u64>, refresh: Option<String>) -> Result<SharedOutcome, RefreshFailure> {
        let mut state = self.inner.state();
        if let Some(flight) = state.current.as_ref() {
            debug!(flight = flight.id, "Refresh already in flight, waiting on it");
            return Ok(flight.outcome.clone());
        }

        if let Some(last) = state.last.as_ref() {
            // A flight finished while the credentials were being read
            if Some(last.id) != seen {
                debug!(flight = last.id, "Refresh finished meanwhile, using its outcome");
                return Ok(futures::future::ready(last.outcome.clone()).boxed().shared());
            }
            if let Err(failure) = &last.outcome {
                if refresh.as_deref() == Some(last.refresh.as_str()) {
                    debug!(flight = last.id, "Refresh credential already refused, not sending it again");
                    return Err(failure.clone());
                }
            }
        }

        let refresh = refresh.ok_or_else(|| {
            debug!("No refresh credential, cannot renew session");
            RefreshFailure::NoRefreshCredential
        })?;

        let id = self.inner.flights_started.fetch_add(1, Ordering::SeqCst) + 1;
        info!(flight = id, "Refreshing access credential");

        let inner = Arc::clone(&self.inner);
        let sent = refresh.clone();
        let task = tokio::spawn(async move {
            let outcome = inner.refresh(&sent).await;
            inner.finish(id, &sent, outcome.clone());
            outcome
        });

        let inner = Arc::clone(&self.inner);
        let outcome = async move {
            let outcome = task
                .await
                .unwrap_or_else(|e| Err(RefreshFailure::Aborted(e.to_string())));
            // The task finishes its own flight; this covers a task that panicked
            inner.finish(id, &refresh, outcome.clone());
            outcome
        }
        .boxed()
        .shared();

        state.current = Some(Flight {
            id,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, FlightState> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh(&self, refresh: &str) -> RefreshOutcome {
        let request = RequestDescriptor::post(self.endpoint.clone())
            .with_json(&RefreshRequest { refresh })
            .map_err(|e| RefreshFailure::MalformedPayload(e.to_string()))?;

        let response = self.transport.execute(&request).await.map_err(|e| {
            warn!(error = %e, "Refresh request failed");
            RefreshFailure::from(e)
        })?;

        if !response.is_success() {
            warn!(status = response.status().as_u16(), "Refresh credential rejected");
            return Err(RefreshFailure::Rejected(response.status().as_u16()));
        }

        let body: TokenResponse = response
            .json()
            .map_err(|e| RefreshFailure::MalformedPayload(e.to_string()))?;
        let access = body
            .access
            .filter(|a| !a.is_empty())
            .ok_or_else(|| RefreshFailure::MalformedPayload("missing access credential".into()))?;
        let offered = body.refresh.filter(|r| !r.is_empty());

        let rotated = match self.rotation {
            RefreshRotation::Never => None,
            RefreshRotation::WhenProvided => offered,
            RefreshRotation::Always => Some(offered.ok_or_else(|| {
                RefreshFailure::MalformedPayload("expected a rotated refresh credential".into())
            })?),
        };

        // Persist before resolving so every waiter retries with the stored value
        let (stored_access, stored_refresh) = (access.clone(), rotated.clone());
        self.credentials
            .run_blocking(move |c| c.store_refreshed(&stored_access, stored_refresh.as_deref()))
            .await
            .map_err(|e| RefreshFailure::Store(e.to_string()))?;

        info!(rotated = rotated.is_some(), "Access credential refreshed");
        Ok(CredentialPair {
            access,
            refresh: Some(rotated.unwrap_or_else(|| refresh.to_string())),
        })
    }

    fn finish(&self, id: u64, refresh: &str, outcome: RefreshOutcome) {
        let mut state = self.state();
        if state.current.as_ref().is_some_and(|flight| flight.id == id) {
            state.current = None;
            state.last = Some(Finished {
                id,
                refresh: refresh.to_string(),
                outcome,
            });
            debug!(flight = id, "Refresh flight finished");
        }
    }
}
