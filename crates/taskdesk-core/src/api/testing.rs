//! Scripted in-process backend used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap};
use reqwest::{StatusCode, Url};
use tokio::sync::{Notify, Semaphore};

use super::{ApiResponse, RequestDescriptor, Transport, TransportError};
use crate::auth::{CredentialKey, CredentialStore, Credentials, MemoryCredentialStore, StoreError};

pub(crate) const BASE_URL: &str = "http://backend.test";
pub(crate) const REFRESH_PATH: &str = "/api/token/refresh/";

pub(crate) fn url(path: &str) -> Url {
    Url::parse(BASE_URL).and_then(|base| base.join(path)).unwrap()
}

/// What the refresh endpoint answers.
#[derive(Clone)]
pub(crate) enum RefreshReply {
    Grant {
        access: String,
        refresh: Option<String>,
    },
    Status(u16),
    Body(String),
    Fail(TransportError),
}

impl RefreshReply {
    pub(crate) fn grant(access: &str) -> Self {
        RefreshReply::Grant {
            access: access.to_string(),
            refresh: None,
        }
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Protected endpoints answer 200 only to `Bearer <valid_access>`, 401
/// otherwise. The refresh endpoint answers with the scripted reply and, on
/// a grant, makes the granted credential the valid one.
pub(crate) struct FakeBackend {
    valid_access: Mutex<String>,
    refresh_reply: Mutex<RefreshReply>,
    refresh_gate: Option<Semaphore>,
    protected_gate: Option<Semaphore>,
    pub(crate) refresh_started: Notify,
    refresh_calls: AtomicUsize,
    refresh_bodies: Mutex<Vec<serde_json::Value>>,
    protected_auth: Mutex<Vec<Option<String>>>,
    on_protected: Mutex<Option<Hook>>,
    reject_all: bool,
}

impl FakeBackend {
    pub(crate) fn new(valid_access: &str, reply: RefreshReply) -> Self {
        Self {
            valid_access: Mutex::new(valid_access.to_string()),
            refresh_reply: Mutex::new(reply),
            refresh_gate: None,
            protected_gate: None,
            refresh_started: Notify::new(),
            refresh_calls: AtomicUsize::new(0),
            refresh_bodies: Mutex::new(Vec::new()),
            protected_auth: Mutex::new(Vec::new()),
            on_protected: Mutex::new(None),
            reject_all: false,
        }
    }

    /// Refresh calls block until `release_refresh` is called.
    pub(crate) fn gated(mut self) -> Self {
        self.refresh_gate = Some(Semaphore::new(0));
        self
    }

    /// Protected calls are recorded on arrival, then block until
    /// `release_protected` lets them through.
    pub(crate) fn holding_protected(mut self) -> Self {
        self.protected_gate = Some(Semaphore::new(0));
        self
    }

    /// Protected endpoints answer 401 to everything.
    pub(crate) fn rejecting_all(mut self) -> Self {
        self.reject_all = true;
        self
    }

    /// Run `hook` while handling the next protected call, before answering.
    pub(crate) fn on_next_protected(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_protected.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn release_refresh(&self) {
        if let Some(gate) = &self.refresh_gate {
            gate.add_permits(1);
        }
    }

    pub(crate) fn release_protected(&self, calls: usize) {
        if let Some(gate) = &self.protected_gate {
            gate.add_permits(calls);
        }
    }

    /// Wait until `calls` protected calls have arrived.
    pub(crate) async fn protected_arrived(&self, calls: usize) {
        while self.protected_calls() < calls {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_bodies(&self) -> Vec<serde_json::Value> {
        self.refresh_bodies.lock().unwrap().clone()
    }

    /// Authorization header of every protected call, in arrival order.
    pub(crate) fn protected_auth(&self) -> Vec<Option<String>> {
        self.protected_auth.lock().unwrap().clone()
    }

    pub(crate) fn protected_calls(&self) -> usize {
        self.protected_auth.lock().unwrap().len()
    }

    async fn handle_refresh(&self, request: &RequestDescriptor) -> Result<ApiResponse, TransportError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let body = request
            .body()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(serde_json::Value::Null);
        self.refresh_bodies.lock().unwrap().push(body);
        self.refresh_started.notify_one();

        if let Some(gate) = &self.refresh_gate {
            gate.acquire().await.unwrap().forget();
        }

        let reply = self.refresh_reply.lock().unwrap().clone();
        match reply {
            RefreshReply::Grant { access, refresh } => {
                *self.valid_access.lock().unwrap() = access.clone();
                let mut body = serde_json::json!({ "access": access });
                if let Some(refresh) = refresh {
                    body["refresh"] = serde_json::Value::String(refresh);
                }
                Ok(json_response(StatusCode::OK, &body))
            }
            RefreshReply::Status(code) => Ok(json_response(
                StatusCode::from_u16(code).unwrap(),
                &serde_json::json!({ "detail": "Token is invalid or expired" }),
            )),
            RefreshReply::Body(raw) => Ok(ApiResponse::new(StatusCode::OK, HeaderMap::new(), raw.into_bytes())),
            RefreshReply::Fail(err) => Err(err),
        }
    }

    async fn handle_protected(&self, request: &RequestDescriptor) -> ApiResponse {
        let auth = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.protected_auth.lock().unwrap().push(auth.clone());

        if let Some(gate) = &self.protected_gate {
            gate.acquire().await.unwrap().forget();
        }

        let hook = self.on_protected.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }

        let expected = format!("Bearer {}", self.valid_access.lock().unwrap());
        if self.reject_all || auth.as_deref() != Some(expected.as_str()) {
            return json_response(
                StatusCode::UNAUTHORIZED,
                &serde_json::json!({ "detail": "Given token not valid for any token type" }),
            );
        }
        json_response(
            StatusCode::OK,
            &serde_json::json!({ "path": request.url().path(), "method": request.method().as_str() }),
        )
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> ApiResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
    ApiResponse::new(status, headers, serde_json::to_vec(body).unwrap())
}

#[async_trait]
impl Transport for FakeBackend {
    async fn execute(&self, request: &RequestDescriptor) -> Result<ApiResponse, TransportError> {
        // Every call is a suspension point, like real I/O
        tokio::task::yield_now().await;
        if request.url().path() == REFRESH_PATH {
            self.handle_refresh(request).await
        } else {
            Ok(self.handle_protected(request).await)
        }
    }
}


/// Memory store whose first access-credential read, once armed, races a
/// refresh write from another thread against the reader.
pub(crate) struct RacingStore {
    inner: MemoryCredentialStore,
    rotated: (String, String),
    credentials: OnceLock<Credentials>,
    fired: AtomicBool,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RacingStore {
    /// The racing write stores `access` and `refresh` as a refresh result.
    pub(crate) fn new(inner: MemoryCredentialStore, access: &str, refresh: &str) -> Self {
        Self {
            inner,
            rotated: (access.to_string(), refresh.to_string()),
            credentials: OnceLock::new(),
            fired: AtomicBool::new(false),
            writer: Mutex::new(None),
        }
    }

    /// The writer goes through `credentials`, so it takes the epoch lock.
    pub(crate) fn arm(&self, credentials: Credentials) {
        let _ = self.credentials.set(credentials);
    }

    pub(crate) fn join_writer(&self) {
        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            writer.join().unwrap();
        }
    }
}

impl CredentialStore for RacingStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        let armed = self.credentials.get().filter(|_| key == CredentialKey::Access);
        if let Some(credentials) = armed {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let credentials = credentials.clone();
                let (access, refresh) = self.rotated.clone();
                let writer = thread::spawn(move || credentials.store_refreshed(&access, Some(&refresh)).unwrap());
                *self.writer.lock().unwrap() = Some(writer);
                // Room for the write to land unless the caller holds it off
                thread::sleep(Duration::from_millis(50));
            }
        }
        self.inner.get(key)
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value)
    }

    fn remove(&self, key: CredentialKey) -> Result<(), StoreError> {
        self.inner.remove(key)
    }

    fn name(&self) -> &str {
        "racing"
    }
}
