//! Core library for taskdesk.
//!
//! Every call to the task-management API goes through [`SessionClient`],
//! which keeps the bearer credential current: expired access credentials are
//! renewed once per expiry through [`RefreshCoordinator`], the failed call is
//! retried once, and an unrenewable session ends in a forced logout.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, ApiResponse, RequestDescriptor, ReqwestTransport, SessionClient, Transport, TransportError};
pub use auth::{
    CredentialKey, CredentialPair, CredentialStore, LogoutTrigger, RefreshCoordinator, RefreshFailure,
    RefreshRotation, SessionStatus,
};
pub use config::{Config, CredentialBackend};
pub use reqwest::{Method, StatusCode, Url};
