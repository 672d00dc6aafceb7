//! Authentication state: stored credentials, renewal, and forced logout.
//!
//! This module provides:
//! - `CredentialStore`: persistent storage for the access/refresh pair
//!   (OS keychain, JSON file, or memory)
//! - `Credentials`: the typed, epoch-tracked view over a store
//! - `RefreshCoordinator`: single-flight renewal of the access credential
//! - `LogoutTrigger`: what happens when the session cannot be renewed

pub mod credentials;
pub mod logout;
pub mod refresh;
pub mod session;

pub use credentials::{
    CredentialKey, CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore, StoreError,
};
pub use logout::{CountingLogout, LogoutTrigger};
pub use refresh::{RefreshCoordinator, RefreshFailure, RefreshOutcome, RefreshRotation};
pub use session::{CredentialPair, Credentials, SessionStatus};
