//! REST API access for the taskdesk backend.
//!
//! This module provides the `SessionClient`, the only way the rest of the
//! application talks to protected endpoints. It attaches the bearer
//! credential, refreshes it on 401 through the shared refresh coordinator,
//! and retries the failed call once.

pub mod client;
pub mod error;
pub mod request;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::SessionClient;
pub use error::{ApiError, TransportError};
pub use request::RequestDescriptor;
pub use transport::{ApiResponse, ReqwestTransport, Transport};
