//! Immutable description of one logical API request.
//!
//! A descriptor is never mutated once built. Attaching a bearer credential or
//! marking a request as retried produces a new descriptor, so concurrent
//! holders of the original never observe the change.

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::Serialize;

use super::ApiError;

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    retried: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: Url) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: Url) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Add a header. Values that are not valid header text are rejected.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Result<Self, ApiError> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid value for {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Serialize `body` as the JSON payload of this request.
    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ApiError::InvalidRequest(format!("failed to encode JSON body: {}", e)))?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(bytes);
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// The resubmission of this request. Only ever produced once per logical
    /// request by the session client.
    pub fn retry(&self) -> Self {
        Self {
            retried: true,
            ..self.clone()
        }
    }

    /// Copy of this request carrying exactly the given bearer credential.
    ///
    /// Any `Authorization` header set by the caller is dropped: the session
    /// layer is the only source of bearer credentials on the wire.
    pub(crate) fn with_bearer(&self, access: Option<&str>) -> Result<Self, ApiError> {
        let mut headers = self.headers.clone();
        headers.remove(header::AUTHORIZATION);
        if let Some(token) = access {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidRequest("access credential is not valid header text".into()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(Self {
            headers,
            ..self.clone()
        })
    }
}
