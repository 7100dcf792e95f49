//! # Transport
//!
//! The seam between the governance layer and the remote chat API. The governor
//! treats a `Transport` as opaque I/O: it only cares whether a call succeeded,
//! was rate limited (with a retry-after), or failed some other way.
//!
//! - **Version**: 1.0.0
//! - **Since**: 1.0.0
//! - **Toggleable**: false

pub mod discord;

pub use discord::DiscordHttpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HTTP-style verb of an outbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Patch => write!(f, "PATCH"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// One outbound call: verb, route relative to the API base, optional JSON body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    pub route: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        ApiRequest {
            method,
            route: route.into(),
            body: None,
        }
    }

    pub fn get(route: impl Into<String>) -> Self {
        Self::new(Method::Get, route)
    }

    pub fn post(route: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Post, route).with_body(body)
    }

    pub fn put(route: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Put, route).with_body(body)
    }

    pub fn delete(route: impl Into<String>) -> Self {
        Self::new(Method::Delete, route)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

impl fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.route)
    }
}

/// Successful response from the remote API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<serde_json::Value>,
}

/// Non-success outcome of a transport call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote service asked us to slow down
    #[error("rate limited (global: {global}), retry after {retry_after:?}")]
    RateLimited { retry_after: Duration, global: bool },

    /// Anything else: network failure or a non-429 error status
    #[error("request failed: {message}")]
    Failure { status: Option<u16>, message: String },
}

/// Executes requests against the remote API
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_display() {
        let request = ApiRequest::post("/channels/1/messages", serde_json::json!({"content": "hi"}));
        assert_eq!(request.to_string(), "POST /channels/1/messages");
        assert!(request.body.is_some());
    }

    #[test]
    fn test_rate_limited_display() {
        let err = TransportError::RateLimited {
            retry_after: Duration::from_millis(50),
            global: false,
        };
        assert!(err.to_string().contains("retry after 50ms"));
    }
}
