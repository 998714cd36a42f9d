//! Webhook client trait for HTTP delivery

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::HttpMethod;

#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("HTTP error: {0}")]
    HttpError(u16),
    #[error("Timeout")]
    Timeout,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
    pub duration_ms: u64,
}

/// Authentication configuration for webhooks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "header")]
    Header { name: String, value: String },
    #[serde(rename = "bearer")]
    Bearer { token: String },
    #[serde(rename = "basic")]
    Basic { username: String, password: String },
}

/// A fully rendered, signed request for one delivery attempt
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub method: HttpMethod,
    /// Content-Type, signature and custom headers, in send order
    pub headers: Vec<(String, String)>,
    pub auth: WebhookAuth,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl OutboundRequest {
    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Trait for webhook HTTP delivery
///
/// Production: reqwest HTTP client
/// Testing: Recorded responses
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait WebhookClient: Send + Sync {
    /// Perform exactly one HTTP request. Non-2xx responses are `HttpError`.
    async fn send(&self, request: &OutboundRequest) -> Result<WebhookResponse, WebhookError>;
}
