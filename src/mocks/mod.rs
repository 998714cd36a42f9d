//! Test doubles for dependency injection
//!
//! Provides in-memory implementations of all external dependencies for isolated testing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::traits::{OutboundRequest, WebhookClient, WebhookError, WebhookResponse};

// Re-export the store's in-memory implementation
pub use crate::ledger::SqliteRegistrationStore as InMemoryStore;

// ============================================================================
// RecordedWebhookClient
// ============================================================================

/// One request as seen by the recorded client
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: OutboundRequest,
    /// Tokio clock at the moment the request arrived (virtual under paused time)
    pub at: Instant,
}

impl RecordedRequest {
    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    /// Body parsed as JSON; `Value::Null` if it is not JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.request.body).unwrap_or(serde_json::Value::Null)
    }
}

type Responder = Arc<dyn Fn(&OutboundRequest) -> Result<WebhookResponse, WebhookError> + Send + Sync>;

/// Failure configuration for webhook client
#[derive(Clone)]
pub enum WebhookBehavior {
    /// Always succeed with given status code
    AlwaysSucceed(u16),
    /// Fail N times, then succeed
    FailThenSucceed { fail_count: usize, error: WebhookError },
    /// Always fail with given error
    AlwaysFail(WebhookError),
    /// Custom response based on request
    Custom(Responder),
}

impl fmt::Debug for WebhookBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookBehavior::AlwaysSucceed(status) => f.debug_tuple("AlwaysSucceed").field(status).finish(),
            WebhookBehavior::FailThenSucceed { fail_count, error } => f
                .debug_struct("FailThenSucceed")
                .field("fail_count", fail_count)
                .field("error", error)
                .finish(),
            WebhookBehavior::AlwaysFail(error) => f.debug_tuple("AlwaysFail").field(error).finish(),
            WebhookBehavior::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn ok_response(status: u16) -> WebhookResponse {
    WebhookResponse {
        status,
        duration_ms: 10,
    }
}

/// Recorded webhook client for testing
///
/// Records all requests and provides configurable responses. Per-URL latency
/// is simulated with `tokio::time::sleep`, so it composes with paused time.
#[derive(Clone)]
pub struct RecordedWebhookClient {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    behavior: Arc<Mutex<WebhookBehavior>>,
    latency: Arc<Mutex<HashMap<String, Duration>>>,
    call_count: Arc<Mutex<usize>>,
}

impl RecordedWebhookClient {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(Mutex::new(WebhookBehavior::AlwaysSucceed(200))),
            latency: Arc::new(Mutex::new(HashMap::new())),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Always succeed with 200 OK
    pub fn success() -> Self {
        Self::new()
    }

    /// Fail N times, then succeed
    pub fn fail_then_succeed(fail_count: usize, error: WebhookError) -> Self {
        let client = Self::new();
        client.set_behavior(WebhookBehavior::FailThenSucceed { fail_count, error });
        client
    }

    /// Always fail with given error
    pub fn always_fail(error: WebhookError) -> Self {
        let client = Self::new();
        client.set_behavior(WebhookBehavior::AlwaysFail(error));
        client
    }

    /// Respond per request
    pub fn custom<F>(responder: F) -> Self
    where
        F: Fn(&OutboundRequest) -> Result<WebhookResponse, WebhookError> + Send + Sync + 'static,
    {
        let client = Self::new();
        client.set_behavior(WebhookBehavior::Custom(Arc::new(responder)));
        client
    }

    /// Delay every response for `url` by `delay`
    pub fn with_latency(self, url: &str, delay: Duration) -> Self {
        self.latency.lock().unwrap().insert(url.to_string(), delay);
        self
    }

    /// Set the behavior for subsequent calls
    pub fn set_behavior(&self, behavior: WebhookBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Get all recorded requests
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Recorded requests for one URL, in arrival order
    pub fn requests_to(&self, url: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.request.url == url)
            .cloned()
            .collect()
    }

    /// Get number of calls made
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Clear recorded requests
    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
        *self.call_count.lock().unwrap() = 0;
    }

    /// Record a request and determine response
    fn record_and_respond(&self, request: &OutboundRequest) -> Result<WebhookResponse, WebhookError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            request: request.clone(),
            at: Instant::now(),
        });

        let mut count = self.call_count.lock().unwrap();
        *count += 1;
        let current_count = *count;
        drop(count);

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            WebhookBehavior::AlwaysSucceed(status) => Ok(ok_response(status)),
            WebhookBehavior::FailThenSucceed { fail_count, error } => {
                if current_count <= fail_count {
                    Err(error)
                } else {
                    Ok(ok_response(200))
                }
            }
            WebhookBehavior::AlwaysFail(error) => Err(error),
            WebhookBehavior::Custom(func) => func(request),
        }
    }
}

impl Default for RecordedWebhookClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookClient for RecordedWebhookClient {
    async fn send(&self, request: &OutboundRequest) -> Result<WebhookResponse, WebhookError> {
        let delay = self.latency.lock().unwrap().get(&request.url).copied();
        let result = self.record_and_respond(request);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

// ============================================================================
// Tests
// ============================================================================
