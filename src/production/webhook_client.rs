//! Reqwest-based webhook client implementation

use std::time::Instant;

use reqwest::redirect::Policy;
use reqwest::{Client, Method};

use crate::models::HttpMethod;
use crate::traits::{OutboundRequest, WebhookAuth, WebhookClient, WebhookError, WebhookResponse};

pub struct ReqwestWebhookClient {
    client: Client,
}

impl ReqwestWebhookClient {
    /// Redirects are not followed: a 3xx is reported as the final status.
    /// Timeouts are per request, taken from the registration.
    pub fn new(user_agent: &str) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(Policy::none())
            .build()
            .map_err(|e| WebhookError::NetworkError(e.to_string()))?;

        tracing::debug!(user_agent, "Initialized webhook client");
        Ok(Self { client })
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder, auth: &WebhookAuth) -> reqwest::RequestBuilder {
        match auth {
            WebhookAuth::None => request,
            WebhookAuth::Header { name, value } => {
                tracing::debug!("Adding custom auth header: {}", name);
                request.header(name, value)
            }
            WebhookAuth::Bearer { token } => request.bearer_auth(token),
            WebhookAuth::Basic { username, password } => {
                tracing::debug!("Adding Basic auth for user: {}", username);
                request.basic_auth(username, Some(password))
            }
        }
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
        }
    }
}

#[async_trait::async_trait]
impl WebhookClient for ReqwestWebhookClient {
    async fn send(&self, request: &OutboundRequest) -> Result<WebhookResponse, WebhookError> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| WebhookError::InvalidUrl(e.to_string()))?;

        let mut builder = self
            .client
            .request(Self::method(request.method), url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let builder = self.apply_auth(builder, &request.auth);

        let start = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                tracing::debug!(url = %request.url, "Webhook timeout");
                WebhookError::Timeout
            } else if e.is_builder() {
                WebhookError::InvalidHeader(e.to_string())
            } else {
                tracing::debug!(url = %request.url, error = %e, "Network error");
                WebhookError::NetworkError(e.to_string())
            }
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        // Only the status decides the outcome; the body is dropped unread
        let status = response.status().as_u16();
        tracing::debug!(url = %request.url, status, duration_ms, "Webhook response");

        if !(200..300).contains(&status) {
            return Err(WebhookError::HttpError(status));
        }

        Ok(WebhookResponse { status, duration_ms })
    }
}
