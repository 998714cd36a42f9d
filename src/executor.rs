//! Single-attempt delivery
//!
//! Validates a registration, renders and signs the body, performs one HTTP
//! call and classifies what came back. No bookkeeping happens here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::json;

use crate::models::{DeliveryOutcome, DeliveryTask, DomainEvent, EventType, WebhookRegistration};
use crate::signer;
use crate::template::{self, RenderContext};
use crate::traits::{OutboundRequest, WebhookAuth, WebhookClient, WebhookError};

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const DEFAULT_TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const EVENT_ID_HEADER: &str = "X-Webhook-Id";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Classified result of one HTTP attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Any 2xx
    Success { status_code: u16 },
    /// Timeout, connection failure, 5xx or 429
    Retryable {
        status_code: Option<u16>,
        reason: String,
    },
    /// Any other non-2xx response
    Fatal { status_code: u16, reason: String },
    /// Rejected before the network was touched
    ConfigurationFatal { reason: String },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AttemptOutcome::Retryable { .. })
    }

    /// Terminal outcome recorded once the task stops
    pub fn to_delivery_outcome(&self) -> DeliveryOutcome {
        match self {
            AttemptOutcome::Success { status_code } => DeliveryOutcome::success(*status_code),
            AttemptOutcome::Retryable { status_code, reason } => {
                DeliveryOutcome::failure(*status_code, reason.clone())
            }
            AttemptOutcome::Fatal { status_code, reason } => {
                DeliveryOutcome::failure(Some(*status_code), reason.clone())
            }
            AttemptOutcome::ConfigurationFatal { reason } => {
                DeliveryOutcome::failure(None, format!("configuration error: {reason}"))
            }
        }
    }
}

fn http_reason(code: u16) -> String {
    let canonical = StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason());
    match canonical {
        Some(text) => format!("HTTP {code} {text}"),
        None => format!("HTTP {code}"),
    }
}

/// Map a client result onto the retry taxonomy
pub fn classify(result: Result<u16, WebhookError>, timeout: Duration) -> AttemptOutcome {
    match result {
        Ok(status_code) => AttemptOutcome::Success { status_code },
        Err(WebhookError::HttpError(code)) if code == 429 || code >= 500 => AttemptOutcome::Retryable {
            status_code: Some(code),
            reason: http_reason(code),
        },
        Err(WebhookError::HttpError(code)) => AttemptOutcome::Fatal {
            status_code: code,
            reason: http_reason(code),
        },
        Err(WebhookError::Timeout) => AttemptOutcome::Retryable {
            status_code: None,
            reason: format!("timed out after {}s", timeout.as_secs()),
        },
        Err(WebhookError::NetworkError(e)) => AttemptOutcome::Retryable {
            status_code: None,
            reason: e,
        },
        Err(e @ (WebhookError::InvalidUrl(_) | WebhookError::InvalidHeader(_))) => {
            AttemptOutcome::ConfigurationFatal { reason: e.to_string() }
        }
    }
}

pub struct DeliveryExecutor {
    client: Arc<dyn WebhookClient>,
    signature_header: String,
    timestamp_header: String,
}

impl DeliveryExecutor {
    pub fn new(client: Arc<dyn WebhookClient>) -> Self {
        Self {
            client,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            timestamp_header: DEFAULT_TIMESTAMP_HEADER.to_string(),
        }
    }

    pub fn with_header_names(mut self, signature: impl Into<String>, timestamp: impl Into<String>) -> Self {
        self.signature_header = signature.into();
        self.timestamp_header = timestamp.into();
        self
    }

    fn is_reserved(&self, name: &str) -> bool {
        [
            "content-type",
            "content-length",
            "host",
            self.signature_header.as_str(),
            self.timestamp_header.as_str(),
            EVENT_HEADER,
            EVENT_ID_HEADER,
            ATTEMPT_HEADER,
        ]
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
    }

    /// Build the signed request for one attempt.
    ///
    /// Every error is a configuration problem: bad URL or scheme, invalid
    /// header, template failure or unusable secret.
    pub fn prepare(
        &self,
        registration: &WebhookRegistration,
        event: &DomainEvent,
        attempt: u32,
    ) -> Result<OutboundRequest, String> {
        let url = reqwest::Url::parse(&registration.url).map_err(|e| format!("invalid URL: {e}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("unsupported URL scheme: {}", url.scheme()));
        }
        if url.host_str().is_none() {
            return Err("URL has no host".to_string());
        }

        HeaderValue::from_str(&registration.content_type)
            .map_err(|_| format!("invalid content type: {}", registration.content_type))?;
        if let WebhookAuth::Header { name, value } = &registration.auth {
            validate_header(name, value)?;
            if self.is_reserved(name) {
                return Err(format!("auth header {name} overrides a reserved header"));
            }
        }

        let ctx = RenderContext {
            event,
            registration,
            attempt,
        };
        let body = template::render_body(&ctx).map_err(|e| e.to_string())?;

        let signature = signer::sign(registration.secret.as_deref(), body.as_bytes(), Utc::now().timestamp())
            .map_err(|e| e.to_string())?;

        let mut headers = vec![
            ("Content-Type".to_string(), registration.content_type.clone()),
            (self.signature_header.clone(), signature.value),
            (self.timestamp_header.clone(), signature.timestamp.to_string()),
            (EVENT_HEADER.to_string(), event.event_type.as_str().to_string()),
            (EVENT_ID_HEADER.to_string(), event.id.to_string()),
            (ATTEMPT_HEADER.to_string(), attempt.to_string()),
        ];

        for (name, value) in &registration.custom_headers {
            validate_header(name, value)?;
            if self.is_reserved(name) {
                tracing::warn!(
                    registration_id = %registration.id,
                    header = %name,
                    "Ignoring custom header that overrides a reserved header"
                );
                continue;
            }
            headers.push((name.clone(), value.clone()));
        }

        Ok(OutboundRequest {
            url: registration.url.clone(),
            method: registration.method,
            headers,
            auth: registration.auth.clone(),
            body: body.into_bytes(),
            timeout: Duration::from_secs(registration.timeout_seconds.max(1)),
        })
    }

    /// Perform one attempt of `task` against `registration`
    pub async fn attempt(&self, registration: &WebhookRegistration, task: &DeliveryTask) -> AttemptOutcome {
        let request = match self.prepare(registration, &task.event, task.attempt) {
            Ok(request) => request,
            Err(reason) => {
                tracing::warn!(
                    registration_id = %registration.id,
                    event_id = %task.event.id,
                    reason = %reason,
                    "Delivery rejected before sending"
                );
                return AttemptOutcome::ConfigurationFatal { reason };
            }
        };

        let result = self.client.send(&request).await.map(|response| response.status);
        let outcome = classify(result, request.timeout);

        match &outcome {
            AttemptOutcome::Success { status_code } => tracing::debug!(
                registration_id = %registration.id,
                event_id = %task.event.id,
                attempt = task.attempt,
                status = status_code,
                "Attempt delivered"
            ),
            other => tracing::warn!(
                registration_id = %registration.id,
                event_id = %task.event.id,
                attempt = task.attempt,
                outcome = ?other,
                "Attempt failed"
            ),
        }
        outcome
    }

    /// Send one signed `system.test` event. Nothing is recorded.
    pub async fn probe(&self, registration: &WebhookRegistration) -> AttemptOutcome {
        let event = DomainEvent::new(
            registration.tenant_id,
            EventType::SystemTest,
            json!({
                "test": true,
                "message": "HookRelay connectivity test",
                "registration_id": registration.id,
            }),
        );
        tracing::info!(registration_id = %registration.id, url = %registration.url, "Probing webhook endpoint");
        let task = DeliveryTask::new(registration.id, event);
        self.attempt(registration, &task).await
    }
}

fn validate_header(name: &str, value: &str) -> Result<(), String> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("invalid header name: {name:?}"))?;
    HeaderValue::from_str(value).map_err(|_| format!("invalid value for header {name}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockWebhookClient, WebhookResponse};
    use uuid::Uuid;

    fn registration() -> WebhookRegistration {
        WebhookRegistration::new(
            Uuid::new_v4(),
            "https://hooks.example.com/in",
            EventType::ContractUpdated,
            Some("whsec_test".into()),
        )
    }

    fn task_for(reg: &WebhookRegistration) -> DeliveryTask {
        let event = DomainEvent::new(reg.tenant_id, EventType::ContractUpdated, json!({"id": "C-1"}));
        DeliveryTask::new(reg.id, event)
    }

    fn ok(status: u16) -> Result<WebhookResponse, WebhookError> {
        Ok(WebhookResponse { status, duration_ms: 3 })
    }

    fn executor(mock: MockWebhookClient) -> DeliveryExecutor {
        DeliveryExecutor::new(Arc::new(mock))
    }

    #[test]
    fn test_classification() {
        let t = Duration::from_secs(30);
        assert_eq!(classify(Ok(204), t), AttemptOutcome::Success { status_code: 204 });
        assert!(classify(Err(WebhookError::HttpError(503)), t).is_retryable());
        assert!(classify(Err(WebhookError::HttpError(429)), t).is_retryable());
        assert!(classify(Err(WebhookError::Timeout), t).is_retryable());
        assert!(classify(Err(WebhookError::NetworkError("refused".into())), t).is_retryable());
        assert!(matches!(
            classify(Err(WebhookError::HttpError(404)), t),
            AttemptOutcome::Fatal { status_code: 404, .. }
        ));
        assert!(matches!(
            classify(Err(WebhookError::HttpError(301)), t),
            AttemptOutcome::Fatal { status_code: 301, .. }
        ));
        assert!(matches!(
            classify(Err(WebhookError::InvalidUrl("x".into())), t),
            AttemptOutcome::ConfigurationFatal { .. }
        ));
    }

    #[test]
    fn test_fatal_reason_uses_canonical_text() {
        let outcome = classify(Err(WebhookError::HttpError(404)), Duration::from_secs(1));
        assert_eq!(
            outcome,
            AttemptOutcome::Fatal {
                status_code: 404,
                reason: "HTTP 404 Not Found".into()
            }
        );
        match outcome.to_delivery_outcome() {
            DeliveryOutcome::Failure { status_code, reason, .. } => {
                assert_eq!(status_code, Some(404));
                assert_eq!(reason, "HTTP 404 Not Found");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_prepare_builds_signed_request() {
        let reg = registration().with_header("X-Tenant", "acme");
        let task = task_for(&reg);
        let exec = executor(MockWebhookClient::new());

        let request = exec.prepare(&reg, &task.event, 2).unwrap();
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("x-webhook-event"), Some("contract.updated"));
        assert_eq!(request.header("X-Webhook-Id"), Some(task.event.id.to_string().as_str()));
        assert_eq!(request.header("X-Webhook-Attempt"), Some("2"));
        assert_eq!(request.header("X-Tenant"), Some("acme"));
        assert_eq!(request.timeout, Duration::from_secs(30));

        let ts: i64 = request.header(DEFAULT_TIMESTAMP_HEADER).unwrap().parse().unwrap();
        let sig = request.header(DEFAULT_SIGNATURE_HEADER).unwrap();
        assert!(signer::verify(sig, "whsec_test", ts, &request.body, ts, 300));
    }

    #[test]
    fn test_custom_headers_cannot_override_reserved() {
        let reg = registration()
            .with_header("x-webhook-signature", "forged")
            .with_header("Content-Type", "text/plain");
        let task = task_for(&reg);
        let exec = executor(MockWebhookClient::new());

        let request = exec.prepare(&reg, &task.event, 1).unwrap();
        let signatures: Vec<_> = request
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(DEFAULT_SIGNATURE_HEADER))
            .collect();
        assert_eq!(signatures.len(), 1);
        assert!(signatures[0].1.starts_with("sha256="));
        assert_eq!(request.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_auth_header_cannot_override_reserved() {
        for name in ["X-Webhook-Signature", "content-type", "X-Webhook-Attempt"] {
            let mut mock = MockWebhookClient::new();
            mock.expect_send().times(0);
            let reg = registration().with_auth(WebhookAuth::Header {
                name: name.into(),
                value: "sha256=forged".into(),
            });
            let task = task_for(&reg);
            let exec = executor(mock);

            let err = exec.prepare(&reg, &task.event, 1).unwrap_err();
            assert!(err.contains("reserved"), "unexpected error: {err}");
            assert!(matches!(
                exec.attempt(&reg, &task).await,
                AttemptOutcome::ConfigurationFatal { .. }
            ));
        }
    }

    #[test]
    fn test_auth_header_follows_configured_signature_name() {
        let reg = registration().with_auth(WebhookAuth::Header {
            name: "X-Webhook-Signature".into(),
            value: "token".into(),
        });
        let task = task_for(&reg);

        let exec = executor(MockWebhookClient::new()).with_header_names("X-Sig", "X-Sig-Time");
        assert!(exec.prepare(&reg, &task.event, 1).is_ok());

        let exec = executor(MockWebhookClient::new()).with_header_names("x-webhook-signature", "X-Sig-Time");
        assert!(exec.prepare(&reg, &task.event, 1).is_err());
    }

    #[test]
    fn test_custom_signature_header_names() {
        let reg = registration();
        let task = task_for(&reg);
        let exec = executor(MockWebhookClient::new()).with_header_names("X-Sig", "X-Sig-Time");
        let request = exec.prepare(&reg, &task.event, 1).unwrap();
        assert!(request.header("X-Sig").is_some());
        assert!(request.header("X-Sig-Time").is_some());
        assert!(request.header(DEFAULT_SIGNATURE_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_success() {
        let mut mock = MockWebhookClient::new();
        mock.expect_send().times(1).returning(|_| ok(200));
        let reg = registration();
        let outcome = executor(mock).attempt(&reg, &task_for(&reg)).await;
        assert_eq!(outcome, AttemptOutcome::Success { status_code: 200 });
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut mock = MockWebhookClient::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Err(WebhookError::HttpError(502)));
        let reg = registration();
        let outcome = executor(mock).attempt(&reg, &task_for(&reg)).await;
        assert_eq!(
            outcome,
            AttemptOutcome::Retryable {
                status_code: Some(502),
                reason: "HTTP 502 Bad Gateway".into()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_secret_never_sends() {
        let mut mock = MockWebhookClient::new();
        mock.expect_send().times(0);
        let mut reg = registration();
        reg.secret = None;
        let outcome = executor(mock).attempt(&reg, &task_for(&reg)).await;
        assert!(matches!(outcome, AttemptOutcome::ConfigurationFatal { .. }));
    }

    #[tokio::test]
    async fn test_bad_configuration_never_sends() {
        let cases: Vec<Box<dyn Fn(&mut WebhookRegistration)>> = vec![
            Box::new(|r: &mut WebhookRegistration| r.url = "not a url".into()),
            Box::new(|r: &mut WebhookRegistration| r.url = "ftp://example.com/hook".into()),
            Box::new(|r: &mut WebhookRegistration| r.secret = Some("  ".into())),
            Box::new(|r: &mut WebhookRegistration| {
                r.custom_headers.insert("Bad Header".into(), "v".into());
            }),
            Box::new(|r: &mut WebhookRegistration| {
                r.custom_headers.insert("X-Ok".into(), "line\nbreak".into());
            }),
            Box::new(|r: &mut WebhookRegistration| r.payload_template = Some("{{event.nope}}".into())),
            Box::new(|r: &mut WebhookRegistration| {
                r.auth = WebhookAuth::Header {
                    name: "Bad:Name".into(),
                    value: "v".into(),
                }
            }),
        ];

        for mutate in cases {
            let mut mock = MockWebhookClient::new();
            mock.expect_send().times(0);
            let mut reg = registration();
            mutate(&mut reg);
            let outcome = executor(mock).attempt(&reg, &task_for(&reg)).await;
            assert!(
                matches!(outcome, AttemptOutcome::ConfigurationFatal { .. }),
                "expected configuration error, got {outcome:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_request_uses_registration_method_and_auth() {
        let mut mock = MockWebhookClient::new();
        mock.expect_send()
            .withf(|req: &OutboundRequest| {
                req.method == crate::models::HttpMethod::Put
                    && req.auth == WebhookAuth::Bearer { token: "t".into() }
                    && req.url == "https://hooks.example.com/in"
            })
            .times(1)
            .returning(|_| ok(201));

        let mut reg = registration().with_auth(WebhookAuth::Bearer { token: "t".into() });
        reg.method = crate::models::HttpMethod::Put;
        let outcome = executor(mock).attempt(&reg, &task_for(&reg)).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_probe_sends_system_test_event() {
        let mut mock = MockWebhookClient::new();
        mock.expect_send()
            .withf(|req: &OutboundRequest| req.header(EVENT_HEADER) == Some("system.test"))
            .times(1)
            .returning(|_| ok(200));
        let reg = registration();
        assert!(executor(mock).probe(&reg).await.is_success());
    }
}
