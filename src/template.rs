//! Payload rendering
//!
//! Registrations may carry a template with a fixed placeholder grammar.
//! String placeholders are inserted JSON-escaped without surrounding quotes,
//! so authors write `"{{event.id}}"`; `{{payload}}` is inserted as raw JSON.
//! Without a template the body is the default envelope.

use std::sync::LazyLock;

use chrono::SecondsFormat;
use regex::Regex;
use serde_json::json;
use thiserror::Error;

use crate::models::{DomainEvent, WebhookRegistration};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_.]+)\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Unknown placeholder: {{{{{0}}}}}")]
    UnknownPlaceholder(String),
    #[error("Unterminated placeholder at byte {0}")]
    Unterminated(usize),
    #[error("Payload serialization failed: {0}")]
    Serialization(String),
}

/// Everything a placeholder can refer to
pub struct RenderContext<'a> {
    pub event: &'a DomainEvent,
    pub registration: &'a WebhookRegistration,
    pub attempt: u32,
}

fn escape(value: &str) -> Result<String, TemplateError> {
    let quoted = serde_json::to_string(value).map_err(|e| TemplateError::Serialization(e.to_string()))?;
    Ok(quoted[1..quoted.len() - 1].to_string())
}

fn resolve(name: &str, ctx: &RenderContext<'_>) -> Result<String, TemplateError> {
    let event = ctx.event;
    let raw = match name {
        "payload" => {
            return serde_json::to_string(&event.payload)
                .map_err(|e| TemplateError::Serialization(e.to_string()));
        }
        "event.id" => event.id.to_string(),
        "event.type" => event.event_type.as_str().to_string(),
        "event.tenant_id" => event.tenant_id.to_string(),
        "event.occurred_at" => event.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "event.entity_type" => event
            .entity
            .as_ref()
            .map(|e| e.entity_type.clone())
            .unwrap_or_default(),
        "event.entity_id" => event
            .entity
            .as_ref()
            .map(|e| e.entity_id.clone())
            .unwrap_or_default(),
        "registration.id" => ctx.registration.id.to_string(),
        "delivery.attempt" => ctx.attempt.to_string(),
        other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
    };
    escape(&raw)
}

/// Substitute every placeholder in `template`
pub fn render_template(template: &str, ctx: &RenderContext<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 128);
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let literal = &template[last..whole.start()];
        if let Some(pos) = literal.find("{{") {
            return Err(TemplateError::Unterminated(last + pos));
        }
        out.push_str(literal);
        out.push_str(&resolve(name.as_str(), ctx)?);
        last = whole.end();
    }

    let rest = &template[last..];
    if let Some(pos) = rest.find("{{") {
        return Err(TemplateError::Unterminated(last + pos));
    }
    out.push_str(rest);
    Ok(out)
}

/// Default JSON envelope used when a registration has no template
pub fn default_envelope(event: &DomainEvent) -> Result<String, TemplateError> {
    let entity = event.entity.as_ref().map(|e| {
        json!({
            "type": e.entity_type,
            "id": e.entity_id,
        })
    });
    let body = json!({
        "id": event.id,
        "type": event.event_type.as_str(),
        "tenant_id": event.tenant_id,
        "occurred_at": event.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "entity": entity,
        "data": event.payload,
    });
    serde_json::to_string(&body).map_err(|e| TemplateError::Serialization(e.to_string()))
}

/// Request body for one attempt
pub fn render_body(ctx: &RenderContext<'_>) -> Result<String, TemplateError> {
    match ctx.registration.payload_template.as_deref() {
        Some(template) if !template.trim().is_empty() => render_template(template, ctx),
        _ => default_envelope(ctx.event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;
    use serde_json::Value;
    use uuid::Uuid;

    fn fixtures() -> (DomainEvent, WebhookRegistration) {
        let tenant = Uuid::new_v4();
        let event = DomainEvent::new(
            tenant,
            EventType::ContractUpdated,
            json!({"contract": "C-42", "note": "says \"hi\""}),
        )
        .with_entity("contract", "C-42");
        let reg = WebhookRegistration::new(tenant, "https://example.com", EventType::ContractUpdated, Some("k".into()));
        (event, reg)
    }

    #[test]
    fn test_default_envelope_shape() {
        let (event, reg) = fixtures();
        let ctx = RenderContext { event: &event, registration: &reg, attempt: 1 };
        let body: Value = serde_json::from_str(&render_body(&ctx).unwrap()).unwrap();

        assert_eq!(body["id"], event.id.to_string());
        assert_eq!(body["type"], "contract.updated");
        assert_eq!(body["tenant_id"], event.tenant_id.to_string());
        assert_eq!(body["entity"]["type"], "contract");
        assert_eq!(body["entity"]["id"], "C-42");
        assert_eq!(body["data"]["contract"], "C-42");
    }

    #[test]
    fn test_envelope_without_entity_has_null() {
        let (mut event, reg) = fixtures();
        event.entity = None;
        let ctx = RenderContext { event: &event, registration: &reg, attempt: 1 };
        let body: Value = serde_json::from_str(&render_body(&ctx).unwrap()).unwrap();
        assert!(body["entity"].is_null());
    }

    #[test]
    fn test_template_substitution() {
        let (event, reg) = fixtures();
        let reg = reg.with_template(
            r#"{"text": "{{event.type}} on {{ event.entity_id }}", "attempt": "{{delivery.attempt}}", "raw": {{payload}}}"#,
        );
        let ctx = RenderContext { event: &event, registration: &reg, attempt: 3 };
        let body: Value = serde_json::from_str(&render_body(&ctx).unwrap()).unwrap();

        assert_eq!(body["text"], "contract.updated on C-42");
        assert_eq!(body["attempt"], "3");
        assert_eq!(body["raw"]["note"], "says \"hi\"");
    }

    #[test]
    fn test_string_values_are_escaped() {
        let (event, reg) = fixtures();
        let event = event.with_entity("contract", "quote\"and\\slash");
        let ctx = RenderContext { event: &event, registration: &reg, attempt: 1 };
        let rendered = render_template(r#"{"id": "{{event.entity_id}}"}"#, &ctx).unwrap();
        let body: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(body["id"], "quote\"and\\slash");
    }

    #[test]
    fn test_unknown_placeholder_is_an_error() {
        let (event, reg) = fixtures();
        let ctx = RenderContext { event: &event, registration: &reg, attempt: 1 };
        assert_eq!(
            render_template("{{registration.secret}}", &ctx),
            Err(TemplateError::UnknownPlaceholder("registration.secret".into()))
        );
    }

    #[test]
    fn test_unterminated_placeholder_is_an_error() {
        let (event, reg) = fixtures();
        let ctx = RenderContext { event: &event, registration: &reg, attempt: 1 };
        assert!(matches!(
            render_template(r#"{"a": "{{event.id"}"#, &ctx),
            Err(TemplateError::Unterminated(_))
        ));
    }

    #[test]
    fn test_blank_template_falls_back_to_envelope() {
        let (event, reg) = fixtures();
        let reg = reg.with_template("   ");
        let ctx = RenderContext { event: &event, registration: &reg, attempt: 1 };
        let body: Value = serde_json::from_str(&render_body(&ctx).unwrap()).unwrap();
        assert_eq!(body["type"], "contract.updated");
    }
}
