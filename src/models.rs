//! Domain types shared by the delivery pipeline
//!
//! Registrations are tenant configuration plus runtime state; events are what
//! producers hand to the router; tasks are the ephemeral unit of delivery.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit::CircuitState;
use crate::ledger::DeliveryStats;
use crate::traits::WebhookAuth;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_DISABLE_AFTER_FAILURES: u32 = 10;
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Event types a registration can subscribe to.
///
/// The set is closed: producers cannot invent new types at runtime, and the
/// wire name (`contract.updated`, ...) is what receivers see in headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "opportunity.created")]
    OpportunityCreated,
    #[serde(rename = "opportunity.updated")]
    OpportunityUpdated,
    #[serde(rename = "opportunity.status_changed")]
    OpportunityStatusChanged,
    #[serde(rename = "pipeline.stage_changed")]
    PipelineStageChanged,
    #[serde(rename = "pipeline.deal_won")]
    PipelineDealWon,
    #[serde(rename = "pipeline.deal_lost")]
    PipelineDealLost,
    #[serde(rename = "contract.created")]
    ContractCreated,
    #[serde(rename = "contract.updated")]
    ContractUpdated,
    #[serde(rename = "contract.expiring")]
    ContractExpiring,
    #[serde(rename = "compliance.certification_expiring")]
    CertificationExpiring,
    #[serde(rename = "compliance.certification_expired")]
    CertificationExpired,
    #[serde(rename = "financial.invoice_created")]
    InvoiceCreated,
    #[serde(rename = "financial.invoice_status_changed")]
    InvoiceStatusChanged,
    #[serde(rename = "financial.payment_received")]
    PaymentReceived,
    #[serde(rename = "document.uploaded")]
    DocumentUploaded,
    #[serde(rename = "document.signed")]
    DocumentSigned,
    #[serde(rename = "crm.contact_created")]
    ContactCreated,
    #[serde(rename = "crm.contact_updated")]
    ContactUpdated,
    #[serde(rename = "system.test")]
    SystemTest,
}

impl EventType {
    pub const ALL: [EventType; 19] = [
        EventType::OpportunityCreated,
        EventType::OpportunityUpdated,
        EventType::OpportunityStatusChanged,
        EventType::PipelineStageChanged,
        EventType::PipelineDealWon,
        EventType::PipelineDealLost,
        EventType::ContractCreated,
        EventType::ContractUpdated,
        EventType::ContractExpiring,
        EventType::CertificationExpiring,
        EventType::CertificationExpired,
        EventType::InvoiceCreated,
        EventType::InvoiceStatusChanged,
        EventType::PaymentReceived,
        EventType::DocumentUploaded,
        EventType::DocumentSigned,
        EventType::ContactCreated,
        EventType::ContactUpdated,
        EventType::SystemTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OpportunityCreated => "opportunity.created",
            EventType::OpportunityUpdated => "opportunity.updated",
            EventType::OpportunityStatusChanged => "opportunity.status_changed",
            EventType::PipelineStageChanged => "pipeline.stage_changed",
            EventType::PipelineDealWon => "pipeline.deal_won",
            EventType::PipelineDealLost => "pipeline.deal_lost",
            EventType::ContractCreated => "contract.created",
            EventType::ContractUpdated => "contract.updated",
            EventType::ContractExpiring => "contract.expiring",
            EventType::CertificationExpiring => "compliance.certification_expiring",
            EventType::CertificationExpired => "compliance.certification_expired",
            EventType::InvoiceCreated => "financial.invoice_created",
            EventType::InvoiceStatusChanged => "financial.invoice_status_changed",
            EventType::PaymentReceived => "financial.payment_received",
            EventType::DocumentUploaded => "document.uploaded",
            EventType::DocumentSigned => "document.signed",
            EventType::ContactCreated => "crm.contact_created",
            EventType::ContactUpdated => "crm.contact_updated",
            EventType::SystemTest => "system.test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Category prefix, e.g. `compliance` for `compliance.certification_expiring`.
    pub fn category(&self) -> &'static str {
        let name = self.as_str();
        name.split('.').next().unwrap_or(name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the entity an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

/// A domain event handed to the router by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: EventType,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(tenant_id: Uuid, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            event_type,
            entity: None,
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity = Some(EntityRef {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        });
        self
    }
}

/// HTTP methods a registration may deliver with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            _ => None,
        }
    }
}

/// Circuit status of a registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    #[default]
    Active,
    Paused,
    Failing,
    Disabled,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Active => "ACTIVE",
            RegistrationStatus::Paused => "PAUSED",
            RegistrationStatus::Failing => "FAILING",
            RegistrationStatus::Disabled => "DISABLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(RegistrationStatus::Active),
            "PAUSED" => Some(RegistrationStatus::Paused),
            "FAILING" => Some(RegistrationStatus::Failing),
            "DISABLED" => Some(RegistrationStatus::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant's subscription of one target URL to one event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub url: String,
    pub event_type: EventType,
    pub method: HttpMethod,
    pub content_type: String,
    /// Extra headers sent on every attempt. Reserved engine headers are ignored.
    pub custom_headers: BTreeMap<String, String>,
    pub payload_template: Option<String>,
    /// Shared HMAC secret. Never serialized back out.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub auth: WebhookAuth,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub timeout_seconds: u64,
    pub disable_after_failures: u32,
    #[serde(flatten)]
    pub circuit: CircuitState,
    #[serde(flatten)]
    pub stats: DeliveryStats,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookRegistration {
    /// New ACTIVE registration with default delivery, retry and circuit policy.
    pub fn new(
        tenant_id: Uuid,
        url: impl Into<String>,
        event_type: EventType,
        secret: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: String::new(),
            url: url.into(),
            event_type,
            method: HttpMethod::Post,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            custom_headers: BTreeMap::new(),
            payload_template: None,
            secret,
            auth: WebhookAuth::None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECONDS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            disable_after_failures: DEFAULT_DISABLE_AFTER_FAILURES,
            circuit: CircuitState::default(),
            stats: DeliveryStats::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_auth(mut self, auth: WebhookAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.payload_template = Some(template.into());
        self
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay_seconds: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_seconds = retry_delay_seconds;
        self
    }

    pub fn status(&self) -> RegistrationStatus {
        self.circuit.status
    }

    /// Whether the router may hand this registration new work.
    pub fn is_deliverable(&self) -> bool {
        self.circuit.accepts_deliveries()
    }

    /// Highest attempt number a task for this registration may reach.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// (registration, event) pair; at most one task per key is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub registration_id: Uuid,
    pub event_id: Uuid,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.registration_id, self.event_id)
    }
}

/// One logical delivery of one event to one registration. Never persisted.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub registration_id: Uuid,
    pub event: DomainEvent,
    /// 1-based; attempt 1 is the initial delivery.
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
}

impl DeliveryTask {
    pub fn new(registration_id: Uuid, event: DomainEvent) -> Self {
        Self {
            registration_id,
            event,
            attempt: 1,
            next_attempt_at: Utc::now(),
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            registration_id: self.registration_id,
            event_id: self.event.id,
        }
    }
}

/// Terminal result of a delivery task, applied once to the ledger and circuit.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Success {
        status_code: u16,
        at: DateTime<Utc>,
    },
    Failure {
        status_code: Option<u16>,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DeliveryOutcome {
    pub fn success(status_code: u16) -> Self {
        DeliveryOutcome::Success {
            status_code,
            at: Utc::now(),
        }
    }

    pub fn failure(status_code: Option<u16>, reason: impl Into<String>) -> Self {
        DeliveryOutcome::Failure {
            status_code,
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trips_wire_name() {
        for t in EventType::ALL {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert_eq!(EventType::parse("contract.deleted"), None);
    }

    #[test]
    fn test_event_type_category() {
        assert_eq!(EventType::CertificationExpiring.category(), "compliance");
        assert_eq!(EventType::InvoiceStatusChanged.category(), "financial");
        assert_eq!(EventType::ContactCreated.category(), "crm");
    }

    #[test]
    fn test_registration_defaults() {
        let reg = WebhookRegistration::new(
            Uuid::new_v4(),
            "https://example.com/hook",
            EventType::ContractUpdated,
            Some("s3cret".into()),
        );
        assert_eq!(reg.method, HttpMethod::Post);
        assert_eq!(reg.content_type, "application/json");
        assert_eq!(reg.max_retries, 3);
        assert_eq!(reg.retry_delay_seconds, 60);
        assert_eq!(reg.timeout_seconds, 30);
        assert_eq!(reg.disable_after_failures, 10);
        assert_eq!(reg.status(), RegistrationStatus::Active);
        assert!(reg.circuit.is_active);
        assert!(reg.is_deliverable());
        assert_eq!(reg.max_attempts(), 4);
    }

    #[test]
    fn test_registration_json_hides_secret() {
        let reg = WebhookRegistration::new(
            Uuid::new_v4(),
            "https://example.com/hook",
            EventType::ContractUpdated,
            Some("s3cret".into()),
        );
        let json = serde_json::to_value(&reg).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["total_deliveries"], 0);
    }

    #[test]
    fn test_domain_event_deserializes_with_defaults() {
        let tenant = Uuid::new_v4();
        let json = serde_json::json!({
            "tenant_id": tenant,
            "event_type": "financial.invoice_status_changed",
            "payload": {"invoice": "INV-7", "status": "paid"}
        });
        let event: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.tenant_id, tenant);
        assert_eq!(event.event_type, EventType::InvoiceStatusChanged);
        assert!(event.entity.is_none());
    }

    #[test]
    fn test_task_starts_at_attempt_one() {
        let event = DomainEvent::new(Uuid::new_v4(), EventType::ContractCreated, serde_json::json!({}));
        let reg_id = Uuid::new_v4();
        let task = DeliveryTask::new(reg_id, event.clone());
        assert_eq!(task.attempt, 1);
        assert_eq!(
            task.dedup_key(),
            DedupKey { registration_id: reg_id, event_id: event.id }
        );
    }
}
