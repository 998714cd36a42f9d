//! Registration store trait: the engine's persistence port

use thiserror::Error;
use uuid::Uuid;

use crate::models::{DeliveryOutcome, EventType, WebhookRegistration};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Registration not found: {0}")]
    NotFound(String),
    #[error("Invalid state transition")]
    InvalidStateTransition,
    #[error("Concurrent update conflict on registration {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::DatabaseError(e.to_string())
    }
}

/// Trait for registration lookups and atomic state updates
///
/// Production: SQLite with WAL mode
/// Testing: In-memory SQLite
pub trait RegistrationStore: Send + Sync {
    /// Persist a new registration (tenant configuration, external to the engine)
    fn insert(&self, registration: &WebhookRegistration) -> Result<(), LedgerError>;

    /// Fetch one registration by id
    fn get(&self, id: &Uuid) -> Result<Option<WebhookRegistration>, LedgerError>;

    /// Registrations for a tenant and event type that currently accept traffic
    /// (ACTIVE or FAILING, and flagged active)
    fn find_deliverable(
        &self,
        tenant_id: &Uuid,
        event_type: EventType,
    ) -> Result<Vec<WebhookRegistration>, LedgerError>;

    /// Registrations whose consecutive failures reach `min_consecutive_failures`
    fn find_needing_attention(
        &self,
        min_consecutive_failures: u32,
    ) -> Result<Vec<WebhookRegistration>, LedgerError>;

    /// Apply one terminal outcome to statistics and circuit state in a single
    /// atomic update. Returns the registration as persisted.
    fn apply_outcome(
        &self,
        id: &Uuid,
        outcome: &DeliveryOutcome,
    ) -> Result<WebhookRegistration, LedgerError>;

    /// Operator pause; counters untouched
    fn pause(&self, id: &Uuid) -> Result<WebhookRegistration, LedgerError>;

    /// Operator resume to the pre-pause status
    fn resume(&self, id: &Uuid) -> Result<WebhookRegistration, LedgerError>;

    /// Operator disable
    fn disable(&self, id: &Uuid) -> Result<WebhookRegistration, LedgerError>;

    /// Operator re-enable of a disabled registration
    fn enable(&self, id: &Uuid) -> Result<WebhookRegistration, LedgerError>;
}
