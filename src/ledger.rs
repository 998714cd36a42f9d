//! SQLite-backed registration ledger
//!
//! Holds webhook registrations together with their circuit state and lifetime
//! delivery statistics. Every mutation is a read-modify-write inside one
//! immediate transaction, guarded by a `version` column so that two writers
//! (threads or processes) can never interleave partial updates.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit::{self, CircuitState};
use crate::models::{DeliveryOutcome, EventType, HttpMethod, RegistrationStatus, WebhookRegistration};
use crate::traits::{LedgerError, RegistrationStore, WebhookAuth};

/// Lifetime delivery statistics of one registration.
///
/// `total_deliveries == successful_deliveries + failed_deliveries` holds after
/// every [`DeliveryStats::record`]; the table enforces it with a CHECK too.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub last_response_code: Option<u16>,
}

impl DeliveryStats {
    /// Statistics after one more terminal outcome
    pub fn record(&self, outcome: &DeliveryOutcome) -> DeliveryStats {
        let mut next = self.clone();
        next.total_deliveries += 1;
        match outcome {
            DeliveryOutcome::Success { status_code, at } => {
                next.successful_deliveries += 1;
                next.last_delivery_at = Some(*at);
                next.last_success_at = Some(*at);
                next.last_response_code = Some(*status_code);
            }
            DeliveryOutcome::Failure {
                status_code,
                reason,
                at,
            } => {
                next.failed_deliveries += 1;
                next.last_delivery_at = Some(*at);
                next.last_failure_at = Some(*at);
                next.last_failure_reason = Some(reason.clone());
                next.last_response_code = *status_code;
            }
        }
        next
    }

    /// Percentage of successful deliveries; `None` before the first delivery
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_deliveries == 0 {
            return None;
        }
        Some(self.successful_deliveries as f64 / self.total_deliveries as f64 * 100.0)
    }
}

/// Registration counts per status, for startup and periodic logging
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSummary {
    pub active: usize,
    pub failing: usize,
    pub paused: usize,
    pub disabled: usize,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS webhook_registrations (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL,
        event_type TEXT NOT NULL,
        method TEXT NOT NULL DEFAULT 'POST',
        content_type TEXT NOT NULL DEFAULT 'application/json',
        custom_headers TEXT NOT NULL DEFAULT '{}',
        payload_template TEXT,
        secret TEXT,
        auth_json TEXT NOT NULL DEFAULT '{\"type\":\"none\"}',
        max_retries INTEGER NOT NULL DEFAULT 3,
        retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
        timeout_seconds INTEGER NOT NULL DEFAULT 30,
        disable_after_failures INTEGER NOT NULL DEFAULT 10,
        status TEXT NOT NULL DEFAULT 'ACTIVE',
        paused_from TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        total_deliveries INTEGER NOT NULL DEFAULT 0,
        successful_deliveries INTEGER NOT NULL DEFAULT 0,
        failed_deliveries INTEGER NOT NULL DEFAULT 0,
        last_delivery_at INTEGER,
        last_success_at INTEGER,
        last_failure_at INTEGER,
        last_failure_reason TEXT,
        last_response_code INTEGER,
        version INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK (total_deliveries = successful_deliveries + failed_deliveries),
        CHECK (status <> 'DISABLED' OR is_active = 0)
    );

    CREATE INDEX IF NOT EXISTS idx_registrations_routing
        ON webhook_registrations (tenant_id, event_type, status);

    CREATE INDEX IF NOT EXISTS idx_registrations_failures
        ON webhook_registrations (consecutive_failures)
        WHERE consecutive_failures > 0;";

const COLUMNS: &str = "id, tenant_id, name, url, event_type, method, content_type,
    custom_headers, payload_template, secret, auth_json, max_retries,
    retry_delay_seconds, timeout_seconds, disable_after_failures, status,
    paused_from, is_active, consecutive_failures, total_deliveries,
    successful_deliveries, failed_deliveries, last_delivery_at, last_success_at,
    last_failure_at, last_failure_reason, last_response_code, version,
    created_at, updated_at";

pub struct SqliteRegistrationStore {
    conn: Mutex<Connection>,
}

impl SqliteRegistrationStore {
    /// Open or create a ledger database
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;

        // WAL for crash recovery and concurrent readers
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA wal_autocheckpoint = 1000;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "Registration ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::DatabaseError("ledger connection lock poisoned".into()))
    }

    /// Count registrations per status
    pub fn summary(&self) -> Result<RegistrationSummary, LedgerError> {
        let conn = self.conn()?;
        let summary = conn.query_row(
            "SELECT
                SUM(CASE WHEN status = 'ACTIVE' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'FAILING' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'PAUSED' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'DISABLED' THEN 1 ELSE 0 END)
             FROM webhook_registrations",
            [],
            |row| {
                Ok(RegistrationSummary {
                    active: row.get::<_, Option<i64>>(0)?.unwrap_or(0) as usize,
                    failing: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as usize,
                    paused: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as usize,
                    disabled: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as usize,
                })
            },
        )?;
        Ok(summary)
    }

    /// Read-modify-write one registration atomically.
    ///
    /// The write only lands if nobody bumped `version` since the read; the
    /// immediate transaction keeps other writers out between the two.
    fn update_with<F>(&self, id: &Uuid, mutate: F) -> Result<WebhookRegistration, LedgerError>
    where
        F: FnOnce(&mut WebhookRegistration) -> Result<(), LedgerError>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut registration = tx
            .query_row(
                &format!("SELECT {COLUMNS} FROM webhook_registrations WHERE id = ?1"),
                params![id.to_string()],
                row_to_registration,
            )
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        let expected_version = registration.version;
        mutate(&mut registration)?;
        registration.version = expected_version + 1;
        registration.updated_at = Utc::now();

        let stats = &registration.stats;
        let circuit = &registration.circuit;
        let rows = tx.execute(
            "UPDATE webhook_registrations
             SET status = ?1, paused_from = ?2, is_active = ?3, consecutive_failures = ?4,
                 total_deliveries = ?5, successful_deliveries = ?6, failed_deliveries = ?7,
                 last_delivery_at = ?8, last_success_at = ?9, last_failure_at = ?10,
                 last_failure_reason = ?11, last_response_code = ?12,
                 version = ?13, updated_at = ?14
             WHERE id = ?15 AND version = ?16",
            params![
                circuit.status.as_str(),
                circuit.paused_from.map(|s| s.as_str()),
                circuit.is_active,
                circuit.consecutive_failures,
                stats.total_deliveries as i64,
                stats.successful_deliveries as i64,
                stats.failed_deliveries as i64,
                stats.last_delivery_at.map(|t| t.timestamp_millis()),
                stats.last_success_at.map(|t| t.timestamp_millis()),
                stats.last_failure_at.map(|t| t.timestamp_millis()),
                stats.last_failure_reason,
                stats.last_response_code,
                registration.version,
                registration.updated_at.timestamp_millis(),
                id.to_string(),
                expected_version,
            ],
        )?;

        if rows == 0 {
            return Err(LedgerError::Conflict(id.to_string()));
        }
        tx.commit()?;
        Ok(registration)
    }

    fn query_registrations(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<WebhookRegistration>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM webhook_registrations WHERE {where_clause} ORDER BY created_at ASC"
        ))?;

        let registrations = stmt
            .query_map(params, row_to_registration)?
            .filter_map(|row| match row {
                Ok(registration) => Some(registration),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable registration row");
                    None
                }
            })
            .collect();
        Ok(registrations)
    }
}

impl RegistrationStore for SqliteRegistrationStore {
    fn insert(&self, registration: &WebhookRegistration) -> Result<(), LedgerError> {
        let custom_headers = serde_json::to_string(&registration.custom_headers)
            .map_err(|e| LedgerError::DatabaseError(e.to_string()))?;
        let auth_json = serde_json::to_string(&registration.auth)
            .map_err(|e| LedgerError::DatabaseError(e.to_string()))?;
        let stats = &registration.stats;
        let circuit = &registration.circuit;

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO webhook_registrations ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
                         ?29, ?30)"
            ),
            params![
                registration.id.to_string(),
                registration.tenant_id.to_string(),
                registration.name,
                registration.url,
                registration.event_type.as_str(),
                registration.method.as_str(),
                registration.content_type,
                custom_headers,
                registration.payload_template,
                registration.secret,
                auth_json,
                registration.max_retries,
                registration.retry_delay_seconds as i64,
                registration.timeout_seconds as i64,
                registration.disable_after_failures,
                circuit.status.as_str(),
                circuit.paused_from.map(|s| s.as_str()),
                circuit.is_active,
                circuit.consecutive_failures,
                stats.total_deliveries as i64,
                stats.successful_deliveries as i64,
                stats.failed_deliveries as i64,
                stats.last_delivery_at.map(|t| t.timestamp_millis()),
                stats.last_success_at.map(|t| t.timestamp_millis()),
                stats.last_failure_at.map(|t| t.timestamp_millis()),
                stats.last_failure_reason,
                stats.last_response_code,
                registration.version,
                registration.created_at.timestamp_millis(),
                registration.updated_at.timestamp_millis(),
            ],
        )?;

        tracing::debug!(
            registration_id = %registration.id,
            tenant_id = %registration.tenant_id,
            event_type = %registration.event_type,
            "Registration stored"
        );
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Option<WebhookRegistration>, LedgerError> {
        let conn = self.conn()?;
        let registration = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM webhook_registrations WHERE id = ?1"),
                params![id.to_string()],
                row_to_registration,
            )
            .optional()?;
        Ok(registration)
    }

    fn find_deliverable(
        &self,
        tenant_id: &Uuid,
        event_type: EventType,
    ) -> Result<Vec<WebhookRegistration>, LedgerError> {
        let tenant = tenant_id.to_string();
        self.query_registrations(
            "tenant_id = ?1 AND event_type = ?2 AND is_active = 1
             AND status IN ('ACTIVE', 'FAILING')",
            &[&tenant, &event_type.as_str()],
        )
    }

    fn find_needing_attention(
        &self,
        min_consecutive_failures: u32,
    ) -> Result<Vec<WebhookRegistration>, LedgerError> {
        self.query_registrations(
            "consecutive_failures >= ?1 OR status = 'FAILING'",
            &[&min_consecutive_failures],
        )
    }

    fn apply_outcome(
        &self,
        id: &Uuid,
        outcome: &DeliveryOutcome,
    ) -> Result<WebhookRegistration, LedgerError> {
        let updated = self.update_with(id, |registration| {
            registration.stats = registration.stats.record(outcome);
            registration.circuit = circuit::on_outcome(
                registration.circuit,
                outcome,
                registration.disable_after_failures,
            );
            Ok(())
        })?;

        tracing::debug!(
            registration_id = %id,
            success = outcome.is_success(),
            status = %updated.circuit.status,
            consecutive_failures = updated.circuit.consecutive_failures,
            total = updated.stats.total_deliveries,
            "Outcome recorded"
        );
        Ok(updated)
    }

    fn pause(&self, id: &Uuid) -> Result<WebhookRegistration, LedgerError> {
        let updated = self.update_with(id, |registration| {
            registration.circuit = circuit::pause(registration.circuit)?;
            Ok(())
        })?;
        tracing::info!(registration_id = %id, "Registration paused");
        Ok(updated)
    }

    fn resume(&self, id: &Uuid) -> Result<WebhookRegistration, LedgerError> {
        let updated = self.update_with(id, |registration| {
            registration.circuit = circuit::resume(registration.circuit)?;
            Ok(())
        })?;
        tracing::info!(registration_id = %id, status = %updated.circuit.status, "Registration resumed");
        Ok(updated)
    }

    fn disable(&self, id: &Uuid) -> Result<WebhookRegistration, LedgerError> {
        let updated = self.update_with(id, |registration| {
            registration.circuit = circuit::disable(registration.circuit);
            Ok(())
        })?;
        tracing::info!(registration_id = %id, "Registration disabled by operator");
        Ok(updated)
    }

    fn enable(&self, id: &Uuid) -> Result<WebhookRegistration, LedgerError> {
        let updated = self.update_with(id, |registration| {
            registration.circuit = circuit::enable();
            Ok(())
        })?;
        tracing::info!(registration_id = %id, "Registration re-enabled");
        Ok(updated)
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn status_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<RegistrationStatus>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        RegistrationStatus::parse(&s).ok_or_else(|| conversion_error(idx, format!("unknown status {s}")))
    })
    .transpose()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    Ok(millis.and_then(DateTime::from_timestamp_millis))
}

fn row_to_registration(row: &Row<'_>) -> rusqlite::Result<WebhookRegistration> {
    let event_type_raw: String = row.get(4)?;
    let event_type = EventType::parse(&event_type_raw)
        .ok_or_else(|| conversion_error(4, format!("unknown event type {event_type_raw}")))?;

    let method_raw: String = row.get(5)?;
    let method = HttpMethod::parse(&method_raw)
        .ok_or_else(|| conversion_error(5, format!("unknown method {method_raw}")))?;

    let headers_raw: String = row.get(7)?;
    let custom_headers =
        serde_json::from_str(&headers_raw).map_err(|e| conversion_error(7, e.to_string()))?;

    let auth_raw: String = row.get(10)?;
    let auth: WebhookAuth =
        serde_json::from_str(&auth_raw).map_err(|e| conversion_error(10, e.to_string()))?;

    let status = status_at(row, 15)?.unwrap_or_default();

    Ok(WebhookRegistration {
        id: uuid_at(row, 0)?,
        tenant_id: uuid_at(row, 1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        event_type,
        method,
        content_type: row.get(6)?,
        custom_headers,
        payload_template: row.get(8)?,
        secret: row.get(9)?,
        auth,
        max_retries: row.get(11)?,
        retry_delay_seconds: row.get::<_, i64>(12)?.max(0) as u64,
        timeout_seconds: row.get::<_, i64>(13)?.max(0) as u64,
        disable_after_failures: row.get(14)?,
        circuit: CircuitState {
            status,
            paused_from: status_at(row, 16)?,
            is_active: row.get(17)?,
            consecutive_failures: row.get(18)?,
        },
        stats: DeliveryStats {
            total_deliveries: row.get::<_, i64>(19)?.max(0) as u64,
            successful_deliveries: row.get::<_, i64>(20)?.max(0) as u64,
            failed_deliveries: row.get::<_, i64>(21)?.max(0) as u64,
            last_delivery_at: time_at(row, 22)?,
            last_success_at: time_at(row, 23)?,
            last_failure_at: time_at(row, 24)?,
            last_failure_reason: row.get(25)?,
            last_response_code: row.get(26)?,
        },
        version: row.get(27)?,
        created_at: time_at(row, 28)?.unwrap_or_else(Utc::now),
        updated_at: time_at(row, 29)?.unwrap_or_else(Utc::now),
    })
}
