//! SQLite-backed engine configuration
//!
//! `AppConfig` is a plain key/value table; `EngineConfig` is the typed view
//! the dispatcher is built from, with defaults for every missing key.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::executor::{DEFAULT_SIGNATURE_HEADER, DEFAULT_TIMESTAMP_HEADER};
use crate::retry::DEFAULT_MAX_BACKOFF_SECONDS;
use crate::traits::LedgerError;

pub const KEY_WORKER_COUNT: &str = "engine.worker_count";
pub const KEY_MAX_BACKOFF: &str = "engine.max_backoff_seconds";
pub const KEY_SIGNATURE_HEADER: &str = "engine.signature_header";
pub const KEY_TIMESTAMP_HEADER: &str = "engine.timestamp_header";
pub const KEY_USER_AGENT: &str = "engine.user_agent";
pub const KEY_EVENT_BUFFER: &str = "engine.event_buffer";
pub const KEY_SHUTDOWN_GRACE: &str = "engine.shutdown_grace_seconds";

pub struct AppConfig {
    conn: Mutex<Connection>,
}

impl AppConfig {
    /// Create config table in an existing database connection
    pub fn init_table(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS app_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Open config in the same database file as the registration ledger
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        Self::init_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open standalone in-memory config (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::init_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::DatabaseError("config connection lock poisoned".into()))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM app_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        tracing::debug!(key = %key, found = value.is_some(), "Config get");
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), LedgerError> {
        tracing::debug!(key = %key, "Config set");
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO app_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;
        Ok(())
    }

    /// Unparseable values fall back to `default` with a warning
    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, LedgerError> {
        match self.get(key)? {
            None => Ok(default),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(value) => Ok(value),
                Err(_) => {
                    tracing::warn!(key = %key, value = %raw, default, "Ignoring non-numeric config value");
                    Ok(default)
                }
            },
        }
    }

    fn get_or(&self, key: &str, default: &str) -> Result<String, LedgerError> {
        Ok(self
            .get(key)?
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string()))
    }
}

/// Typed engine settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Concurrent HTTP attempts across all registrations
    pub worker_count: usize,
    pub max_backoff_seconds: u64,
    pub signature_header: String,
    pub timestamp_header: String,
    pub user_agent: String,
    /// Capacity of the inbound event channel
    pub event_buffer: usize,
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 16,
            max_backoff_seconds: DEFAULT_MAX_BACKOFF_SECONDS,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            timestamp_header: DEFAULT_TIMESTAMP_HEADER.to_string(),
            user_agent: format!("HookRelay/{}", env!("CARGO_PKG_VERSION")),
            event_buffer: 1024,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn load(config: &AppConfig) -> Result<Self, LedgerError> {
        let defaults = Self::default();
        let loaded = Self {
            worker_count: config.get_u64(KEY_WORKER_COUNT, defaults.worker_count as u64)?.max(1) as usize,
            max_backoff_seconds: config.get_u64(KEY_MAX_BACKOFF, defaults.max_backoff_seconds)?,
            signature_header: config.get_or(KEY_SIGNATURE_HEADER, &defaults.signature_header)?,
            timestamp_header: config.get_or(KEY_TIMESTAMP_HEADER, &defaults.timestamp_header)?,
            user_agent: config.get_or(KEY_USER_AGENT, &defaults.user_agent)?,
            event_buffer: config.get_u64(KEY_EVENT_BUFFER, defaults.event_buffer as u64)?.max(1) as usize,
            shutdown_grace: Duration::from_secs(
                config.get_u64(KEY_SHUTDOWN_GRACE, defaults.shutdown_grace.as_secs())?,
            ),
        };
        tracing::debug!(?loaded, "Engine config loaded");
        Ok(loaded)
    }
}
