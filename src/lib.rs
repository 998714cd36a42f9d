//! HookRelay - outbound webhook delivery with retries, circuit breaking and
//! signed payloads
//!
//! Domain events go in, signed HTTP requests come out. The library is
//! organized around trait-based dependency injection for testability: the
//! registration store and the HTTP client are ports with production and test
//! implementations.

pub mod circuit;
pub mod config;
pub mod delivery_worker;
pub mod executor;
pub mod ledger;
pub mod mocks;
pub mod models;
pub mod production;
pub mod retry;
pub mod router;
pub mod signer;
pub mod template;
pub mod traits;

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::{AppConfig, EngineConfig};
pub use delivery_worker::{TaskOutcome, TaskReport};
pub use executor::{AttemptOutcome, DeliveryExecutor};
pub use ledger::{DeliveryStats, SqliteRegistrationStore};
pub use models::{DomainEvent, EventType, RegistrationStatus, WebhookRegistration};
pub use router::{spawn_event_loop, DispatchReport, Dispatcher};

/// Install logging to stdout and, with `log_dir`, a daily-rolling file.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "hookrelay=info".into()),
    );

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = rolling::daily(dir, "hookrelay.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
