//! HookRelay daemon: reads newline-delimited JSON domain events from stdin and
//! delivers them to the registrations stored in the database.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hookrelay::circuit::FAILING_THRESHOLD;
use hookrelay::production::ReqwestWebhookClient;
use hookrelay::traits::RegistrationStore;
use hookrelay::{
    init_tracing, spawn_event_loop, AppConfig, DeliveryExecutor, Dispatcher, DomainEvent, EngineConfig,
    SqliteRegistrationStore,
};

async fn read_events(events: mpsc::Sender<DomainEvent>) -> std::io::Result<u64> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<DomainEvent>(line) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    break;
                }
                accepted += 1;
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed event line"),
        }
    }
    Ok(accepted)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = std::env::var_os("HOOKRELAY_LOG_DIR").map(PathBuf::from);
    let _guard = init_tracing(log_dir.as_deref())?;

    let db_path = PathBuf::from(std::env::var("HOOKRELAY_DB").unwrap_or_else(|_| "hookrelay.sqlite".into()));
    tracing::info!(db = %db_path.display(), "HookRelay starting up");

    let store = Arc::new(SqliteRegistrationStore::open(&db_path)?);
    let engine = EngineConfig::load(&AppConfig::open(&db_path)?)?;

    let summary = store.summary()?;
    tracing::info!(
        active = summary.active,
        failing = summary.failing,
        paused = summary.paused,
        disabled = summary.disabled,
        "Registrations loaded"
    );
    for registration in store.find_needing_attention(FAILING_THRESHOLD)? {
        tracing::warn!(
            registration_id = %registration.id,
            url = %registration.url,
            status = %registration.status(),
            consecutive_failures = registration.circuit.consecutive_failures,
            last_failure = registration.stats.last_failure_reason.as_deref().unwrap_or("-"),
            "Registration needs attention"
        );
    }

    let client = Arc::new(ReqwestWebhookClient::new(&engine.user_agent)?);
    let executor = Arc::new(
        DeliveryExecutor::new(client).with_header_names(&engine.signature_header, &engine.timestamp_header),
    );
    let dispatcher = Arc::new(Dispatcher::new(store, executor, &engine));

    let (tx, rx) = mpsc::channel(engine.event_buffer);
    let stop = CancellationToken::new();
    let event_loop = spawn_event_loop(dispatcher.clone(), rx, stop.clone());
    let mut reader = tokio::spawn(read_events(tx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received");
            stop.cancel();
            reader.abort();
        }
        read = &mut reader => match read {
            Ok(Ok(accepted)) => tracing::info!(accepted, "Input closed"),
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to read events"),
            Err(e) => tracing::error!(error = %e, "Event reader panicked"),
        },
    }

    let routed = event_loop.await?;
    tracing::info!(routed, "No more events");

    if !stop.is_cancelled() {
        tokio::select! {
            _ = dispatcher.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received, cancelling pending retries"),
        }
    }

    if !dispatcher.shutdown(engine.shutdown_grace).await {
        tracing::warn!("Exiting with deliveries still in flight");
    }
    tracing::info!("HookRelay stopped");
    Ok(())
}
