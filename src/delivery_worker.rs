//! Per-task delivery loop
//!
//! A task runs attempt after attempt until it succeeds, fails terminally,
//! exhausts its retries or is cancelled. The registration is re-read right
//! before every attempt; a worker permit is held only for the HTTP call.
//! Exactly one terminal outcome is written to the store per finished task,
//! and none for a cancelled one.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::executor::{AttemptOutcome, DeliveryExecutor};
use crate::models::{DedupKey, DeliveryOutcome, DeliveryTask, RegistrationStatus};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::traits::{LedgerError, RegistrationStore};

/// Attempts to land one outcome when writers keep colliding
const RECORD_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Registration is PAUSED, DISABLED or inactive
    NotDeliverable(RegistrationStatus),
    /// Registration no longer exists
    Deleted,
    /// Registration could not be read
    StoreUnavailable,
    /// Engine is shutting down
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Delivered {
        status_code: u16,
    },
    Failed {
        status_code: Option<u16>,
        reason: String,
    },
    Cancelled(CancelReason),
}

/// What happened to one task, for logging and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub key: DedupKey,
    /// HTTP attempts actually made
    pub attempts: u32,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Delivered { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Cancelled(_))
    }
}

/// Everything a task needs to run; cheap to clone into each spawned task
#[derive(Clone)]
pub struct DeliveryWorker {
    store: Arc<dyn RegistrationStore>,
    executor: Arc<DeliveryExecutor>,
    scheduler: RetryScheduler,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        executor: Arc<DeliveryExecutor>,
        scheduler: RetryScheduler,
        permits: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            executor,
            scheduler,
            permits,
            cancel,
        }
    }

    pub async fn run_task(&self, mut task: DeliveryTask) -> TaskReport {
        let key = task.dedup_key();
        let mut attempts = 0;

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return cancelled(key, attempts, CancelReason::Shutdown);
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return cancelled(key, attempts, CancelReason::Shutdown),
                },
            };

            let registration = match self.store.get(&task.registration_id) {
                Ok(Some(registration)) if registration.is_deliverable() => registration,
                Ok(Some(registration)) => {
                    tracing::info!(
                        %key,
                        status = %registration.status(),
                        attempt = task.attempt,
                        "Registration no longer deliverable, dropping task"
                    );
                    return cancelled(key, attempts, CancelReason::NotDeliverable(registration.status()));
                }
                Ok(None) => {
                    tracing::info!(%key, "Registration removed, dropping task");
                    return cancelled(key, attempts, CancelReason::Deleted);
                }
                Err(e) => {
                    tracing::error!(%key, error = %e, "Failed to load registration");
                    return cancelled(key, attempts, CancelReason::StoreUnavailable);
                }
            };

            let outcome = self.executor.attempt(&registration, &task).await;
            drop(permit);
            if !matches!(outcome, AttemptOutcome::ConfigurationFatal { .. }) {
                attempts += 1;
            }

            if outcome.is_retryable() {
                let decision = self.scheduler.decide(
                    task.attempt,
                    registration.max_retries,
                    registration.retry_delay_seconds,
                );
                if let RetryDecision::Retry { delay } = decision {
                    task.next_attempt_at = chrono::Duration::from_std(delay)
                        .map(|d| Utc::now() + d)
                        .unwrap_or_else(|_| Utc::now());
                    tracing::debug!(
                        %key,
                        attempt = task.attempt,
                        delay_ms = delay.as_millis() as u64,
                        next_attempt_at = %task.next_attempt_at,
                        "Retry scheduled"
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            tracing::debug!(%key, "Pending retry cancelled by shutdown");
                            return cancelled(key, attempts, CancelReason::Shutdown);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    task.attempt += 1;
                    continue;
                }
                tracing::warn!(%key, attempts, "Retries exhausted");
            }

            let delivery = outcome.to_delivery_outcome();
            self.record(&key, &delivery);

            let outcome = match delivery {
                DeliveryOutcome::Success { status_code, .. } => {
                    tracing::info!(%key, attempts, status = status_code, "Delivery completed");
                    TaskOutcome::Delivered { status_code }
                }
                DeliveryOutcome::Failure {
                    status_code, reason, ..
                } => {
                    tracing::warn!(%key, attempts, ?status_code, reason = %reason, "Delivery failed");
                    TaskOutcome::Failed { status_code, reason }
                }
            };
            return TaskReport {
                key,
                attempts,
                outcome,
            };
        }
    }

    /// Apply a terminal outcome, retrying on version conflicts. Errors are
    /// logged and swallowed: producers never see delivery bookkeeping.
    fn record(&self, key: &DedupKey, outcome: &DeliveryOutcome) {
        for _ in 0..RECORD_ATTEMPTS {
            match self.store.apply_outcome(&key.registration_id, outcome) {
                Ok(updated) => {
                    if updated.status() == RegistrationStatus::Disabled && !outcome.is_success() {
                        tracing::warn!(
                            registration_id = %key.registration_id,
                            consecutive_failures = updated.circuit.consecutive_failures,
                            "Registration disabled after repeated failures"
                        );
                    }
                    return;
                }
                Err(LedgerError::Conflict(_)) => continue,
                Err(e) => {
                    tracing::error!(%key, error = %e, "Failed to record delivery outcome");
                    return;
                }
            }
        }
        tracing::error!(%key, "Gave up recording delivery outcome after repeated conflicts");
    }
}

fn cancelled(key: DedupKey, attempts: u32, reason: CancelReason) -> TaskReport {
    TaskReport {
        key,
        attempts,
        outcome: TaskOutcome::Cancelled(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;
    use uuid::Uuid;

    use crate::mocks::{InMemoryStore, RecordedWebhookClient};
    use crate::models::{DomainEvent, EventType, WebhookRegistration};
    use crate::traits::WebhookError;

    struct Harness {
        store: Arc<InMemoryStore>,
        client: RecordedWebhookClient,
        worker: DeliveryWorker,
        cancel: CancellationToken,
    }

    fn harness(client: RecordedWebhookClient) -> Harness {
        let store = Arc::new(InMemoryStore::open_in_memory().unwrap());
        let cancel = CancellationToken::new();
        let worker = DeliveryWorker::new(
            store.clone(),
            Arc::new(DeliveryExecutor::new(Arc::new(client.clone()))),
            RetryScheduler::default(),
            Arc::new(Semaphore::new(4)),
            cancel.clone(),
        );
        Harness {
            store,
            client,
            worker,
            cancel,
        }
    }

    fn registered(h: &Harness) -> (WebhookRegistration, DeliveryTask) {
        let reg = WebhookRegistration::new(
            Uuid::new_v4(),
            "https://hooks.example.com/a",
            EventType::ContractUpdated,
            Some("whsec".into()),
        );
        h.store.insert(&reg).unwrap();
        let event = DomainEvent::new(reg.tenant_id, EventType::ContractUpdated, json!({"n": 1}));
        let task = DeliveryTask::new(reg.id, event);
        (reg, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_first_try() {
        let h = harness(RecordedWebhookClient::success());
        let (reg, task) = registered(&h);

        let report = h.worker.run_task(task).await;
        assert!(report.is_delivered());
        assert_eq!(report.attempts, 1);

        let stored = h.store.get(&reg.id).unwrap().unwrap();
        assert_eq!(stored.stats.successful_deliveries, 1);
        assert_eq!(stored.stats.total_deliveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_makes_four_attempts_with_backoff() {
        let h = harness(RecordedWebhookClient::always_fail(WebhookError::HttpError(503)));
        let (reg, task) = registered(&h);
        let start = Instant::now();

        let report = h.worker.run_task(task).await;
        assert_eq!(report.attempts, 4);
        assert!(matches!(report.outcome, TaskOutcome::Failed { status_code: Some(503), .. }));

        let requests = h.client.requests();
        assert_eq!(requests.len(), 4);
        let offsets: Vec<_> = requests.iter().map(|r| r.at - start).collect();
        assert!(offsets[1] >= Duration::from_secs(60));
        assert!(offsets[2] - offsets[1] >= Duration::from_secs(120));
        assert!(offsets[3] - offsets[2] >= Duration::from_secs(240));

        let attempts: Vec<_> = requests.iter().map(|r| r.header("X-Webhook-Attempt").unwrap().to_string()).collect();
        assert_eq!(attempts, ["1", "2", "3", "4"]);

        // One task, one counted failure
        let stored = h.store.get(&reg.id).unwrap().unwrap();
        assert_eq!(stored.stats.failed_deliveries, 1);
        assert_eq!(stored.circuit.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let h = harness(RecordedWebhookClient::fail_then_succeed(2, WebhookError::Timeout));
        let (reg, task) = registered(&h);

        let report = h.worker.run_task(task).await;
        assert!(report.is_delivered());
        assert_eq!(report.attempts, 3);

        let stored = h.store.get(&reg.id).unwrap().unwrap();
        assert_eq!(stored.stats.successful_deliveries, 1);
        assert_eq!(stored.stats.failed_deliveries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let h = harness(RecordedWebhookClient::always_fail(WebhookError::HttpError(410)));
        let (_, task) = registered(&h);

        let report = h.worker.run_task(task).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(h.client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_counts_once_without_http() {
        let h = harness(RecordedWebhookClient::success());
        let reg = WebhookRegistration::new(Uuid::new_v4(), "https://hooks.example.com/a", EventType::ContractUpdated, None);
        h.store.insert(&reg).unwrap();
        let task = DeliveryTask::new(reg.id, DomainEvent::new(reg.tenant_id, EventType::ContractUpdated, json!({})));

        let report = h.worker.run_task(task).await;
        assert_eq!(report.attempts, 0);
        assert!(matches!(report.outcome, TaskOutcome::Failed { status_code: None, .. }));
        assert_eq!(h.client.call_count(), 0);

        let stored = h.store.get(&reg.id).unwrap().unwrap();
        assert_eq!(stored.stats.failed_deliveries, 1);
        assert_eq!(stored.circuit.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_registration_is_cancelled_without_recording() {
        let h = harness(RecordedWebhookClient::success());
        let (reg, task) = registered(&h);
        h.store.pause(&reg.id).unwrap();

        let report = h.worker.run_task(task).await;
        assert_eq!(
            report.outcome,
            TaskOutcome::Cancelled(CancelReason::NotDeliverable(RegistrationStatus::Paused))
        );
        assert_eq!(h.client.call_count(), 0);
        let stored = h.store.get(&reg.id).unwrap().unwrap();
        assert_eq!(stored.stats.total_deliveries, 0);
        assert_eq!(stored.circuit.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_registration_is_cancelled() {
        let h = harness(RecordedWebhookClient::success());
        let task = DeliveryTask::new(
            Uuid::new_v4(),
            DomainEvent::new(Uuid::new_v4(), EventType::ContractUpdated, json!({})),
        );
        let report = h.worker.run_task(task).await;
        assert_eq!(report.outcome, TaskOutcome::Cancelled(CancelReason::Deleted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retry() {
        let h = harness(RecordedWebhookClient::always_fail(WebhookError::HttpError(500)));
        let (reg, task) = registered(&h);

        let worker = h.worker.clone();
        let handle = tokio::spawn(async move { worker.run_task(task).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.cancel.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Cancelled(CancelReason::Shutdown));
        assert_eq!(report.attempts, 1);
        let stored = h.store.get(&reg.id).unwrap().unwrap();
        assert_eq!(stored.stats.total_deliveries, 0);
    }
}
