//! Event routing and task fan-out
//!
//! Each matching registration gets its own task; tasks for different
//! registrations never wait on each other. A (registration, event) pair that
//! is already in flight is not submitted twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::EngineConfig;
use crate::delivery_worker::{DeliveryWorker, TaskReport};
use crate::executor::DeliveryExecutor;
use crate::models::{DedupKey, DeliveryTask, DomainEvent};
use crate::retry::RetryScheduler;
use crate::traits::RegistrationStore;

/// Result of routing one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched: usize,
    pub submitted: usize,
    pub skipped_duplicates: usize,
}

/// Keys of tasks currently running
#[derive(Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<DedupKey>>>,
}

impl InFlight {
    /// Claim `key`, or `None` if a task for it is already running
    pub fn try_claim(&self, key: DedupKey) -> Option<InFlightGuard> {
        if self.keys.lock().unwrap().insert(key) {
            Some(InFlightGuard {
                keys: self.keys.clone(),
                key,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.lock().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its key when the task ends, however it ends
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<DedupKey>>>,
    key: DedupKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.remove(&self.key);
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn RegistrationStore>,
    worker: DeliveryWorker,
    in_flight: InFlight,
    tracker: TaskTracker,
    cancel: CancellationToken,
    reports: Option<mpsc::UnboundedSender<TaskReport>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn RegistrationStore>, executor: Arc<DeliveryExecutor>, config: &EngineConfig) -> Self {
        let cancel = CancellationToken::new();
        let worker = DeliveryWorker::new(
            store.clone(),
            executor,
            RetryScheduler::new(config.max_backoff_seconds),
            Arc::new(Semaphore::new(config.worker_count.max(1))),
            cancel.clone(),
        );
        tracing::debug!(worker_count = config.worker_count, "Dispatcher created");
        Self {
            store,
            worker,
            in_flight: InFlight::default(),
            tracker: TaskTracker::new(),
            cancel,
            reports: None,
        }
    }

    /// Send a [`TaskReport`] for every finished task to `sink`
    pub fn with_report_sink(mut self, sink: mpsc::UnboundedSender<TaskReport>) -> Self {
        self.reports = Some(sink);
        self
    }

    /// Route one event and submit a task per matching registration.
    ///
    /// Never fails: a store error is logged and the event matches nothing.
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, event: &DomainEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.cancel.is_cancelled() {
            tracing::warn!(event_id = %event.id, "Dispatcher is shutting down, event dropped");
            return report;
        }

        let registrations = match self.store.find_deliverable(&event.tenant_id, event.event_type) {
            Ok(registrations) => registrations,
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    error = %e,
                    "Failed to look up registrations"
                );
                return report;
            }
        };

        for registration in registrations.iter().filter(|r| r.is_deliverable()) {
            report.matched += 1;
            let task = DeliveryTask::new(registration.id, event.clone());
            let key = task.dedup_key();

            let Some(guard) = self.in_flight.try_claim(key) else {
                tracing::debug!(%key, "Delivery already in flight, skipping duplicate");
                report.skipped_duplicates += 1;
                continue;
            };

            let worker = self.worker.clone();
            let sink = self.reports.clone();
            self.tracker.spawn(async move {
                let task_report = worker.run_task(task).await;
                drop(guard);
                if let Some(sink) = sink {
                    let _ = sink.send(task_report);
                }
            });
            report.submitted += 1;
        }

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            matched = report.matched,
            submitted = report.submitted,
            skipped = report.skipped_duplicates,
            "Event dispatched"
        );
        report
    }

    /// Number of tasks currently running or waiting to retry
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, key: &DedupKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Wait until every submitted task has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel pending retries and wait up to `grace` for running attempts.
    ///
    /// Returns whether every task finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        tracing::info!(in_flight = self.in_flight(), "Dispatcher shutting down");
        self.cancel.cancel();
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("All delivery tasks finished");
                true
            }
            Err(_) => {
                tracing::warn!(remaining = self.tracker.len(), "Shutdown grace period elapsed");
                false
            }
        }
    }
}

/// Feed events from `events` into `dispatcher` until the channel closes or
/// `cancel` fires. Resolves to the number of events routed.
pub fn spawn_event_loop(
    dispatcher: Arc<Dispatcher>,
    mut events: mpsc::Receiver<DomainEvent>,
    cancel: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        tracing::info!("Event loop started");
        let mut routed = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        dispatcher.dispatch(&event);
                        routed += 1;
                    }
                    None => break,
                },
            }
        }
        tracing::info!(routed, "Event loop stopped");
        routed
    })
}
