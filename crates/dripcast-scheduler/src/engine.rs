//! Worker loop: polls the store for due tasks and drives the dispatcher.
//! Uses tokio::interval for ticking; sleeps between cycles.
//! Holds no task state across cycles: every cycle re-derives from the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::persistence::TaskStore;
use crate::retry::AttemptOutcome;
use crate::tasks::TaskStatus;

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub due: usize,
    pub sent: usize,
    pub skipped: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Cancelled (or otherwise finished) after the snapshot was taken.
    pub not_pending: usize,
    /// Attempted, but the status write lost to a cancellation.
    pub unapplied: usize,
    pub store_errors: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.due == 0 && self.store_errors == 0
    }
}

/// The scheduled-delivery worker.
pub struct Worker {
    store: Arc<TaskStore>,
    dispatcher: Dispatcher,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(store: Arc<TaskStore>, dispatcher: Dispatcher, poll_interval: Duration) -> Self {
        Self {
            store,
            dispatcher,
            poll_interval,
        }
    }

    /// One poll cycle: fetch due tasks, dispatch each in due order.
    ///
    /// A failing task never aborts the cycle.
    pub async fn run_cycle(&self, now: i64) -> CycleReport {
        let mut report = CycleReport::default();

        let due = match self.store.list_due(now) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("❌ Failed to fetch due tasks: {e}");
                report.store_errors += 1;
                return report;
            }
        };
        if due.is_empty() {
            return report;
        }
        report.due = due.len();
        tracing::info!("📋 Found {} due tasks", due.len());

        for task in &due {
            match self.dispatcher.dispatch(task).await {
                Ok(DispatchReport::NotPending(_)) => report.not_pending += 1,
                Ok(DispatchReport::Attempted { applied: false, .. }) => report.unapplied += 1,
                Ok(DispatchReport::Attempted {
                    outcome,
                    transition,
                    ..
                }) => match (transition.status, outcome) {
                    (TaskStatus::Sent, AttemptOutcome::Skipped) => report.skipped += 1,
                    (TaskStatus::Sent, _) => report.sent += 1,
                    (TaskStatus::Pending, _) => report.retrying += 1,
                    (TaskStatus::Failed, _) => report.failed += 1,
                    (TaskStatus::Cancelled, _) => report.not_pending += 1,
                },
                Err(e) => {
                    // Nothing was advanced; the next cycle sees the last durable status.
                    tracing::error!("❌ Store error on task {}: {e}", task.id);
                    report.store_errors += 1;
                }
            }
        }
        report
    }

    /// Run cycles until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Worker started (check every {}s)",
            self.poll_interval.as_secs_f32()
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let report = self.run_cycle(chrono::Utc::now().timestamp()).await;
            if !report.is_idle() {
                tracing::info!(
                    "📣 Cycle done: {} due, {} sent, {} skipped, {} retrying, {} failed, {} cancelled",
                    report.due,
                    report.sent,
                    report.skipped,
                    report.retrying,
                    report.failed,
                    report.not_pending + report.unapplied
                );
            }
        }

        tracing::info!("🛑 Worker stopped");
    }
}

/// Spawn the worker as a background tokio task.
pub fn spawn_worker(worker: Worker) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::PacingPolicy;
    use crate::tasks::{RecipientProfile, TaskKind, TaskPayload};
    use crate::testing::ScriptedGateway;
    use dripcast_core::config::WorkerConfig;
    use dripcast_core::types::{Content, DeliveryError, DeliveryOptions};

    fn worker_with(max_retries: u32) -> (Arc<TaskStore>, Arc<ScriptedGateway>, Worker) {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        for id in [1, 2] {
            store.upsert_recipient(&RecipientProfile::new(id), 0).unwrap();
        }
        let gateway = Arc::new(ScriptedGateway::new());
        let config = WorkerConfig {
            max_retries,
            ..WorkerConfig::default()
        };
        let dispatcher = Dispatcher::new(store.clone(), gateway.clone(), &config).with_pacing(
            PacingPolicy {
                max_calls: 3,
                margin: Duration::ZERO,
            },
        );
        let worker = Worker::new(store.clone(), dispatcher, Duration::from_millis(10));
        (store, gateway, worker)
    }

    fn payload() -> TaskPayload {
        TaskPayload::new(Content::copy(-100, 1), DeliveryOptions::none())
    }

    fn transient() -> Result<(), DeliveryError> {
        Err(DeliveryError::Transient("503".into()))
    }

    #[tokio::test]
    async fn test_two_transient_then_success() {
        let (store, gateway, worker) = worker_with(3);
        gateway.script(1, vec![transient(), transient(), Ok(())]);
        let id = store.enqueue(1, TaskKind::Delayed(1), 100, &payload()).unwrap();

        for _ in 0..3 {
            worker.run_cycle(200).await;
        }
        let task = store.get_task(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Sent);
        assert_eq!(task.retry_count, 2);

        // Terminal: further cycles do nothing.
        assert!(worker.run_cycle(300).await.is_idle());
        assert_eq!(gateway.calls_to(1), 3);
    }

    #[tokio::test]
    async fn test_three_transient_errors_fail_task() {
        let (store, gateway, worker) = worker_with(3);
        gateway.always_fail(1, DeliveryError::Transient("503".into()));
        let id = store.enqueue(1, TaskKind::Delayed(1), 100, &payload()).unwrap();

        let reports = [
            worker.run_cycle(200).await,
            worker.run_cycle(200).await,
            worker.run_cycle(200).await,
        ];
        assert_eq!(reports[0].retrying, 1);
        assert_eq!(reports[1].retrying, 1);
        assert_eq!(reports[2].failed, 1);

        let task = store.get_task(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);
        assert!(worker.run_cycle(200).await.is_idle());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_cycle() {
        let (store, gateway, worker) = worker_with(3);
        gateway.always_fail(1, DeliveryError::RecipientUnreachable("blocked".into()));
        store.enqueue(1, TaskKind::Delayed(1), 100, &payload()).unwrap();
        store.enqueue(2, TaskKind::Delayed(1), 150, &payload()).unwrap();

        let report = worker.run_cycle(200).await;
        assert_eq!(report.due, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(gateway.calls_to(2), 1);
    }

    #[tokio::test]
    async fn test_not_yet_due_tasks_wait() {
        let (store, gateway, worker) = worker_with(3);
        store.enqueue(1, TaskKind::Delayed(1), 500, &payload()).unwrap();
        assert!(worker.run_cycle(499).await.is_idle());
        assert_eq!(gateway.calls().len(), 0);
        assert_eq!(worker.run_cycle(500).await.sent, 1);
    }

    #[tokio::test]
    async fn test_cycle_dispatches_in_due_order() {
        let (store, gateway, worker) = worker_with(3);
        store.enqueue(2, TaskKind::Delayed(2), 180, &payload()).unwrap();
        store.enqueue(1, TaskKind::Delayed(1), 30, &payload()).unwrap();
        worker.run_cycle(1000).await;
        let order: Vec<i64> = gateway.calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_spawned_worker_delivers_and_stops() {
        let (store, gateway, worker) = worker_with(3);
        let id = store.enqueue(1, TaskKind::Delayed(1), 0, &payload()).unwrap();
        let (stop, handle) = spawn_worker(worker);

        for _ in 0..100 {
            if store.task_status(&id).unwrap() == Some(TaskStatus::Sent) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.task_status(&id).unwrap(), Some(TaskStatus::Sent));
        assert_eq!(gateway.calls_to(1), 1);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
