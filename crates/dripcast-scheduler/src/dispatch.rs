//! Per-task delivery: live-status re-check, conditional skip, gateway call
//! with rate-limit pacing, and the final status write.
//!
//! The final `set_status` is the only write on every path, so a crash at
//! any earlier point leaves the task `pending` for the next cycle.

use std::sync::Arc;
use std::time::Duration;

use dripcast_core::config::WorkerConfig;
use dripcast_core::traits::Gateway;
use dripcast_core::types::{ChatId, Content, DeliveryError, DeliveryOptions};

use crate::persistence::{StoreResult, TaskStore};
use crate::retry::{self, AttemptOutcome, Transition};
use crate::tasks::{Task, TaskStatus};

/// How long to keep honouring rate-limit signals within one attempt.
#[derive(Debug, Clone, Copy)]
pub struct PacingPolicy {
    /// Gateway calls per attempt, counting the first.
    pub max_calls: u32,
    /// Added to every requested wait.
    pub margin: Duration,
}

impl PacingPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_calls: config.rate_limit_attempts.max(1),
            margin: Duration::from_secs(config.rate_limit_margin_secs),
        }
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            max_calls: 3,
            margin: Duration::from_secs(1),
        }
    }
}

/// Call the gateway, sleeping through rate-limit signals.
///
/// A rate-limit signal is a pacing directive: the same attempt is repeated
/// after the requested wait plus the margin. Once `max_calls` is used up the
/// last signal is returned, and callers treat it as transient.
pub async fn deliver_paced(
    gateway: &dyn Gateway,
    chat_id: ChatId,
    content: &Content,
    options: &DeliveryOptions,
    policy: PacingPolicy,
) -> Result<(), DeliveryError> {
    let mut call = 1;
    loop {
        match gateway.deliver(chat_id, content, options).await {
            Err(DeliveryError::RateLimited { retry_after_secs }) if call < policy.max_calls => {
                let wait = Duration::from_secs(retry_after_secs) + policy.margin;
                tracing::warn!(
                    "⏳ Rate limited sending to {chat_id}: waiting {:?} (call {call}/{})",
                    wait,
                    policy.max_calls
                );
                tokio::time::sleep(wait).await;
                call += 1;
            }
            other => return other,
        }
    }
}

/// Result of dispatching one due task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchReport {
    /// The task left `pending` after the snapshot was taken.
    NotPending(Option<TaskStatus>),
    /// An attempt ran and its transition was written (`applied`) or lost to
    /// a concurrent cancellation (`!applied`).
    Attempted {
        outcome: AttemptOutcome,
        transition: Transition,
        applied: bool,
    },
}

/// Drives one task through one delivery attempt.
pub struct Dispatcher {
    store: Arc<TaskStore>,
    gateway: Arc<dyn Gateway>,
    pacing: PacingPolicy,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(store: Arc<TaskStore>, gateway: Arc<dyn Gateway>, config: &WorkerConfig) -> Self {
        Self {
            store,
            gateway,
            pacing: PacingPolicy::from_config(config),
            max_retries: config.max_retries,
        }
    }

    pub fn with_pacing(mut self, pacing: PacingPolicy) -> Self {
        self.pacing = pacing;
        self
    }

    /// Dispatch one task from a due snapshot.
    ///
    /// Only store failures are returned; delivery failures are folded into
    /// the report and the status write.
    pub async fn dispatch(&self, task: &Task) -> StoreResult<DispatchReport> {
        let live = self.store.task_status(&task.id)?;
        if live != Some(TaskStatus::Pending) {
            tracing::debug!("⏭️ Task {} no longer pending ({:?}), skipping", task.id, live);
            return Ok(DispatchReport::NotPending(live));
        }

        let outcome = if self.already_satisfied(task)? {
            tracing::info!(
                "✅ Task {} ({}) for {} satisfied by prior engagement, not sending",
                task.id,
                task.kind,
                task.chat_id
            );
            AttemptOutcome::Skipped
        } else {
            tracing::info!(
                "📤 Sending task {} ({}) to {}: {}",
                task.id,
                task.kind,
                task.chat_id,
                task.payload.content.describe()
            );
            let result = deliver_paced(
                self.gateway.as_ref(),
                task.chat_id,
                &task.payload.content,
                &task.payload.options,
                self.pacing,
            )
            .await;
            if let Err(e) = &result {
                tracing::warn!("⚠️ Task {} delivery to {} failed: {e}", task.id, task.chat_id);
            }
            AttemptOutcome::from_delivery(&result)
        };

        let transition = retry::next_state(outcome, task.retry_count, self.max_retries);
        let applied = self
            .store
            .set_status(&task.id, transition.status, transition.increment_retry)?;

        if !applied {
            tracing::info!(
                "🚫 Task {} was cancelled during delivery; status left as is",
                task.id
            );
        } else {
            match transition.status {
                TaskStatus::Sent => tracing::info!("✅ Task {} sent", task.id),
                TaskStatus::Pending => tracing::info!(
                    "🔄 Task {} will retry (attempt {}/{})",
                    task.id,
                    transition.retry_count,
                    self.max_retries
                ),
                TaskStatus::Failed => tracing::warn!(
                    "❌ Task {} failed ({:?}, retries {})",
                    task.id,
                    outcome,
                    transition.retry_count
                ),
                TaskStatus::Cancelled => {}
            }
        }

        Ok(DispatchReport::Attempted {
            outcome,
            transition,
            applied,
        })
    }

    fn already_satisfied(&self, task: &Task) -> StoreResult<bool> {
        match (&task.payload.skip_rule, task.kind.is_conditional()) {
            (Some(rule), true) => {
                self.store
                    .has_engagement_before(task.chat_id, &rule.event_kind, task.due_at)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{RecipientProfile, TaskKind, TaskPayload};
    use crate::testing::ScriptedGateway;

    const NO_WAIT: PacingPolicy = PacingPolicy {
        max_calls: 3,
        margin: Duration::ZERO,
    };

    fn setup() -> (Arc<TaskStore>, Arc<ScriptedGateway>, Dispatcher) {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        store.upsert_recipient(&RecipientProfile::new(1), 0).unwrap();
        let gateway = Arc::new(ScriptedGateway::new());
        let dispatcher = Dispatcher::new(store.clone(), gateway.clone(), &WorkerConfig::default())
            .with_pacing(NO_WAIT);
        (store, gateway, dispatcher)
    }

    fn enqueue(store: &TaskStore, kind: TaskKind, payload: TaskPayload) -> Task {
        let id = store.enqueue(1, kind, 100, &payload).unwrap();
        store.get_task(&id).unwrap().unwrap()
    }

    fn plain() -> TaskPayload {
        TaskPayload::new(Content::copy(-100, 1), DeliveryOptions::none())
    }

    fn rate_limited() -> Result<(), DeliveryError> {
        Err(DeliveryError::RateLimited { retry_after_secs: 0 })
    }

    #[tokio::test]
    async fn test_success_marks_sent() {
        let (store, gateway, dispatcher) = setup();
        let task = enqueue(&store, TaskKind::Delayed(1), plain());
        let report = dispatcher.dispatch(&task).await.unwrap();
        assert!(matches!(report, DispatchReport::Attempted { applied: true, .. }));
        assert_eq!(store.task_status(&task.id).unwrap(), Some(TaskStatus::Sent));
        assert_eq!(gateway.calls_to(1), 1);
    }

    #[tokio::test]
    async fn test_blocked_recipient_fails_terminally() {
        let (store, gateway, dispatcher) = setup();
        gateway.script(1, vec![Err(DeliveryError::RecipientUnreachable("blocked".into()))]);
        let task = enqueue(&store, TaskKind::Delayed(1), plain());
        dispatcher.dispatch(&task).await.unwrap();
        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_missing_content_fails_terminally() {
        let (store, gateway, dispatcher) = setup();
        gateway.script(1, vec![Err(DeliveryError::ContentMissing("not found".into()))]);
        let task = enqueue(&store, TaskKind::Delayed(1), plain());
        dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(store.task_status(&task.id).unwrap(), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_transient_error_keeps_pending_and_counts() {
        let (store, gateway, dispatcher) = setup();
        gateway.script(1, vec![Err(DeliveryError::Transient("timeout".into()))]);
        let task = enqueue(&store, TaskKind::Delayed(1), plain());
        dispatcher.dispatch(&task).await.unwrap();
        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_same_attempt_without_counting() {
        let (store, gateway, dispatcher) = setup();
        gateway.script(1, vec![rate_limited(), rate_limited(), Ok(())]);
        let task = enqueue(&store, TaskKind::Delayed(1), plain());
        dispatcher.dispatch(&task).await.unwrap();
        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Sent);
        assert_eq!(task.retry_count, 0);
        assert_eq!(gateway.calls_to(1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_signalled_duration_plus_margin() {
        let (store, gateway, _) = setup();
        let dispatcher = Dispatcher::new(store.clone(), gateway.clone(), &WorkerConfig::default());
        gateway.script(1, vec![Err(DeliveryError::RateLimited { retry_after_secs: 7 })]);
        let task = enqueue(&store, TaskKind::Delayed(1), plain());

        let start = tokio::time::Instant::now();
        dispatcher.dispatch(&task).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(8));
        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Sent);
        assert_eq!(task.retry_count, 0);
        assert_eq!(gateway.calls_to(1), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_does_not_wait() {
        let (store, gateway, _) = setup();
        let dispatcher = Dispatcher::new(store.clone(), gateway.clone(), &WorkerConfig::default());
        gateway.script(1, vec![Err(DeliveryError::Transient("502".into()))]);
        let task = enqueue(&store, TaskKind::Delayed(1), plain());

        let start = tokio::time::Instant::now();
        dispatcher.dispatch(&task).await.unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(gateway.calls_to(1), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_cap_becomes_transient() {
        let (store, gateway, dispatcher) = setup();
        gateway.script(1, vec![rate_limited(), rate_limited(), rate_limited(), Ok(())]);
        let task = enqueue(&store, TaskKind::Delayed(1), plain());
        let report = dispatcher.dispatch(&task).await.unwrap();
        assert!(matches!(
            report,
            DispatchReport::Attempted { outcome: AttemptOutcome::Transient, .. }
        ));
        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(gateway.calls_to(1), 3);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_not_delivered() {
        let (store, gateway, dispatcher) = setup();
        let task = enqueue(&store, TaskKind::Delayed(1), plain());
        store.cancel_all_pending(1).unwrap();
        let report = dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(report, DispatchReport::NotPending(Some(TaskStatus::Cancelled)));
        assert_eq!(gateway.calls_to(1), 0);
    }

    #[tokio::test]
    async fn test_final_step_skipped_after_engagement() {
        let (store, gateway, dispatcher) = setup();
        store.record_engagement_at(1, "verify", 50).unwrap();
        let task = enqueue(&store, TaskKind::Final, plain().skip_if("verify"));
        let report = dispatcher.dispatch(&task).await.unwrap();
        assert!(matches!(
            report,
            DispatchReport::Attempted { outcome: AttemptOutcome::Skipped, applied: true, .. }
        ));
        assert_eq!(store.task_status(&task.id).unwrap(), Some(TaskStatus::Sent));
        assert_eq!(gateway.calls_to(1), 0);
    }

    #[tokio::test]
    async fn test_engagement_after_due_time_does_not_skip() {
        let (store, gateway, dispatcher) = setup();
        store.record_engagement_at(1, "verify", 101).unwrap();
        let task = enqueue(&store, TaskKind::Final, plain().skip_if("verify"));
        dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(gateway.calls_to(1), 1);
    }

    #[tokio::test]
    async fn test_other_engagement_kind_does_not_skip() {
        let (store, gateway, dispatcher) = setup();
        store.record_engagement_at(1, "join_channel", 10).unwrap();
        let task = enqueue(&store, TaskKind::Final, plain().skip_if("verify"));
        dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(gateway.calls_to(1), 1);
    }

    #[tokio::test]
    async fn test_skip_rule_ignored_on_unconditional_kind() {
        let (store, gateway, dispatcher) = setup();
        store.record_engagement_at(1, "verify", 10).unwrap();
        let task = enqueue(&store, TaskKind::Delayed(1), plain().skip_if("verify"));
        dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(gateway.calls_to(1), 1);
    }
}
