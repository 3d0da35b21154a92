//! Enrollment: turns the configured sequence into a recipient's task set.

use std::sync::Arc;

use dripcast_core::config::SequenceConfig;
use dripcast_core::types::{Button, ChatId, Content, DeliveryOptions};

use crate::persistence::{StoreResult, TaskStore};
use crate::tasks::{NewTask, RecipientProfile, TaskKind, TaskPayload};

/// Compute the ordered task plan for an enrollment at `enrolled_at`.
///
/// Content steps keep their configured order. The cleanup step is due a fixed
/// window after the content step it references; the final step carries the
/// skip rule.
pub fn plan_sequence(sequence: &SequenceConfig, enrolled_at: i64) -> Vec<NewTask> {
    let mut plan = Vec::with_capacity(sequence.steps.len() + 2);

    for (i, step) in sequence.steps.iter().enumerate() {
        let kind = if step.delay_secs == 0 {
            TaskKind::Immediate
        } else {
            TaskKind::Delayed(i as u32 + 1)
        };
        plan.push(NewTask {
            kind,
            due_at: offset(enrolled_at, step.delay_secs),
            payload: TaskPayload::new(step.content.clone(), options(&step.buttons)),
        });
    }

    if let Some(cleanup) = &sequence.cleanup {
        match cleanup
            .after_step
            .checked_sub(1)
            .and_then(|i| sequence.steps.get(i))
        {
            Some(anchor) => plan.push(NewTask {
                kind: TaskKind::Cleanup,
                due_at: offset(
                    enrolled_at,
                    anchor.delay_secs.saturating_add(cleanup.window_secs),
                ),
                payload: TaskPayload::new(
                    Content::text(cleanup.farewell.clone()),
                    DeliveryOptions::none(),
                ),
            }),
            None => tracing::warn!(
                "⚠️ Cleanup references missing step {}; not scheduled",
                cleanup.after_step
            ),
        }
    }

    if let Some(last) = &sequence.final_step {
        plan.push(NewTask {
            kind: TaskKind::Final,
            due_at: offset(enrolled_at, last.delay_secs),
            payload: TaskPayload::new(last.content.clone(), options(&last.buttons))
                .skip_if(last.skip_if.clone()),
        });
    }

    plan
}

/// `enrolled_at + secs`, saturating instead of wrapping.
fn offset(enrolled_at: i64, secs: u64) -> i64 {
    enrolled_at.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn options(buttons: &[Button]) -> DeliveryOptions {
    DeliveryOptions {
        buttons: buttons.to_vec(),
    }
}

/// Result of a first-contact event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// New (or re-subscribed) recipient; one task id per planned step.
    Enrolled { task_ids: Vec<String> },
    /// Already enrolled and active; nothing was scheduled.
    Returning,
}

/// Enrollment, opt-out, and engagement entry points for the command layer.
pub struct Enroller {
    store: Arc<TaskStore>,
    sequence: SequenceConfig,
}

impl Enroller {
    pub fn new(store: Arc<TaskStore>, sequence: SequenceConfig) -> Self {
        Self { store, sequence }
    }

    /// Handle first contact at `now`. Store failures are returned to the
    /// caller: a failed enrollment must be visible.
    pub fn enroll(&self, profile: &RecipientProfile, now: i64) -> StoreResult<EnrollOutcome> {
        let plan = plan_sequence(&self.sequence, now);
        match self.store.enroll(profile, now, &plan)? {
            Some(task_ids) => {
                tracing::info!(
                    "✅ Enrolled {} with {} tasks (payload: {:?})",
                    profile.chat_id,
                    task_ids.len(),
                    profile.start_payload
                );
                for task in &plan {
                    tracing::debug!("  └─ {} due at {}", task.kind, task.due_at);
                }
                Ok(EnrollOutcome::Enrolled { task_ids })
            }
            None => {
                tracing::info!("👋 Returning recipient {}", profile.chat_id);
                Ok(EnrollOutcome::Returning)
            }
        }
    }

    /// Opt out: cancel every pending task. Returns how many were cancelled.
    pub fn opt_out(&self, chat_id: ChatId) -> StoreResult<usize> {
        let cancelled = self.store.opt_out(chat_id)?;
        tracing::info!("🛑 {chat_id} opted out, cancelled {cancelled} pending tasks");
        Ok(cancelled)
    }

    /// Record a tracked interaction, e.g. a button click.
    pub fn record_engagement(&self, chat_id: ChatId, kind: &str) -> StoreResult<()> {
        self.store.record_engagement(chat_id, kind)?;
        tracing::info!("🔘 {chat_id} engaged: {kind}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskStatus;
    use dripcast_core::config::{CleanupConfig, FinalStepConfig, StepConfig};

    fn step(delay_secs: u64, message_id: i64) -> StepConfig {
        StepConfig {
            delay_secs,
            content: Content::copy(-100, message_id),
            buttons: vec![Button::Callback {
                label: "I Joined".into(),
                data: "verify".into(),
            }],
        }
    }

    fn sequence(delays: &[u64]) -> SequenceConfig {
        SequenceConfig {
            steps: delays
                .iter()
                .enumerate()
                .map(|(i, d)| step(*d, i as i64 + 1))
                .collect(),
            ..SequenceConfig::default()
        }
    }

    #[test]
    fn test_plan_offsets_from_enrollment_time() {
        let plan = plan_sequence(&sequence(&[30, 180, 7200]), 1000);
        let due: Vec<i64> = plan.iter().map(|t| t.due_at).collect();
        assert_eq!(due, vec![1030, 1180, 8200]);
        assert_eq!(plan[0].kind, TaskKind::Delayed(1));
        assert_eq!(plan[2].kind, TaskKind::Delayed(3));
        assert_eq!(plan[1].payload.options.buttons.len(), 1);
    }

    #[test]
    fn test_zero_delay_is_immediate() {
        let plan = plan_sequence(&sequence(&[0, 60]), 10);
        assert_eq!(plan[0].kind, TaskKind::Immediate);
        assert_eq!(plan[0].due_at, 10);
        assert_eq!(plan[1].kind, TaskKind::Delayed(2));
    }

    #[test]
    fn test_cleanup_derived_from_anchor_step() {
        let mut seq = sequence(&[30, 180]);
        seq.cleanup = Some(CleanupConfig {
            after_step: 2,
            window_secs: 600,
            farewell: "bye".into(),
        });
        let plan = plan_sequence(&seq, 1000);
        let cleanup = plan.iter().find(|t| t.kind == TaskKind::Cleanup).unwrap();
        assert_eq!(cleanup.due_at, 1000 + 180 + 600);
        assert_eq!(cleanup.payload.content, Content::text("bye"));
        assert!(cleanup.payload.skip_rule.is_none());
    }

    #[test]
    fn test_oversized_delays_saturate() {
        let mut seq = sequence(&[u64::MAX, 30]);
        seq.cleanup = Some(CleanupConfig {
            after_step: 1,
            window_secs: u64::MAX,
            farewell: "bye".into(),
        });
        let plan = plan_sequence(&seq, 1000);
        assert_eq!(plan[0].due_at, i64::MAX);
        assert_eq!(plan[1].due_at, 1030);
        assert_eq!(plan[2].kind, TaskKind::Cleanup);
        assert_eq!(plan[2].due_at, i64::MAX);
    }

    #[test]
    fn test_cleanup_with_bad_anchor_is_dropped() {
        let mut seq = sequence(&[30]);
        seq.cleanup = Some(CleanupConfig {
            after_step: 0,
            window_secs: 600,
            farewell: "bye".into(),
        });
        assert_eq!(plan_sequence(&seq, 0).len(), 1);
    }

    #[test]
    fn test_final_step_carries_skip_rule() {
        let mut seq = sequence(&[30, 180]);
        seq.final_step = Some(FinalStepConfig {
            delay_secs: 7200,
            content: Content::copy(-100, 9),
            buttons: vec![],
            skip_if: "verify".into(),
        });
        let plan = plan_sequence(&seq, 1000);
        assert_eq!(plan.len(), 3);
        let last = plan.last().unwrap();
        assert_eq!(last.kind, TaskKind::Final);
        assert_eq!(last.due_at, 8200);
        assert_eq!(last.payload.skip_rule.as_ref().unwrap().event_kind, "verify");
    }

    #[test]
    fn test_enroll_creates_one_pending_task_per_step() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let enroller = Enroller::new(store.clone(), sequence(&[30, 180, 7200]));

        let outcome = enroller.enroll(&RecipientProfile::new(42), 1000).unwrap();
        let EnrollOutcome::Enrolled { task_ids } = outcome else {
            panic!("expected enrollment");
        };
        assert_eq!(task_ids.len(), 3);

        let tasks = store.tasks_for(42).unwrap();
        assert_eq!(
            tasks.iter().map(|t| t.due_at).collect::<Vec<_>>(),
            vec![1030, 1180, 8200]
        );
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending && t.retry_count == 0));
    }

    #[test]
    fn test_second_contact_is_welcome_back() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let enroller = Enroller::new(store.clone(), sequence(&[30]));
        enroller.enroll(&RecipientProfile::new(1), 0).unwrap();
        assert_eq!(
            enroller.enroll(&RecipientProfile::new(1), 50).unwrap(),
            EnrollOutcome::Returning
        );
        assert_eq!(store.tasks_for(1).unwrap().len(), 1);
    }

    #[test]
    fn test_opt_out_then_re_enroll_gets_fresh_tasks() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let enroller = Enroller::new(store.clone(), sequence(&[30, 180]));
        enroller.enroll(&RecipientProfile::new(1), 0).unwrap();

        let first = store.tasks_for(1).unwrap();
        store.set_status(&first[0].id, TaskStatus::Sent, false).unwrap();
        assert_eq!(enroller.opt_out(1).unwrap(), 1);

        let outcome = enroller.enroll(&RecipientProfile::new(1), 500).unwrap();
        assert!(matches!(outcome, EnrollOutcome::Enrolled { ref task_ids } if task_ids.len() == 2));

        let all = store.tasks_for(1).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all.iter().filter(|t| t.status == TaskStatus::Pending).count(), 2);
        assert_eq!(all.iter().filter(|t| t.status == TaskStatus::Sent).count(), 1);
        assert_eq!(all.iter().filter(|t| t.status == TaskStatus::Cancelled).count(), 1);
        assert_eq!(store.recipient_count().unwrap(), 1);
    }

    #[test]
    fn test_record_engagement() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let enroller = Enroller::new(store.clone(), sequence(&[]));
        enroller.enroll(&RecipientProfile::new(3), 0).unwrap();
        enroller.record_engagement(3, "verify").unwrap();
        assert!(store.has_engagement(3, "verify").unwrap());
    }
}
