//! Retry decision: a pure function from one attempt's outcome to the task's
//! next status. No I/O here, so every edge of the task state machine is
//! testable without a gateway.
//!
//! ```text
//! pending --delivered------------------------> sent
//! pending --skipped (engagement present)-----> sent
//! pending --recipient unreachable------------> failed
//! pending --content missing------------------> failed
//! pending --transient, retry_count+1 < max---> pending (retry_count+1)
//! pending --transient, retry_count+1 >= max--> failed  (retry_count+1)
//! ```

use dripcast_core::types::DeliveryError;

use crate::tasks::TaskStatus;

/// What one dispatch attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    /// Conditional step already satisfied; the gateway was not called.
    Skipped,
    RecipientUnreachable,
    ContentMissing,
    /// Includes a rate-limit signal that outlasted the pacing attempts.
    Transient,
}

impl AttemptOutcome {
    pub fn from_delivery(result: &Result<(), DeliveryError>) -> Self {
        match result {
            Ok(()) => AttemptOutcome::Delivered,
            Err(DeliveryError::RecipientUnreachable(_)) => AttemptOutcome::RecipientUnreachable,
            Err(DeliveryError::ContentMissing(_)) => AttemptOutcome::ContentMissing,
            Err(DeliveryError::Transient(_)) | Err(DeliveryError::RateLimited { .. }) => {
                AttemptOutcome::Transient
            }
        }
    }
}

/// The status write a dispatch should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: TaskStatus,
    /// Retry count after the write.
    pub retry_count: u32,
    pub increment_retry: bool,
}

/// Next state for a pending task.
pub fn next_state(outcome: AttemptOutcome, retry_count: u32, max_retries: u32) -> Transition {
    let done = |status| Transition {
        status,
        retry_count,
        increment_retry: false,
    };
    match outcome {
        AttemptOutcome::Delivered | AttemptOutcome::Skipped => done(TaskStatus::Sent),
        AttemptOutcome::RecipientUnreachable | AttemptOutcome::ContentMissing => {
            done(TaskStatus::Failed)
        }
        AttemptOutcome::Transient => {
            let next = retry_count.saturating_add(1);
            Transition {
                status: if next >= max_retries {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Pending
                },
                retry_count: next,
                increment_retry: true,
            }
        }
    }
}
