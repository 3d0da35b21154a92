//! # Dripcast Scheduler
//!
//! Crash-safe delayed delivery for drip sequences, plus immediate broadcast
//! fan-out.
//!
//! ## Design Principles
//! - SQLite persistence: every mutation is one keyed statement, survives restarts
//! - At-least-once delivery: a task only leaves `pending` after its attempt
//! - Bounded retries: transient errors terminate in `max_retries` attempts
//! - Tokio timers only: zero overhead when idle
//!
//! ## Architecture
//! ```text
//! Enroller (first contact)
//!   └── plan_sequence → TaskStore.enroll (one transaction)
//!
//! Worker (tokio interval)
//!   └── TaskStore.list_due(now) → Dispatcher (per task, due order)
//!         ├── live status re-check
//!         ├── conditional skip (engagement recorded before due time)
//!         ├── deliver_paced → Gateway (rate-limit pacing)
//!         └── retry::next_state → TaskStore.set_status
//!
//! Broadcaster (admin / channel trigger)
//!   └── recipients → batches of B → join_all(Gateway) → pause → next batch
//! ```

pub mod broadcast;
pub mod cache;
pub mod dispatch;
pub mod engine;
pub mod enrollment;
pub mod persistence;
pub mod retry;
pub mod stats;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use cache::TtlCache;
pub use dispatch::{DispatchReport, Dispatcher, PacingPolicy};
pub use engine::{CycleReport, Worker, spawn_worker};
pub use enrollment::{EnrollOutcome, Enroller, plan_sequence};
pub use persistence::{Stats, StoreError, StoreResult, TaskCounts, TaskStore};
pub use retry::{AttemptOutcome, Transition};
pub use stats::StatsReporter;
pub use tasks::{RecipientProfile, Task, TaskKind, TaskPayload, TaskStatus};
