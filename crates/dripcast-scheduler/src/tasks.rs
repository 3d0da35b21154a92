//! Task definitions: the data model for scheduled deliveries.

use dripcast_core::types::{ChatId, Content, DeliveryOptions};
use serde::{Deserialize, Serialize};

/// A persisted delivery task.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Unique task ID, generated at creation.
    pub id: String,
    /// Owning recipient.
    pub chat_id: ChatId,
    pub kind: TaskKind,
    /// Absolute due time (epoch seconds). Never rescheduled.
    pub due_at: i64,
    pub status: TaskStatus,
    /// Transient failures absorbed so far.
    pub retry_count: u32,
    pub payload: TaskPayload,
}

/// Where a task sits in the drip sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Zero-delay step.
    Immediate,
    /// N-th delayed content step (1-based).
    Delayed(u32),
    /// Farewell scheduled a fixed window after a content step.
    Cleanup,
    /// Last step; may be satisfied by a prior engagement.
    Final,
}

impl TaskKind {
    pub fn as_str(&self) -> String {
        match self {
            TaskKind::Immediate => "immediate".into(),
            TaskKind::Delayed(n) => format!("delayed_{n}"),
            TaskKind::Cleanup => "cleanup".into(),
            TaskKind::Final => "final".into(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(TaskKind::Immediate),
            "cleanup" => Some(TaskKind::Cleanup),
            "final" => Some(TaskKind::Final),
            other => other
                .strip_prefix("delayed_")
                .and_then(|n| n.parse().ok())
                .map(TaskKind::Delayed),
        }
    }

    /// Conditional kinds honour a payload skip rule.
    pub fn is_conditional(&self) -> bool {
        matches!(self, TaskKind::Cleanup | TaskKind::Final)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Task status. Everything except `Pending` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Sent => "sent",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "sent" => Some(TaskStatus::Sent),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque task payload, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub content: Content,
    #[serde(default)]
    pub options: DeliveryOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_rule: Option<SkipRule>,
}

impl TaskPayload {
    pub fn new(content: Content, options: DeliveryOptions) -> Self {
        Self {
            content,
            options,
            skip_rule: None,
        }
    }

    pub fn skip_if(mut self, event_kind: impl Into<String>) -> Self {
        self.skip_rule = Some(SkipRule {
            event_kind: event_kind.into(),
        });
        self
    }
}

/// An engagement kind whose earlier occurrence makes a delivery unnecessary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRule {
    pub event_kind: String,
}

/// A task to be inserted; the store assigns id, status, and retry count.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub kind: TaskKind,
    pub due_at: i64,
    pub payload: TaskPayload,
}

/// Profile captured at first contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipientProfile {
    pub chat_id: ChatId,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Free-form deep-link tag, e.g. an ad campaign code.
    pub start_payload: Option<String>,
}

impl RecipientProfile {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            ..Self::default()
        }
    }
}

/// A persisted recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub profile: RecipientProfile,
    /// Epoch seconds of the latest enrollment.
    pub enrolled_at: i64,
    pub opted_out: bool,
}

/// Append-only engagement record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub chat_id: ChatId,
    pub kind: String,
    pub recorded_at: i64,
}
