//! Broadcast fan-out: one piece of content to every recipient, in bounded
//! concurrent batches with a pacing pause between batches.
//!
//! Bypasses the task queue entirely: a broadcast is immediate, not delayed,
//! and nothing about it is persisted.

use std::sync::Arc;
use std::time::Duration;

use dripcast_core::config::{BroadcastConfig, WorkerConfig};
use dripcast_core::traits::Gateway;
use dripcast_core::types::{ChatId, Content, DeliveryError, DeliveryOptions};
use serde::Serialize;

use crate::dispatch::{PacingPolicy, deliver_paced};
use crate::persistence::{StoreResult, TaskStore};

/// Aggregate outcome of one broadcast run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Recipient blocked the bot or no longer exists.
    pub blocked: usize,
    pub failed: usize,
    pub total: usize,
    pub batches: usize,
}

impl BroadcastReport {
    fn record(&mut self, chat_id: ChatId, result: &Result<(), DeliveryError>) {
        match result {
            Ok(()) => self.delivered += 1,
            Err(DeliveryError::RecipientUnreachable(reason)) => {
                tracing::debug!("🚫 Broadcast to {chat_id} blocked: {reason}");
                self.blocked += 1;
            }
            Err(e) => {
                tracing::warn!("⚠️ Broadcast to {chat_id} failed: {e}");
                self.failed += 1;
            }
        }
    }
}

/// Batched fan-out over a gateway.
pub struct Broadcaster {
    gateway: Arc<dyn Gateway>,
    batch_size: usize,
    pacing: Duration,
    delivery: PacingPolicy,
}

impl Broadcaster {
    pub fn new(gateway: Arc<dyn Gateway>, batch_size: usize, pacing: Duration) -> Self {
        Self {
            gateway,
            batch_size: batch_size.max(1),
            pacing,
            delivery: PacingPolicy::default(),
        }
    }

    pub fn from_config(
        gateway: Arc<dyn Gateway>,
        broadcast: &BroadcastConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self::new(
            gateway,
            broadcast.batch_size,
            Duration::from_millis(broadcast.pacing_ms),
        )
        .with_delivery_pacing(PacingPolicy::from_config(worker))
    }

    pub fn with_delivery_pacing(mut self, delivery: PacingPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    /// Send `content` to every id in `recipients`.
    ///
    /// Batches run strictly one after another; deliveries inside a batch run
    /// concurrently. A failing recipient never stops the run.
    pub async fn broadcast(
        &self,
        recipients: &[ChatId],
        content: &Content,
        options: &DeliveryOptions,
    ) -> BroadcastReport {
        let mut report = BroadcastReport {
            total: recipients.len(),
            ..BroadcastReport::default()
        };
        if recipients.is_empty() {
            tracing::info!("📢 Broadcast skipped: no recipients");
            return report;
        }

        let batch_count = recipients.len().div_ceil(self.batch_size);
        tracing::info!(
            "📢 Broadcasting {} to {} recipients in {} batches",
            content.describe(),
            recipients.len(),
            batch_count
        );

        for (i, batch) in recipients.chunks(self.batch_size).enumerate() {
            let sends = batch.iter().map(|&chat_id| async move {
                let result =
                    deliver_paced(self.gateway.as_ref(), chat_id, content, options, self.delivery)
                        .await;
                (chat_id, result)
            });
            for (chat_id, result) in futures::future::join_all(sends).await {
                report.record(chat_id, &result);
            }
            report.batches += 1;
            tracing::debug!("  └─ batch {}/{} done", i + 1, batch_count);

            if i + 1 < batch_count && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
        }

        tracing::info!(
            "📢 Broadcast done: {} delivered, {} blocked, {} failed of {}",
            report.delivered,
            report.blocked,
            report.failed,
            report.total
        );
        report
    }

    /// Broadcast to the full recipient list held by `store`.
    pub async fn broadcast_all(
        &self,
        store: &TaskStore,
        content: &Content,
        options: &DeliveryOptions,
    ) -> StoreResult<BroadcastReport> {
        let recipients = store.list_recipient_ids()?;
        Ok(self.broadcast(&recipients, content, options).await)
    }
}
