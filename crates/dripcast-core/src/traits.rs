//! The delivery seam between the scheduler and a messaging platform.

use async_trait::async_trait;

use crate::types::{ChatId, Content, DeliveryError, DeliveryOptions};

/// Sends one piece of content to one recipient.
///
/// Implementations classify every platform failure into a [`DeliveryError`]
/// variant; the scheduler decides retries from that classification alone.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Gateway name for logs.
    fn name(&self) -> &str;

    /// Deliver `content` to `chat_id`.
    async fn deliver(
        &self,
        chat_id: ChatId,
        content: &Content,
        options: &DeliveryOptions,
    ) -> Result<(), DeliveryError>;
}
