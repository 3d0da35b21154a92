//! Delivery content and gateway outcome types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Telegram-style chat identifier. Recipients are keyed by it.
pub type ChatId = i64;

/// What to deliver. The gateway resolves and renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Copy an existing message (no "forwarded from" attribution).
    Copy { from_chat_id: ChatId, message_id: i64 },
    /// Plain text message.
    Text { text: String },
}

impl Content {
    pub fn copy(from_chat_id: ChatId, message_id: i64) -> Self {
        Self::Copy {
            from_chat_id,
            message_id,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Short label for logs.
    pub fn describe(&self) -> String {
        match self {
            Content::Copy {
                from_chat_id,
                message_id,
            } => format!("copy {from_chat_id}/{message_id}"),
            Content::Text { text } => {
                let preview: String = text.chars().take(32).collect();
                format!("text \"{preview}\"")
            }
        }
    }
}

/// An inline button attached to a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Button {
    /// Opens a URL.
    Url { label: String, url: String },
    /// Reports a click back to the bot; `data` becomes the engagement kind.
    Callback { label: String, data: String },
}

/// How to deliver content: one row of buttons per entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default)]
    pub buttons: Vec<Button>,
}

impl DeliveryOptions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_button(mut self, button: Button) -> Self {
        self.buttons.push(button);
        self
    }
}

/// Why a delivery did not go through.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    /// Worth retrying later: network trouble, 5xx, unknown API errors.
    #[error("transient delivery error: {0}")]
    Transient(String),

    /// The recipient blocked the bot or the account is gone.
    #[error("recipient unreachable: {0}")]
    RecipientUnreachable(String),

    /// The referenced source message no longer exists.
    #[error("content not found: {0}")]
    ContentMissing(String),

    /// Pacing directive from the gateway, not a failure.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_json_shape() {
        let content = Content::copy(-1001, 42);
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "copy");
        assert_eq!(json["from_chat_id"], -1001);
        assert_eq!(json["message_id"], 42);
    }

    #[test]
    fn test_options_default_to_no_buttons() {
        let opts: DeliveryOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.buttons.is_empty());
    }

    #[test]
    fn test_describe_truncates_text() {
        let long = "x".repeat(100);
        let label = Content::text(long).describe();
        assert!(label.len() < 50);
    }
}
