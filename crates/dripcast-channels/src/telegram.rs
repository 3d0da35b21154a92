//! Telegram Bot gateway: message delivery and long-poll updates via Bot API.

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dripcast_core::config::TelegramConfig;
use dripcast_core::error::{DripError, Result};
use dripcast_core::traits::Gateway;
use dripcast_core::types::{Button, ChatId, Content, DeliveryError, DeliveryOptions};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};

const API_BASE: &str = "https://api.telegram.org";

/// Telegram Bot API client implementing [`Gateway`].
pub struct TelegramGateway {
    token: String,
    api_base: String,
    client: reqwest::Client,
    long_poll_timeout: Duration,
    last_update_id: AtomicI64,
}

impl TelegramGateway {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DripError::Gateway(format!("HTTP client init failed: {e}")))?;
        Ok(Self {
            token: config.bot_token.clone(),
            api_base: API_BASE.into(),
            client,
            long_poll_timeout: Duration::from_secs(config.long_poll_timeout_secs),
            last_update_id: AtomicI64::new(0),
        })
    }

    /// Point the client at another Bot API server (e.g. a local one).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Get bot info.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        let response = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| DripError::Gateway(format!("getMe failed: {e}")))?;
        let body: TelegramApiResponse<TelegramUser> = response
            .json()
            .await
            .map_err(|e| DripError::Gateway(format!("Invalid getMe response: {e}")))?;
        if !body.ok {
            return Err(DripError::Gateway(format!(
                "getMe rejected: {}",
                body.description.unwrap_or_default()
            )));
        }
        body.result
            .ok_or_else(|| DripError::Gateway("No bot info".into()))
    }

    /// Get updates using long polling. Advances the offset past every
    /// returned update, so each update is seen once.
    pub async fn get_updates(&self) -> Result<Vec<TelegramUpdate>> {
        let offset = self.last_update_id.load(Ordering::SeqCst) + 1;
        let response = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.long_poll_timeout.as_secs().to_string()),
                (
                    "allowed_updates",
                    r#"["message","channel_post","callback_query"]"#.into(),
                ),
            ])
            // The server holds the request for up to the long-poll timeout.
            .timeout(self.long_poll_timeout + Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| DripError::Gateway(format!("Telegram getUpdates failed: {e}")))?;

        let body: TelegramApiResponse<Vec<TelegramUpdate>> = response
            .json()
            .await
            .map_err(|e| DripError::Gateway(format!("Invalid Telegram response: {e}")))?;

        if !body.ok {
            return Err(DripError::Gateway(format!(
                "Telegram API error: {}",
                body.description.unwrap_or_default()
            )));
        }

        let updates = body.result.unwrap_or_default();
        if let Some(last) = updates.last() {
            self.last_update_id.fetch_max(last.update_id, Ordering::SeqCst);
        }
        Ok(updates)
    }

    /// Send a text message.
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        options: &DeliveryOptions,
    ) -> std::result::Result<(), DeliveryError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        attach_markup(&mut body, options);
        self.call("sendMessage", &body).await
    }

    /// Copy a message from another chat without the "forwarded from" header.
    pub async fn copy_message(
        &self,
        chat_id: ChatId,
        from_chat_id: ChatId,
        message_id: i64,
        options: &DeliveryOptions,
    ) -> std::result::Result<(), DeliveryError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "from_chat_id": from_chat_id,
            "message_id": message_id,
        });
        attach_markup(&mut body, options);
        self.call("copyMessage", &body).await
    }

    /// Acknowledge a button press so the client stops its spinner.
    pub async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = serde_json::Value::String(text.into());
        }
        self.call("answerCallbackQuery", &body)
            .await
            .map_err(|e| DripError::Gateway(e.to_string()))
    }

    async fn call(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> std::result::Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("{method} failed: {e}")))?;

        let status = response.status().as_u16();
        let result: TelegramApiResponse<serde_json::Value> = response.json().await.map_err(|e| {
            DeliveryError::Transient(format!("Invalid {method} response (HTTP {status}): {e}"))
        })?;

        if result.ok {
            return Ok(());
        }
        Err(classify_failure(
            result.error_code.unwrap_or(status),
            result.description.as_deref().unwrap_or_default(),
            result.parameters.and_then(|p| p.retry_after),
        ))
    }

    /// Start polling loop: returns a stream of updates.
    pub fn start_polling(self: std::sync::Arc<Self>) -> TelegramPollingStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            tracing::info!("📡 Telegram polling loop started");
            loop {
                match self.get_updates().await {
                    Ok(updates) => {
                        for update in updates {
                            if tx.send(update).is_err() {
                                tracing::info!("Telegram polling stopped (receiver dropped)");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("❌ Telegram polling error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
                if tx.is_closed() {
                    return;
                }
            }
        });

        TelegramPollingStream { rx }
    }
}

#[async_trait]
impl Gateway for TelegramGateway {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(
        &self,
        chat_id: ChatId,
        content: &Content,
        options: &DeliveryOptions,
    ) -> std::result::Result<(), DeliveryError> {
        match content {
            Content::Copy {
                from_chat_id,
                message_id,
            } => {
                self.copy_message(chat_id, *from_chat_id, *message_id, options)
                    .await
            }
            Content::Text { text } => self.send_message(chat_id, text, options).await,
        }
    }
}

/// Map a rejected Bot API call onto the delivery failure taxonomy.
///
/// `retry_after` is the `parameters.retry_after` field Telegram sends with
/// flood-control errors.
pub fn classify_failure(error_code: u16, description: &str, retry_after: Option<u64>) -> DeliveryError {
    let lower = description.to_lowercase();

    if error_code == 429 || retry_after.is_some() {
        return DeliveryError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(1),
        };
    }
    if lower.contains("message to copy not found") || lower.contains("message to forward not found") {
        return DeliveryError::ContentMissing(description.into());
    }
    if error_code == 403
        || lower.contains("blocked")
        || lower.contains("deactivated")
        || lower.contains("chat not found")
    {
        return DeliveryError::RecipientUnreachable(description.into());
    }
    DeliveryError::Transient(format!("HTTP {error_code}: {description}"))
}

/// One inline button per row.
pub fn reply_markup(options: &DeliveryOptions) -> Option<serde_json::Value> {
    if options.buttons.is_empty() {
        return None;
    }
    let rows: Vec<serde_json::Value> = options
        .buttons
        .iter()
        .map(|button| match button {
            Button::Url { label, url } => serde_json::json!([{ "text": label, "url": url }]),
            Button::Callback { label, data } => {
                serde_json::json!([{ "text": label, "callback_data": data }])
            }
        })
        .collect();
    Some(serde_json::json!({ "inline_keyboard": rows }))
}

fn attach_markup(body: &mut serde_json::Value, options: &DeliveryOptions) {
    if let Some(markup) = reply_markup(options) {
        body["reply_markup"] = markup;
    }
}

/// Stream of Telegram updates from polling.
pub struct TelegramPollingStream {
    rx: tokio::sync::mpsc::UnboundedReceiver<TelegramUpdate>,
}

impl Stream for TelegramPollingStream {
    type Item = TelegramUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<u16>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    pub channel_post: Option<TelegramMessage>,
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub date: i64,
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

impl TelegramMessage {
    /// Text, or the caption of a media message.
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}
