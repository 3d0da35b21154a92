//! Bot command layer: turns Telegram updates into a [`Command`] and routes
//! each variant to one handler.
//!
//! Handlers return [`Reply`] values for the caller to deliver. Internal
//! errors are logged and summarised; they never reach a user verbatim.

use std::sync::Arc;

use tokio::task::JoinHandle;

use dripcast_channels::TelegramUpdate;
use dripcast_core::config::DripConfig;
use dripcast_core::traits::Gateway;
use dripcast_core::types::{Button, ChatId, Content, DeliveryOptions};
use dripcast_scheduler::{
    Broadcaster, EnrollOutcome, Enroller, RecipientProfile, Stats, StatsReporter, TaskStore,
};

/// Engagement kind recorded by the "join channel" button.
pub const JOIN_CHANNEL: &str = "join_channel";
/// Engagement kind recorded by the "I joined" button.
pub const VERIFY: &str = "verify";

/// A parsed bot interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `/start [payload]`: first contact or welcome back.
    Start { profile: RecipientProfile },
    /// `/stop`: opt out of the sequence.
    Stop { chat_id: ChatId },
    /// Inline button press.
    Click {
        chat_id: ChatId,
        callback_id: String,
        data: String,
    },
    /// `/stats` (admin only).
    Stats { chat_id: ChatId, user_id: i64 },
    /// `/send <text>` or `/send` as a reply (admin only).
    AdminBroadcast {
        chat_id: ChatId,
        user_id: i64,
        content: Option<Content>,
    },
    /// Source channel post starting with the trigger prefix.
    ChannelBroadcast { content: Content },
    /// `/help`.
    Help { chat_id: ChatId },
}

impl Command {
    /// Broadcasts fan out to every recipient and can run for minutes.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Command::AdminBroadcast { .. } | Command::ChannelBroadcast { .. }
        )
    }

    /// Parse an update. Unknown commands and plain chatter yield `None`.
    pub fn parse(update: &TelegramUpdate, config: &DripConfig) -> Option<Self> {
        if let Some(query) = &update.callback_query {
            let chat_id = query
                .message
                .as_ref()
                .map(|m| m.chat.id)
                .unwrap_or(query.from.id);
            return Some(Command::Click {
                chat_id,
                callback_id: query.id.clone(),
                data: query.data.clone().unwrap_or_default(),
            });
        }

        if let Some(post) = &update.channel_post {
            let body = post.body().unwrap_or_default();
            if post.chat.id == config.telegram.source_channel_id
                && body.starts_with(&config.broadcast.channel_trigger)
            {
                return Some(Command::ChannelBroadcast {
                    content: Content::copy(post.chat.id, post.message_id),
                });
            }
            return None;
        }

        let message = update.message.as_ref()?;
        let from = message.from.as_ref()?;
        if from.is_bot {
            return None;
        }
        let text = message.text.as_deref()?.trim();
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };
        // "/start@my_bot" in groups.
        let name = head.split('@').next().unwrap_or(head);
        let chat_id = message.chat.id;

        match name {
            "/start" => Some(Command::Start {
                profile: RecipientProfile {
                    chat_id,
                    user_id: Some(from.id),
                    username: from.username.clone(),
                    first_name: Some(from.first_name.clone()),
                    last_name: from.last_name.clone(),
                    start_payload: (!rest.is_empty()).then(|| rest.to_string()),
                },
            }),
            "/stop" => Some(Command::Stop { chat_id }),
            "/help" => Some(Command::Help { chat_id }),
            "/stats" => Some(Command::Stats {
                chat_id,
                user_id: from.id,
            }),
            "/send" => {
                let content = match &message.reply_to_message {
                    Some(original) => Some(Content::copy(original.chat.id, original.message_id)),
                    None if !rest.is_empty() => Some(Content::text(rest)),
                    None => None,
                };
                Some(Command::AdminBroadcast {
                    chat_id,
                    user_id: from.id,
                    content,
                })
            }
            _ => None,
        }
    }
}

/// A message to send back as the outcome of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub chat_id: ChatId,
    pub content: Content,
    pub options: DeliveryOptions,
}

impl Reply {
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            content: Content::text(text),
            options: DeliveryOptions::none(),
        }
    }

    pub fn with_button(mut self, button: Button) -> Self {
        self.options = self.options.with_button(button);
        self
    }
}

/// Maps each [`Command`] variant to its handler.
pub struct Router {
    config: DripConfig,
    store: Arc<TaskStore>,
    gateway: Arc<dyn Gateway>,
    enroller: Enroller,
    broadcaster: Broadcaster,
    stats: StatsReporter,
}

impl Router {
    pub fn new(config: DripConfig, store: Arc<TaskStore>, gateway: Arc<dyn Gateway>) -> Self {
        let enroller = Enroller::new(store.clone(), config.sequence.clone());
        let broadcaster = Broadcaster::from_config(gateway.clone(), &config.broadcast, &config.worker);
        let stats = StatsReporter::from_config(store.clone(), &config.stats);
        Self {
            config,
            store,
            gateway,
            enroller,
            broadcaster,
            stats,
        }
    }

    /// Route `command` and deliver its replies.
    ///
    /// Broadcasts run on their own task, which also sends the summary, so
    /// the caller can keep handling updates; their handle is returned.
    pub async fn handle(self: &Arc<Self>, command: Command, now: i64) -> Option<JoinHandle<()>> {
        if command.is_broadcast() {
            let router = Arc::clone(self);
            return Some(tokio::spawn(async move {
                let replies = router.route(command, now).await;
                router.send_replies(&replies).await;
            }));
        }
        let replies = self.route(command, now).await;
        self.send_replies(&replies).await;
        None
    }

    /// Run the handler for `command` at `now` (epoch seconds).
    pub async fn route(&self, command: Command, now: i64) -> Vec<Reply> {
        match command {
            Command::Start { profile } => self.on_start(&profile, now).await,
            Command::Stop { chat_id } => self.on_stop(chat_id).await,
            Command::Click { chat_id, data, .. } => self.on_click(chat_id, &data).await,
            Command::Stats { chat_id, user_id } => self.on_stats(chat_id, user_id).await,
            Command::AdminBroadcast {
                chat_id,
                user_id,
                content,
            } => self.on_admin_broadcast(chat_id, user_id, content).await,
            Command::ChannelBroadcast { content } => self.on_channel_broadcast(&content).await,
            Command::Help { chat_id } => vec![Reply::text(chat_id, HELP_TEXT)],
        }
    }

    /// Deliver replies one by one; failures are logged only.
    pub async fn send_replies(&self, replies: &[Reply]) {
        for reply in replies {
            if let Err(e) = self
                .gateway
                .deliver(reply.chat_id, &reply.content, &reply.options)
                .await
            {
                tracing::warn!("⚠️ Reply to {} failed: {e}", reply.chat_id);
            }
        }
    }

    fn is_admin(&self, user_id: i64) -> bool {
        self.config.telegram.admin_user_id != 0 && user_id == self.config.telegram.admin_user_id
    }

    fn join_button(&self, label: &str) -> Button {
        Button::Url {
            label: label.into(),
            url: self.config.telegram.channel_url.clone(),
        }
    }

    async fn on_start(&self, profile: &RecipientProfile, now: i64) -> Vec<Reply> {
        let chat_id = profile.chat_id;
        match self.enroller.enroll(profile, now) {
            Ok(EnrollOutcome::Enrolled { .. }) => {
                self.stats.invalidate().await;
                vec![self.welcome(chat_id)]
            }
            Ok(EnrollOutcome::Returning) => vec![
                Reply::text(
                    chat_id,
                    "👋 Welcome back!\n\nGlad to see you again! 🎉\n\n\
                     Join our channel for exclusive updates and premium content:",
                )
                .with_button(self.join_button("🔥 Join Channel")),
            ],
            Err(e) => {
                tracing::error!("❌ Enrollment of {chat_id} failed: {e}");
                vec![Reply::text(
                    chat_id,
                    "⚠️ Could not subscribe you right now. Please send /start again in a moment.",
                )]
            }
        }
    }

    fn welcome(&self, chat_id: ChatId) -> Reply {
        match &self.config.sequence.welcome {
            Some(step) => Reply {
                chat_id,
                content: step.content.clone(),
                options: DeliveryOptions {
                    buttons: step.buttons.clone(),
                },
            },
            None => Reply::text(
                chat_id,
                "🎉 Welcome! You've just unlocked exclusive content!\nStay tuned for amazing updates! 🚀",
            ),
        }
    }

    async fn on_stop(&self, chat_id: ChatId) -> Vec<Reply> {
        let text = match self.enroller.opt_out(chat_id) {
            Ok(cancelled) => {
                self.stats.invalidate().await;
                format!(
                    "✅ Unsubscribed successfully.\nCancelled {cancelled} pending messages.\n\n\
                     You won't receive any more automated messages.\n\
                     Send /start anytime to subscribe again."
                )
            }
            Err(e) => {
                tracing::error!("❌ Opt-out of {chat_id} failed: {e}");
                "⚠️ Could not unsubscribe you right now. Please send /stop again.".into()
            }
        };
        vec![Reply::text(chat_id, text)]
    }

    async fn on_click(&self, chat_id: ChatId, data: &str) -> Vec<Reply> {
        if data.is_empty() {
            return Vec::new();
        }
        match self.enroller.record_engagement(chat_id, data) {
            Ok(()) => self.stats.invalidate().await,
            Err(e) => tracing::warn!("⚠️ Could not record click {data} for {chat_id}: {e}"),
        }
        match data {
            JOIN_CHANNEL => vec![
                Reply::text(
                    chat_id,
                    format!(
                        "🚀 Join our channel here:\n{}\n\nClick 'I Joined' when you're in!",
                        self.config.telegram.channel_url
                    ),
                )
                .with_button(Button::Callback {
                    label: "✅ I Joined!".into(),
                    data: VERIFY.into(),
                }),
            ],
            VERIFY => vec![Reply::text(
                chat_id,
                "🎉 Awesome! Thanks for joining!\n\nYou'll now receive exclusive updates. 📊",
            )],
            _ => Vec::new(),
        }
    }

    async fn on_stats(&self, chat_id: ChatId, user_id: i64) -> Vec<Reply> {
        if !self.is_admin(user_id) {
            return vec![Reply::text(chat_id, ADMIN_ONLY)];
        }
        let text = match self.stats.snapshot().await {
            Ok(stats) => format_stats(&stats),
            Err(e) => {
                tracing::error!("❌ Stats query failed: {e}");
                "⚠️ Stats are unavailable right now.".into()
            }
        };
        vec![Reply::text(chat_id, text)]
    }

    async fn on_admin_broadcast(
        &self,
        chat_id: ChatId,
        user_id: i64,
        content: Option<Content>,
    ) -> Vec<Reply> {
        if !self.is_admin(user_id) {
            return vec![Reply::text(chat_id, ADMIN_ONLY)];
        }
        let Some(content) = content else {
            return vec![Reply::text(
                chat_id,
                format!(
                    "📢 Usage: reply to a message with /send, or /send <text>.\n\
                     Channel posts starting with {} are broadcast automatically.",
                    self.config.broadcast.channel_trigger
                ),
            )];
        };
        let summary = self.run_broadcast(&content, DeliveryOptions::none()).await;
        vec![Reply::text(chat_id, summary)]
    }

    async fn on_channel_broadcast(&self, content: &Content) -> Vec<Reply> {
        let options = DeliveryOptions::none().with_button(self.join_button("⚡ Join Now"));
        let summary = self.run_broadcast(content, options).await;
        let admin = self.config.telegram.admin_user_id;
        if admin == 0 {
            return Vec::new();
        }
        vec![Reply::text(admin, summary)]
    }

    async fn run_broadcast(&self, content: &Content, options: DeliveryOptions) -> String {
        match self
            .broadcaster
            .broadcast_all(&self.store, content, &options)
            .await
        {
            Ok(report) if report.total == 0 => "⚠️ No users to broadcast to.".into(),
            Ok(report) => format!(
                "📢 Broadcast complete!\n\n✅ Sent: {}\n🚫 Blocked/Deactivated: {}\n❌ Failed: {}\n📊 Total: {}",
                report.delivered, report.blocked, report.failed, report.total
            ),
            Err(e) => {
                tracing::error!("❌ Broadcast aborted, recipient list unavailable: {e}");
                "⚠️ Broadcast failed: recipient list unavailable.".into()
            }
        }
    }
}

const ADMIN_ONLY: &str = "⛔ This command is admin-only.";

const HELP_TEXT: &str = "🤖 Bot Commands\n\n\
    /start - Subscribe to updates\n\
    /stop - Unsubscribe from updates\n\
    /help - Show this help message\n\n\
    You'll receive exclusive content and updates automatically!";

/// Human-readable stats block for the admin.
pub fn format_stats(stats: &Stats) -> String {
    let mut text = format!(
        "📊 Bot Statistics\n\n👥 Users: {} ({} opted out)\n\n📬 Tasks:\n  ⏳ Pending: {}\n  ✅ Sent: {}\n  ❌ Failed: {}\n  🚫 Cancelled: {}\n  📊 Total: {}\n",
        stats.recipients,
        stats.opted_out,
        stats.tasks.pending,
        stats.tasks.sent,
        stats.tasks.failed,
        stats.tasks.cancelled,
        stats.tasks.total
    );
    text.push_str(&format!("\n🔘 Button clicks: {}\n", stats.total_engagements));
    for (kind, count) in &stats.engagement {
        text.push_str(&format!("  • {kind}: {count}\n"));
    }
    text
}
