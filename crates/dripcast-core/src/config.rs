//! Dripcast configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DripError, Result};
use crate::types::{Button, Content};

/// Environment variable that overrides `telegram.bot_token`.
pub const BOT_TOKEN_ENV: &str = "DRIPCAST_BOT_TOKEN";

/// Upper bound for any sequence delay or window: one year.
pub const MAX_DELAY_SECS: u64 = 365 * 24 * 3600;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DripConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl DripConfig {
    /// Load config from the default path (~/.dripcast/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DripError::Config(format!("Failed to read config: {e}")))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| DripError::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env();
        Ok(config)
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DripError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Dripcast home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dripcast")
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(BOT_TOKEN_ENV)
            && !token.is_empty()
        {
            self.telegram.bot_token = token;
        }
    }

    /// Check invariants the worker and enrollment code rely on.
    pub fn validate(&self) -> Result<()> {
        if self.worker.poll_interval_secs == 0 {
            return Err(DripError::Config("worker.poll_interval_secs must be > 0".into()));
        }
        if self.worker.max_retries == 0 {
            return Err(DripError::Config("worker.max_retries must be > 0".into()));
        }
        if self.worker.rate_limit_attempts == 0 {
            return Err(DripError::Config("worker.rate_limit_attempts must be > 0".into()));
        }
        if self.broadcast.batch_size == 0 {
            return Err(DripError::Config("broadcast.batch_size must be > 0".into()));
        }
        if let Some(cleanup) = &self.sequence.cleanup
            && (cleanup.after_step == 0 || cleanup.after_step > self.sequence.steps.len())
        {
            return Err(DripError::Config(format!(
                "sequence.cleanup.after_step = {} does not name a configured step (1..={})",
                cleanup.after_step,
                self.sequence.steps.len()
            )));
        }
        if let Some(final_step) = &self.sequence.final_step
            && final_step.skip_if.trim().is_empty()
        {
            return Err(DripError::Config("sequence.final.skip_if must not be empty".into()));
        }
        self.check_delays()?;
        Ok(())
    }

    fn check_delays(&self) -> Result<()> {
        let mut delays: Vec<(String, u64)> = self
            .sequence
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (format!("sequence.steps[{i}].delay_secs"), step.delay_secs))
            .collect();
        if let Some(cleanup) = &self.sequence.cleanup {
            delays.push(("sequence.cleanup.window_secs".into(), cleanup.window_secs));
        }
        if let Some(final_step) = &self.sequence.final_step {
            delays.push(("sequence.final.delay_secs".into(), final_step.delay_secs));
        }
        match delays.into_iter().find(|(_, secs)| *secs > MAX_DELAY_SECS) {
            Some((field, secs)) => Err(DripError::Config(format!(
                "{field} = {secs} exceeds the {MAX_DELAY_SECS}s limit"
            ))),
            None => Ok(()),
        }
    }

    /// Like [`validate`](Self::validate), plus the settings only a live bot needs.
    pub fn validate_for_bot(&self) -> Result<()> {
        self.validate()?;
        if self.telegram.bot_token.is_empty() {
            return Err(DripError::Config(format!(
                "telegram.bot_token is empty (set it in config or {BOT_TOKEN_ENV})"
            )));
        }
        Ok(())
    }

    /// A starter config with the classic 30s / 3min / 2h sequence.
    pub fn sample() -> Self {
        let source = -1001234567890;
        let join = Button::Url {
            label: "⭐ Join Now".into(),
            url: default_channel_url(),
        };
        let joined = Button::Callback {
            label: "✅ I Joined".into(),
            data: "join_channel".into(),
        };
        Self {
            telegram: TelegramConfig {
                source_channel_id: source,
                ..TelegramConfig::default()
            },
            sequence: SequenceConfig {
                welcome: Some(StepContent {
                    content: Content::copy(source, 1),
                    buttons: vec![join.clone()],
                }),
                steps: vec![
                    StepConfig {
                        delay_secs: 30,
                        content: Content::copy(source, 2),
                        buttons: vec![join.clone(), joined.clone()],
                    },
                    StepConfig {
                        delay_secs: 180,
                        content: Content::copy(source, 3),
                        buttons: vec![join.clone(), joined.clone()],
                    },
                ],
                cleanup: None,
                final_step: Some(FinalStepConfig {
                    delay_secs: 7200,
                    content: Content::copy(source, 4),
                    buttons: vec![join, joined],
                    skip_if: "verify".into(),
                }),
            },
            ..Self::default()
        }
    }
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// User allowed to run /stats and /send.
    #[serde(default)]
    pub admin_user_id: i64,
    /// Channel whose posts are copied to recipients.
    #[serde(default)]
    pub source_channel_id: i64,
    #[serde(default = "default_channel_url")]
    pub channel_url: String,
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_channel_url() -> String { "https://t.me/your_channel".into() }
fn default_long_poll_timeout() -> u64 { 30 }
fn default_request_timeout() -> u64 { 15 }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            admin_user_id: 0,
            source_channel_id: 0,
            channel_url: default_channel_url(),
            long_poll_timeout_secs: default_long_poll_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Scheduled-delivery worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Transient failures a task may absorb before it is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Gateway calls per attempt while the gateway keeps asking us to wait.
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_attempts: u32,
    /// Added on top of every gateway-requested wait.
    #[serde(default = "default_rate_limit_margin")]
    pub rate_limit_margin_secs: u64,
}

fn default_poll_interval() -> u64 { 5 }
fn default_max_retries() -> u32 { 3 }
fn default_rate_limit_attempts() -> u32 { 3 }
fn default_rate_limit_margin() -> u64 { 1 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_retries: default_max_retries(),
            rate_limit_attempts: default_rate_limit_attempts(),
            rate_limit_margin_secs: default_rate_limit_margin(),
        }
    }
}

/// Broadcast fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between batches, in milliseconds.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Source channel posts starting with this prefix are broadcast.
    #[serde(default = "default_channel_trigger")]
    pub channel_trigger: String,
}

fn default_batch_size() -> usize { 10 }
fn default_pacing_ms() -> u64 { 500 }
fn default_channel_trigger() -> String { "/chat".into() }

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            pacing_ms: default_pacing_ms(),
            channel_trigger: default_channel_trigger(),
        }
    }
}

/// The drip sequence created for every new enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Sent right away on enrollment; not a scheduled task.
    #[serde(default)]
    pub welcome: Option<StepContent>,
    /// Delayed content steps, in order.
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub cleanup: Option<CleanupConfig>,
    #[serde(default, rename = "final")]
    pub final_step: Option<FinalStepConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContent {
    pub content: Content,
    #[serde(default)]
    pub buttons: Vec<Button>,
}

/// One delayed content step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Seconds after enrollment. Zero makes it an immediate step.
    pub delay_secs: u64,
    pub content: Content,
    #[serde(default)]
    pub buttons: Vec<Button>,
}

/// Farewell sent a fixed window after one of the content steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// 1-based index into `steps`.
    pub after_step: usize,
    pub window_secs: u64,
    #[serde(default = "default_farewell")]
    pub farewell: String,
}

fn default_farewell() -> String { "Thanks for using this bot! Nice to meet you 👋".into() }

/// Last step; skipped when the recipient already produced `skip_if`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalStepConfig {
    pub delay_secs: u64,
    pub content: Content,
    #[serde(default)]
    pub buttons: Vec<Button>,
    /// Engagement kind (button callback data) that satisfies this step.
    pub skip_if: String,
}

/// Reporting surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_stats_ttl() -> u64 { 60 }

impl Default for StatsConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: default_stats_ttl() }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.dripcast/dripcast.db".into() }

impl StorageConfig {
    /// Database path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}
