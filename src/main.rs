//! # Dripcast
//!
//! Drip-sequence and broadcast delivery bot.
//!
//! Usage:
//!   dripcast init-config                 # Write a starter ~/.dripcast/config.toml
//!   dripcast run                         # Bot (long polling) + delivery worker
//!   dripcast worker                      # Delivery worker only
//!   dripcast enroll 123456               # Enroll a chat id by hand
//!   dripcast stop 123456                 # Opt a chat id out
//!   dripcast stats --json                # Aggregate counts

mod commands;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dripcast_channels::TelegramGateway;
use dripcast_core::config::DripConfig;
use dripcast_core::traits::Gateway;
use dripcast_scheduler::{
    Dispatcher, EnrollOutcome, Enroller, RecipientProfile, TaskStore, Worker, spawn_worker,
};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use crate::commands::{Command, Router};

#[derive(Parser)]
#[command(
    name = "dripcast",
    version,
    about = "💧 Dripcast: drip sequences and broadcasts over Telegram"
)]
struct Cli {
    /// Config file (default: ~/.dripcast/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the bot and the delivery worker
    Run,
    /// Run only the delivery worker
    Worker,
    /// Enroll a chat id into the sequence
    Enroll {
        chat_id: i64,
        /// Deep-link payload to record
        #[arg(long)]
        payload: Option<String>,
    },
    /// Opt a chat id out, cancelling its pending deliveries
    Stop { chat_id: i64 },
    /// Print aggregate counts
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Write a starter config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    match &cli.config {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => DripConfig::default_path(),
    }
}

fn load_config(cli: &Cli) -> Result<DripConfig> {
    let path = config_path(cli);
    let config = if cli.config.is_some() || path.exists() {
        DripConfig::load_from(&path)
            .with_context(|| format!("loading config from {}", path.display()))?
    } else {
        tracing::warn!("⚠️ No config at {}, using defaults", path.display());
        DripConfig::load()?
    };
    config.validate()?;
    Ok(config)
}

fn open_store(config: &DripConfig) -> Result<Arc<TaskStore>> {
    let db_path = config.storage.resolved_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = TaskStore::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    tracing::info!("💾 Database: {}", db_path.display());
    Ok(Arc::new(store))
}

fn build_worker(config: &DripConfig, store: Arc<TaskStore>, gateway: Arc<dyn Gateway>) -> Worker {
    let dispatcher = Dispatcher::new(store.clone(), gateway, &config.worker);
    Worker::new(
        store,
        dispatcher,
        Duration::from_secs(config.worker.poll_interval_secs),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "dripcast=debug,dripcast_scheduler=debug,dripcast_channels=debug"
    } else {
        "dripcast=info,dripcast_scheduler=info,dripcast_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match &cli.command {
        Cmd::InitConfig { force } => init_config(&cli, *force),
        Cmd::Run => run_bot(load_config(&cli)?).await,
        Cmd::Worker => run_worker(load_config(&cli)?).await,
        Cmd::Enroll { chat_id, payload } => {
            let config = load_config(&cli)?;
            let enroller = Enroller::new(open_store(&config)?, config.sequence.clone());
            let profile = RecipientProfile {
                start_payload: payload.clone(),
                ..RecipientProfile::new(*chat_id)
            };
            match enroller.enroll(&profile, chrono::Utc::now().timestamp())? {
                EnrollOutcome::Enrolled { task_ids } => {
                    println!("✅ Enrolled {chat_id} with {} tasks", task_ids.len());
                }
                EnrollOutcome::Returning => println!("👋 {chat_id} is already enrolled"),
            }
            Ok(())
        }
        Cmd::Stop { chat_id } => {
            let config = load_config(&cli)?;
            let enroller = Enroller::new(open_store(&config)?, config.sequence.clone());
            let cancelled = enroller.opt_out(*chat_id)?;
            println!("✅ {chat_id} opted out, cancelled {cancelled} pending tasks");
            Ok(())
        }
        Cmd::Stats { json } => {
            let config = load_config(&cli)?;
            let stats = open_store(&config)?.stats()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", commands::format_stats(&stats));
            }
            Ok(())
        }
    }
}

fn init_config(cli: &Cli, force: bool) -> Result<()> {
    let path = config_path(cli);
    if path.exists() && !force {
        println!("⚠️  {} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    DripConfig::sample().save_to(&path)?;
    println!("✅ Wrote starter config to {}", path.display());
    println!("   Set telegram.bot_token (or DRIPCAST_BOT_TOKEN) before `dripcast run`.");
    Ok(())
}

async fn run_worker(config: DripConfig) -> Result<()> {
    config.validate_for_bot()?;
    let store = open_store(&config)?;
    let gateway: Arc<dyn Gateway> = Arc::new(TelegramGateway::new(&config.telegram)?);
    let (stop, handle) = spawn_worker(build_worker(&config, store, gateway));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down...");
    stop.send(true).ok();
    handle.await?;
    Ok(())
}

async fn run_bot(config: DripConfig) -> Result<()> {
    config.validate_for_bot()?;
    if config.telegram.admin_user_id == 0 {
        tracing::warn!("⚠️ telegram.admin_user_id not set (admin commands won't work)");
    }
    if config.telegram.source_channel_id == 0 {
        tracing::warn!("⚠️ telegram.source_channel_id not set (channel broadcasts disabled)");
    }

    let store = open_store(&config)?;
    let telegram = Arc::new(TelegramGateway::new(&config.telegram)?);
    let me = telegram.get_me().await?;
    tracing::info!(
        "🤖 Telegram bot: @{} ({})",
        me.username.as_deref().unwrap_or("unknown"),
        me.first_name
    );

    let gateway: Arc<dyn Gateway> = telegram.clone();
    let (stop, worker) = spawn_worker(build_worker(&config, store.clone(), gateway.clone()));
    let router = Arc::new(Router::new(config.clone(), store, gateway));
    let mut updates = telegram.clone().start_polling();

    tracing::info!("✅ Bot is running! Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(update) = update else { break };
                let Some(command) = Command::parse(&update, &config) else { continue };
                if let Command::Click { callback_id, .. } = &command
                    && let Err(e) = telegram.answer_callback_query(callback_id, None).await
                {
                    tracing::warn!("⚠️ answerCallbackQuery failed: {e}");
                }
                tracing::debug!("📨 {command:?}");
                if router.handle(command, chrono::Utc::now().timestamp()).await.is_some() {
                    tracing::info!("📢 Broadcast started in the background");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 Shutting down...");
                break;
            }
        }
    }

    stop.send(true).ok();
    worker.await?;
    Ok(())
}
