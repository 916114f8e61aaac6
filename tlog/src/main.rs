//! tlog - inspect and drive the event tracker from the command line
//!
//! Uses XDG Base Directory specification for file locations:
//! - Durable storage: $XDG_DATA_HOME/tlog/storage.db (~/.local/share/tlog/storage.db)
//! - Logs: $XDG_STATE_HOME/tlog/tlog.log (~/.local/state/tlog/tlog.log)
//! - Config: $XDG_CONFIG_HOME/tlog/config.toml (~/.config/tlog/config.toml)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tlog_core::storage::{queue_key, session_key, SqliteArea, StorageKind, StorageManager, USER_ID_KEY};
use tlog_core::transport::RecoveryOutcome;
use tlog_core::{Config, PageViewData, PersistedPayload, SessionRecord, Tracker};

/// Beacon threads are detached; give them this long before the process exits
const BEACON_GRACE: Duration = Duration::from_millis(1_500);

#[derive(Parser)]
#[command(name = "tlog")]
#[command(about = "Event delivery and session tracking")]
#[command(version)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/tlog/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also print log output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, stored session and pending recovery payload
    Status,

    /// Resend the batch persisted by an earlier run
    Recover,

    /// Start a session, send one custom event and stop
    Send {
        /// Custom event name
        name: String,

        /// Event metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,

        /// Page URL to report a page view for first
        #[arg(long)]
        page: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    if args.verbose {
        config.logging.stderr = true;
    }

    let _log_guard =
        tlog_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(project = %config.project.id, "tlog starting");

    match args.command {
        Command::Status => status(&config),
        Command::Recover => recover(config).await,
        Command::Send {
            name,
            metadata,
            page,
        } => send(config, &name, metadata.as_deref(), page.as_deref()).await,
    }
}

fn status(config: &Config) -> Result<()> {
    let storage_path = Config::storage_path();
    let now = chrono::Utc::now().timestamp_millis();

    println!("Config:   {}", Config::config_path().display());
    println!("Storage:  {}", storage_path.display());
    println!("Project:  {}", config.project.id);
    println!(
        "Endpoint: {}",
        config.collector.endpoint.as_deref().unwrap_or("(not configured)")
    );
    println!("Sampling: {}", config.tracking.sampling_rate);
    println!(
        "Session timeout: {}s",
        config.tracking.session_timeout_ms / 1000
    );

    let area = SqliteArea::open(&storage_path).context("failed to open durable storage")?;
    let storage = StorageManager::new(Some(Box::new(area)), None);

    match storage.get(StorageKind::Durable, USER_ID_KEY) {
        Some(user_id) => println!("User:     {}", user_id),
        None => println!("User:     (none yet)"),
    }

    match storage.get_json::<SessionRecord>(StorageKind::Durable, &session_key(&config.project.id)) {
        Some(record) => {
            let idle = now - record.last_activity;
            let state = if idle < config.tracking.session_timeout_ms as i64 {
                "resumable"
            } else {
                "expired"
            };
            println!(
                "Session:  {} (idle {}s, {})",
                record.id,
                idle / 1000,
                state
            );
        }
        None => println!("Session:  (none)"),
    }

    match storage.get_json::<PersistedPayload>(StorageKind::Durable, &queue_key(&config.project.id)) {
        Some(payload) => println!(
            "Pending:  {} event(s) persisted {}s ago",
            payload.batch.events.len(),
            (now - payload.timestamp) / 1000
        ),
        None => println!("Pending:  (nothing persisted)"),
    }

    Ok(())
}

async fn recover(config: Config) -> Result<()> {
    let tracker = Tracker::open(config).context("failed to open tracker")?;
    let outcome = tracker.recover_persisted_events().await;
    tracing::info!(?outcome, "Recovery finished");

    let message = match outcome {
        RecoveryOutcome::NothingPersisted => "nothing to recover",
        RecoveryOutcome::AlreadyRunning => "recovery already running",
        RecoveryOutcome::Corrupt => "persisted payload was corrupt and has been discarded",
        RecoveryOutcome::Discarded => "persisted payload was stale and has been discarded",
        RecoveryOutcome::Delivered => "persisted payload delivered",
        RecoveryOutcome::Rejected => "persisted payload rejected by the endpoint and discarded",
        RecoveryOutcome::Retained => "delivery failed, payload kept for the next attempt",
    };
    println!("{}", message);
    Ok(())
}

async fn send(config: Config, name: &str, metadata: Option<&str>, page: Option<&str>) -> Result<()> {
    let metadata = metadata
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--metadata is not valid JSON")?;

    let mut tracker = Tracker::open(config).context("failed to open tracker")?;
    tracker
        .start_tracking()
        .context("failed to start session")?;
    println!("Session:  {}", tracker.session_id().unwrap_or("(none)"));

    if let Some(url) = page {
        tracker.navigate(url, PageViewData::default());
    }
    tracker
        .send_custom_event(name, metadata)
        .context("custom event rejected")?;

    let delivered = tracker.flush_immediately().await;
    if delivered {
        println!("Delivered: {}", name);
    } else {
        println!("Not delivered, batch kept for recovery");
    }

    tracker.stop_tracking();
    tokio::time::sleep(BEACON_GRACE).await;

    let stats = tracker.delivery().stats();
    tracing::info!(
        batches_sent = stats.batches_sent,
        batches_persisted = stats.batches_persisted,
        "tlog finished"
    );
    Ok(())
}
