//! Broadcaster Development Runner
//!
//! Runs a single broadcast end-to-end:
//! - loads configuration (TOML + BROADCAST_* overrides)
//! - seeds one recipient list in the in-memory or SQLite store
//! - dispatches through a simulated transport with configurable failures
//!   and disconnects
//! - reports progress every second, cancels on Ctrl-C

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::signal;
use tracing::{info, warn};

use bc_common::logging::init_logging;
use bc_common::{BroadcastRequest, ListId, MessageType, Recipient};
use bc_config::{AppConfig, ConfigLoader};
use bc_engine::{BroadcastEngine, DeliveryError, DeliveryReceipt, EngineConfig, RecipientSink};
use bc_store::sqlite::SqliteStore;
use bc_store::{InMemoryStore, JobStore, RecipientDirectory};

/// Broadcaster development runner
#[derive(Parser, Debug)]
#[command(name = "bc-dev")]
#[command(about = "Run one broadcast against a simulated transport")]
struct Args {
    /// Configuration file (defaults to the standard search paths)
    #[arg(long, env = "BROADCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Comma separated recipient addresses
    #[arg(long, value_delimiter = ',')]
    recipients: Vec<String>,

    /// File with one recipient address per line
    #[arg(long)]
    recipients_file: Option<PathBuf>,

    /// Message text, or caption for media messages
    #[arg(long, default_value = "Hello from bc-dev")]
    message: String,

    /// text, image, document, audio or video
    #[arg(long, default_value = "text")]
    message_type: String,

    /// Media reference for media messages
    #[arg(long)]
    media_ref: Option<String>,

    /// Probability in [0, 1] that a simulated send fails
    #[arg(long, env = "BC_DEV_FAIL_RATE", default_value = "0.0", value_parser = parse_fail_rate)]
    fail_rate: f64,

    /// Simulate the transport disconnecting after this many sends
    #[arg(long, env = "BC_DEV_DISCONNECT_AFTER")]
    disconnect_after: Option<u64>,

    /// Simulated transport latency per send
    #[arg(long, env = "BC_DEV_SEND_LATENCY_MS", default_value = "50")]
    send_latency_ms: u64,

    /// Use the in-memory store regardless of the configured database
    #[arg(long)]
    memory: bool,

    /// Print an example configuration file and exit
    #[arg(long)]
    print_config: bool,
}

fn parse_fail_rate(value: &str) -> std::result::Result<f64, String> {
    let rate: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid fail rate {:?}: {}", value, e))?;
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        return Err(format!("fail rate must be between 0 and 1, got {}", value));
    }
    Ok(rate)
}

/// Transport stand-in: fails a fraction of sends at random, rejects
/// addresses containing whitespace and can drop its connection after a
/// number of sends
struct SimulatedSink {
    fail_rate: f64,
    latency: Duration,
    disconnect_after: Option<u64>,
    connected: AtomicBool,
    next_id: AtomicU64,
}

impl SimulatedSink {
    fn new(fail_rate: f64, latency: Duration, disconnect_after: Option<u64>) -> Self {
        Self {
            fail_rate,
            latency,
            disconnect_after,
            connected: AtomicBool::new(disconnect_after != Some(0)),
            next_id: AtomicU64::new(1),
        }
    }

    async fn simulate(&self, recipient: &str) -> Result<DeliveryReceipt, DeliveryError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DeliveryError::NotReady);
        }
        if recipient.is_empty() || recipient.chars().any(char::is_whitespace) {
            return Err(DeliveryError::InvalidRecipient(recipient.to_string()));
        }

        tokio::time::sleep(self.latency).await;

        let sequence = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self.disconnect_after.is_some_and(|limit| sequence >= limit) {
            warn!(sends = sequence, "Simulated transport disconnected");
            self.connected.store(false, Ordering::SeqCst);
        }

        let fail = rand::rng().random_bool(self.fail_rate);
        if fail {
            return Err(DeliveryError::Transport(format!(
                "simulated failure for {}",
                recipient
            )));
        }
        Ok(DeliveryReceipt {
            message_id: format!("sim-{}", sequence),
            timestamp: chrono::Utc::now(),
        })
    }
}

#[async_trait]
impl RecipientSink for SimulatedSink {
    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, recipient: &str, _text: &str) -> Result<DeliveryReceipt, DeliveryError> {
        self.simulate(recipient).await
    }

    async fn send_media(
        &self,
        recipient: &str,
        _media_type: MessageType,
        _media_ref: &str,
        _caption: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.simulate(recipient).await
    }
}

fn load_recipients(args: &Args) -> Result<Vec<Recipient>> {
    let mut addresses: Vec<String> = args
        .recipients
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();

    if let Some(path) = &args.recipients_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading recipients from {}", path.display()))?;
        addresses.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    if addresses.is_empty() {
        bail!("no recipients given, use --recipients or --recipients-file");
    }
    Ok(addresses.into_iter().map(Recipient::new).collect())
}

async fn build_store(
    config: &AppConfig,
    force_memory: bool,
    recipients: Vec<Recipient>,
) -> Result<(Arc<dyn JobStore>, Arc<dyn RecipientDirectory>, ListId)> {
    if force_memory || config.database.uri == "memory" {
        info!("Using in-memory store");
        let store = Arc::new(InMemoryStore::new());
        let list_id = store.create_list("bc-dev", recipients);
        let jobs: Arc<dyn JobStore> = store.clone();
        return Ok((jobs, store, list_id));
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir))?;

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.uri)
        .await
        .with_context(|| format!("connecting to {}", config.database.uri))?;

    let store = Arc::new(SqliteStore::new(pool));
    store.init_schema().await?;
    let list_id = store.create_list("bc-dev", recipients).await?;
    info!(uri = %config.database.uri, "Using SQLite store");
    let jobs: Arc<dyn JobStore> = store.clone();
    Ok((jobs, store, list_id))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    init_logging("bc-dev");

    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()).load()?,
        None => ConfigLoader::new().load()?,
    };

    let message_type: MessageType = args.message_type.parse()?;
    let recipients = load_recipients(&args)?;
    info!(recipients = recipients.len(), "Recipients loaded");

    let (store, directory, list_id) = build_store(&config, args.memory, recipients).await?;

    let sink = Arc::new(SimulatedSink::new(
        args.fail_rate,
        Duration::from_millis(args.send_latency_ms),
        args.disconnect_after,
    ));
    let engine = BroadcastEngine::new(EngineConfig::from(&config.broadcast), store, directory, sink)?;

    let request = BroadcastRequest {
        list_id,
        message_type,
        content: args.message.clone(),
        media_ref: args.media_ref.clone(),
    };
    let accepted = engine.create_broadcast(request).await?;
    info!(
        job_id = %accepted.job_id,
        total_recipients = accepted.total_recipients,
        estimated_secs = accepted.estimated_time.as_secs(),
        "Broadcast started, press Ctrl-C to cancel"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let final_status = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = engine.get_status(accepted.job_id).await?;
                if status.status.is_terminal() {
                    break status;
                }
                info!(
                    sent = status.sent_count,
                    failed = status.failed_count,
                    total = status.total_recipients,
                    progress = format!("{:.1}%", status.progress),
                    "Broadcast progress"
                );
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received, cancelling broadcast");
                if let Err(e) = engine.cancel(accepted.job_id).await {
                    warn!(error = %e, "Cancel rejected");
                }
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&final_status)?);

    if !engine.shutdown(Duration::from_secs(5)).await {
        warn!("Engine did not drain before exit");
    }
    Ok(())
}
