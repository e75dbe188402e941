//! enrichq CLI: operator probe for the reaction enrichment pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use enrichq::client::ReactionsClient;
use enrichq::config::Config;
use enrichq::event::{EventBus, EventKind};
use enrichq::model::{FetchState, Fingerprint, ItemId, ReactionEmoji, ReactionKind};
use enrichq::queue::SequentialQueue;
use enrichq::reactions::WhoReacted;
use enrichq::telemetry::init_telemetry;
use secrecy::ExposeSecret;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "enrichq", about = "Rate-limited reaction enrichment")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch and print the users behind one or more reactions on a message
    Probe {
        /// Channel id
        #[arg(long)]
        channel: String,
        /// Message id
        #[arg(long)]
        message: String,
        /// Emoji name (unicode emoji or custom emoji name); repeatable
        #[arg(long, required = true)]
        emoji: Vec<String>,
        /// Custom emoji id, applied to every --emoji
        #[arg(long)]
        emoji_id: Option<String>,
        /// Ask for super (burst) reactions instead of normal ones
        #[arg(long)]
        burst: bool,
        /// Seconds to wait for all fetches to settle
        #[arg(long, default_value_t = 15)]
        wait_secs: u64,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Config => cmd_config(&config),
        Command::Probe {
            channel,
            message,
            emoji,
            emoji_id,
            burst,
            wait_secs,
        } => {
            let _guard = init_telemetry(config.telemetry.clone())?;
            let kind = if burst {
                ReactionKind::Burst
            } else {
                ReactionKind::Normal
            };
            let item = ItemId::new(channel, message);
            let fingerprints = emoji
                .into_iter()
                .map(|name| {
                    let emoji = match &emoji_id {
                        Some(id) => ReactionEmoji::custom(name, id.clone()),
                        None => ReactionEmoji::unicode(name),
                    };
                    Fingerprint::new(item.clone(), emoji, kind)
                })
                .collect::<Result<Vec<_>, _>>()?;
            cmd_probe(&config, &fingerprints, Duration::from_secs(wait_secs)).await
        }
    }
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("API Base:       {}", config.api.base_url);
    println!(
        "API Token:      {}",
        match &config.api.token {
            Some(t) if !t.expose_secret().is_empty() => "set",
            _ => "-",
        }
    );
    println!("Page Limit:     {}", config.api.page_limit);
    println!("Timeout:        {:?}", config.api.request_timeout);
    println!("Cooldown:       {:?}", config.queue.cooldown);
    println!(
        "Max Pending:    {}",
        config
            .queue
            .max_pending
            .map(|n| n.to_string())
            .unwrap_or("-".to_string())
    );
    println!(
        "Cache Capacity: {}",
        config
            .cache
            .capacity
            .map(|n| n.to_string())
            .unwrap_or("-".to_string())
    );
    println!(
        "Retry After:    {}",
        config
            .cache
            .retry_after
            .map(|d| format!("{d:?}"))
            .unwrap_or("-".to_string())
    );
    println!(
        "OTel Endpoint:  {}",
        config.telemetry.endpoint.as_deref().unwrap_or("-")
    );
    println!("Log Level:      {}", config.telemetry.log_level);
    Ok(())
}

async fn cmd_probe(
    config: &Config,
    fingerprints: &[Fingerprint],
    wait: Duration,
) -> anyhow::Result<()> {
    let client = Arc::new(ReactionsClient::new(&config.api)?);
    let queue = Arc::new(SequentialQueue::new(config.queue.clone())?);
    let bus = Arc::new(EventBus::default());
    let who = WhoReacted::new(client, Arc::clone(&queue), bus, config.cache.clone());

    // Subscribe before scheduling so no update is missed.
    let mut updates = who.subscribe();
    for fp in fingerprints {
        let users = who.users(fp);
        println!("{fp}: {} user(s) cached, fetch {}", users.len(), state_label(&who, fp));
    }

    let deadline = tokio::time::Instant::now() + wait;
    while fingerprints
        .iter()
        .any(|fp| who.state(fp) == Some(FetchState::InFlight))
    {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        if left.is_zero() {
            eprintln!("timed out after {wait:?} waiting for fetches");
            break;
        }
        // Failed fetches publish nothing, so re-check state periodically too.
        match tokio::time::timeout(left.min(Duration::from_millis(250)), updates.recv()).await {
            Ok(Err(RecvError::Closed)) => anyhow::bail!("update stream closed"),
            Ok(Ok(event)) => {
                let records = match &event.kind {
                    EventKind::EnrichmentUpdated { records, .. } => *records,
                };
                println!("update #{} for {}: {records} user(s)", event.seq, event.kind.item());
            }
            _ => {}
        }
    }

    for fp in fingerprints {
        let users = who.peek_users(fp);
        println!();
        println!("{fp} ({})", state_label(&who, fp));
        println!("{:<20}  {:<24}  {:<24}  BOT", "ID", "USERNAME", "DISPLAY");
        println!("{}", "-".repeat(76));
        for user in &users {
            println!(
                "{:<20}  {:<24}  {:<24}  {}",
                user.id,
                user.username,
                user.display_name(),
                if user.bot { "yes" } else { "" }
            );
        }
        println!("{} user(s)", users.len());
    }

    queue.shutdown().await;
    Ok(())
}

fn state_label(who: &WhoReacted, fp: &Fingerprint) -> String {
    who.state(fp)
        .map(|s| s.to_string())
        .unwrap_or("-".to_string())
}
