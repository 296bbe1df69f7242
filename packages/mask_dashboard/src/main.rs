use anyhow::{Context, Result};
use clap::Parser;
use mask_feed::config::load_file_config;
use mask_feed::{
    ConnectionManager, ConnectionState, FeedConfig, FrameData, HistoryView, MessageHub,
    StatsView, TimeStatsView, VideoView,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

/// How often the connection counters are logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "mask-dashboard")]
#[command(about = "Live view of the mask detection backend's event feed")]
struct Cli {
    /// Backend event endpoint (overrides the config file and MASK_FEED_URL)
    #[arg(long)]
    url: Option<String>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Delay before each reconnect attempt, in milliseconds
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "mask_dashboard=debug,mask_feed=debug,info"
    } else {
        "mask_dashboard=info,mask_feed=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = resolve_config(&cli).context("Invalid configuration")?;
    info!(
        url = %config.url,
        reconnect_delay_ms = config.reconnect_delay.as_millis() as u64,
        "Starting mask dashboard"
    );
    info!("Camera stream: {}", config.camera_stream_url());

    let manager = Arc::new(ConnectionManager::new(config));
    let hub = MessageHub::new(manager.clone());

    run_dashboard(&hub, &manager).await;

    manager.shutdown().await;
    info!("Dashboard stopped");
    Ok(())
}

/// Layer CLI overrides on top of defaults, the config file and the environment.
fn resolve_config(cli: &Cli) -> Result<FeedConfig> {
    let mut fc = load_file_config(cli.config.as_deref())?;
    if let Some(url) = &cli.url {
        fc.url = url.clone();
    }
    if let Some(ms) = cli.reconnect_delay_ms {
        fc.reconnect_delay_ms = ms;
    }
    Ok(FeedConfig::from_file(&fc)?)
}

async fn run_dashboard(hub: &MessageHub, manager: &ConnectionManager) {
    let mut transitions = manager.subscribe_transitions();
    let mut stats = hub.activate::<StatsView>();
    let mut history = hub.activate::<HistoryView>();
    let mut time_stats = hub.activate::<TimeStatsView>();
    let mut video = hub.activate::<VideoView>();

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received shutdown signal, closing connection...");
                break;
            }
            Ok(t) = transitions.recv() => {
                if t.to == ConnectionState::Reconnecting {
                    warn!(from = %t.from, "Lost backend connection, retrying");
                } else {
                    info!(from = %t.from, to = %t.to, "Connection state changed");
                }
            }
            Some(s) = stats.changed() => {
                info!(
                    total = s.total,
                    with_mask = s.with_mask,
                    without_mask = s.without_mask,
                    "Detection stats"
                );
            }
            Some(h) = history.changed() => {
                info!(
                    records = h.records.len(),
                    without_mask = h.without_mask_count(),
                    latest = ?h.latest().map(|r| r.timestamp),
                    "Detection history"
                );
            }
            Some(t) = time_stats.changed() => {
                info!(
                    avg_with_mask_secs = t.avg_time_with_mask,
                    avg_without_mask_secs = t.avg_time_without_mask,
                    total_secs = t.total_time,
                    "Time stats"
                );
            }
            Some(v) = video.changed() => {
                let bytes = match &v.latest {
                    Some(FrameData::Encoded(s)) => s.len(),
                    Some(FrameData::Raw(b)) => b.len(),
                    None => 0,
                };
                debug!(frames_seen = v.frames_seen, bytes, "Video frame");
            }
            _ = status.tick() => {
                let m = manager.metrics();
                info!(
                    state = %manager.state(),
                    attempts = m.connect_attempts,
                    opened = m.connections_opened,
                    received = m.messages_received,
                    malformed = m.malformed_dropped,
                    lagged = m.lagged_dropped,
                    "Feed status"
                );
            }
        }
    }
}
