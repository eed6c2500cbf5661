use aptos_pulse::config::Config;
use aptos_pulse::dispatch::{ChannelSink, LogSink};
use aptos_pulse::events::CanonicalEvent;
use aptos_pulse::monitor::Monitor;
use aptos_pulse::node::{HttpTransport, NodeClient, NodeQuery, ResponseCache, RetryPolicy};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

const CONFIG_FILE: &str = "aptos-pulse.toml";

/// Capacity of each collaborator channel.
const COLLABORATOR_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = if Path::new(CONFIG_FILE).exists() {
        Config::load(Path::new(CONFIG_FILE))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("aptos-pulse v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        node = %config.node.url,
        accounts = config.monitor.accounts.len(),
        poll_interval_secs = config.monitor.poll_interval_secs,
        cursor_path = %config.monitor.cursor_path.display(),
        "configuration loaded"
    );

    // --- Node client ---
    let transport = HttpTransport::new(&config.node.url, config.node.request_timeout())?;
    let client = Arc::new(NodeClient::new(
        Arc::new(transport),
        RetryPolicy::from(&config.retry),
        ResponseCache::new(),
    ));

    // --- Downstream collaborators ---
    let (content_sink, content_rx) = ChannelSink::new("content", COLLABORATOR_BUFFER);
    let (notify_sink, notify_rx) = ChannelSink::new("notifications", COLLABORATOR_BUFFER);
    let content_task = tokio::spawn(drain("content", content_rx));
    let notify_task = tokio::spawn(drain("notifications", notify_rx));

    // --- Monitor ---
    let monitor = Monitor::new(&config, client.clone())
        .with_sink(Arc::new(LogSink))
        .with_sink(Arc::new(content_sink))
        .with_sink(Arc::new(notify_sink));
    let (handle, monitor_task) = monitor.start();

    // Periodic status line
    let status_handle = handle.clone();
    let cache_ttl = Duration::from_secs(config.cache.ttl_secs);
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        interval.tick().await;
        loop {
            interval.tick().await;
            let status = status_handle.status();
            let metrics = status_handle.metrics();
            info!(
                state = %status.state,
                cursor = status.last_cursor,
                latest = status.latest_version.unwrap_or(0),
                degraded = status.degraded,
                uptime_secs = status.uptime_secs,
                cycles = status.cycles,
                events = metrics.total,
                cached_queries = client.cache().len(),
                ledger_cache_fresh = client.cache().is_fresh(&NodeQuery::LedgerInfo.signature(), cache_ttl),
                "monitor status"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    handle.stop();
    status_task.abort();

    if let Err(e) = monitor_task.await {
        error!(error = %e, "monitor task failed");
    }
    // The monitor owned the sinks; once it is gone the channels close.
    let _ = tokio::join!(content_task, notify_task);

    info!(cursor = handle.status().last_cursor, "stopped");
    Ok(())
}

/// Stand-in consumer for a downstream collaborator.
async fn drain(name: &'static str, mut rx: mpsc::Receiver<CanonicalEvent>) {
    while let Some(event) = rx.recv().await {
        info!(
            collaborator = name,
            id = %event.id,
            category = %event.category(),
            "received event"
        );
    }
}
