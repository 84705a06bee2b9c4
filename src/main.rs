//! objcache - standalone cache process
//!
//! Hosts a cache built from the environment, runs the expiration sweep and
//! logs statistics until shut down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use objcache::events::{ChannelListener, EventKind};
use objcache::{spawn_cleanup_task, Cache, Config};

/// Seconds between statistics log lines.
const STATS_INTERVAL_SECS: u64 = 60;

/// Main entry point.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Map the backing store and define configured indexes
/// 4. Start the background expiration sweep
/// 5. Log events and periodic statistics
/// 6. Handle graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "objcache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting objcache");

    let config = Config::from_env();
    info!(
        "Configuration loaded: {}",
        serde_json::to_string(&config).context("serializing configuration")?
    );

    let (listener, mut events) = ChannelListener::new();
    let cache = Arc::new(
        Cache::with_listener(config.clone(), Arc::new(listener))
            .context("initializing cache")?,
    );

    let cleanup_handle = spawn_cleanup_task(cache.clone(), config.cleanup_interval);
    info!("Background sweep started");

    let event_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.kind {
                EventKind::Expired => info!(key = %event.key, "Entry expired"),
                EventKind::LockAcquireFailed => warn!(key = %event.key, "Lock acquisition failed"),
                EventKind::IndexRebuilt { ref attribute } => {
                    info!(key = %event.key, attribute = %attribute, "Entry re-indexed")
                }
            }
        }
    });

    let stats_cache = cache.clone();
    let stats_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            match serde_json::to_string(&stats_cache.stats()) {
                Ok(stats) => info!("Stats: {}", stats),
                Err(e) => warn!("Could not serialize stats: {}", e),
            }
        }
    });

    shutdown_signal().await?;

    cleanup_handle.abort();
    stats_handle.abort();
    event_handle.abort();
    warn!("Background tasks aborted");

    info!("Shutdown complete, {} entries dropped", cache.len());
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;
        tokio::select! {
            result = ctrl_c => {
                result.context("installing Ctrl+C handler")?;
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("installing Ctrl+C handler")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
