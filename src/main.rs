//! Edge data bridge.
//!
//! Main entry point. Loads configuration, prepares the local store, starts
//! the bridge and coordinates graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use edge_bridge::{
    config::{Config, DEFAULT_CONFIG_FILE},
    feed::HttpChangeFeed,
    storage,
    BridgeEngine,
};
use edge_core::{Clock, RealClock};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    init_tracing(&config.rust_log)?;

    info!(
        config_path = %config_path,
        api_server = %config.resources_api_server,
        resource = %config.resource,
        storage = %config.storage,
        couch_url = %config.couch_url_masked(),
        db_name = %config.db_name,
        bridge_id = %config.bridge_id,
        "configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let storage = storage::open(config.to_storage_config(), clock.clone())
        .await
        .context("Failed to prepare local storage")?;

    let feed = HttpChangeFeed::new(config.to_feed_config(), clock.clone())
        .context("Failed to create change feed")?;

    let mut engine =
        BridgeEngine::new(config.to_bridge_config(), storage, Arc::new(feed), clock);
    engine.start().await.context("Failed to start bridge")?;

    let failure = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received, starting graceful shutdown");
            None
        },
        result = engine.wait_for_failure() => result.err(),
    };

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "bridge shutdown incomplete");
    }

    if let Some(e) = failure {
        error!(message_id = e.message_id(), code = e.code(), error = %e, "bridge stopped on fatal error");
        return Err(e).context("Bridge stopped on fatal error");
    }

    info!("edge bridge shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C signal");
        },
        () = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
