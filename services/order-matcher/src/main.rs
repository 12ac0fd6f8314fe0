//! Order Matcher Service
//!
//! Runs the matching loop until Ctrl+C or SIGTERM, then stops after the
//! in-flight tick.

use anyhow::Result;
use clap::Parser;
use order_matcher::{MatcherConfig, MatchingService};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "order-matcher";

/// Order matcher CLI
#[derive(Parser)]
#[command(name = "order-matcher")]
#[command(about = "Price-time priority order matching service")]
struct Cli {
    /// TOML configuration file; `MATCHER__*` environment variables override it
    #[arg(long, short = 'c')]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    info!("Starting Order Matcher Service v{}", env!("CARGO_PKG_VERSION"));

    let config = MatcherConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        backend = if config.uses_database() { "postgres" } else { "memory" },
        tick_interval_ms = config.scheduler.tick_interval_ms,
        max_concurrent_tickers = config.scheduler.max_concurrent_tickers,
        "Configuration loaded"
    );

    let service = MatchingService::new(config).await?;
    let stats = service.start().await?;
    info!(
        live_orders = stats.live_orders,
        enqueued = stats.orders_enqueued,
        stale_removed = stats.stale_removed,
        "Matching started"
    );

    shutdown_signal().await;

    service.shutdown().await;
    let metrics = serde_json::to_string(&service.metrics())?;
    info!("Final metrics: {}", metrics);
    info!("Order Matcher Service shutdown complete");
    Ok(())
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", SERVICE_NAME.replace('-', "_")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
