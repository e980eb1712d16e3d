//! Query bus bootstrap.
//!
//! Loads configuration from the environment (and `.env`), connects to the
//! database, starts the bus with one worker per pooled connection, probes
//! it with `SELECT 1` and then serves until Ctrl+C or SIGTERM, draining
//! queued work before exit.

use querybus_runtime::metrics::MetricsServer;
use querybus_runtime::{BusConfig, BusError, HealthReport, QueryBus};
use querybus_sqlx::{DatabaseConfig, SqlxConnectionProvider};
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "querybus=info,bus_probe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics_addr: SocketAddr = std::env::var("QUERYBUS_METRICS_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9090)));
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.start()?;

    let database = DatabaseConfig::from_env()?;
    let bus_config = BusConfig::from_env()?
        .with_pool_size(usize::try_from(database.max_open_connections)?);
    info!(
        dsn = %database.redacted_dsn(),
        pool_size = bus_config.pool_size,
        timeout_policy = %bus_config.timeout_policy,
        "Configuration loaded"
    );

    let provider = SqlxConnectionProvider::connect(&database).await?;
    let bus = QueryBus::start(provider, bus_config)?;

    probe(&bus).await?;
    let report = HealthReport::new(vec![bus.health(), bus.provider().health()]);
    for check in &report.checks {
        info!(
            component = %check.component,
            status = ?check.status,
            message = check.message.as_deref().unwrap_or("ok"),
            "Health check"
        );
    }
    info!(status = ?report.status, "Query bus ready");

    shutdown_signal().await;

    if let Err(e) = bus.shutdown_with_default().await {
        error!(error = %e, "Query bus did not drain cleanly");
    }
    bus.provider().close().await;
    if let Some(rendered) = metrics.render() {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Round-trip one read through the bus.
async fn probe(bus: &QueryBus<SqlxConnectionProvider>) -> Result<(), BusError> {
    let budget = bus.config().default_budget;
    let row = bus.submit_read("SELECT 1", budget).await?.first().await?;
    if row.is_none() {
        warn!("Probe query returned no rows");
    }
    info!("Probe query succeeded");
    Ok(())
}

/// Graceful shutdown signal handler.
///
/// Waits for Ctrl+C (SIGINT) or, on Unix, SIGTERM. If a handler cannot be
/// installed the other one is still awaited.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
