//! Analytics consumer worker — binary entrypoint.
//! Connects to the broker, ensures the topology, and runs the manual-ack
//! delivery loop until Ctrl+C.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use analytics_aggregator::config::AppConfig;
use analytics_aggregator::store::SqliteStore;
use analytics_aggregator::worker::ConsumerWorker;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::from_env();
    info!(amqp = %cfg.amqp_url, db = %cfg.database_path.display(), "starting worker");

    let store = Arc::new(SqliteStore::open(&cfg.database_path).await?);
    let worker = ConsumerWorker::new(&cfg.amqp_url, store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    worker.run(shutdown_rx).await
}
