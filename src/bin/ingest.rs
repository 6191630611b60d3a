//! One-shot ingestion publisher: read both source feeds, join them, and
//! publish one message per unified record, then exit.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use analytics_aggregator::broker::{self, AmqpPublisher};
use analytics_aggregator::config::AppConfig;
use analytics_aggregator::ingest::{self, IngestPaths};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();

    let cfg = AppConfig::from_env();
    let paths = IngestPaths::new(&cfg.traffic_path, &cfg.performance_path);

    let conn = broker::connect_with_retry(&cfg.amqp_url).await?;
    let channel = conn.create_channel().await.context("creating channel")?;
    broker::declare_topology(&channel).await?;

    let publisher = AmqpPublisher::new(channel);
    let published = ingest::run_once(&publisher, &paths).await?;
    info!(published, "ingestion run finished");

    conn.close(200, "done").await.ok();
    Ok(())
}
