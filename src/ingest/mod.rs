// src/ingest/mod.rs
pub mod sources;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tracing::info;

use crate::broker::{MessagePublisher, RAW_EXCHANGE, RAW_ROUTING_KEY};
use crate::combine::combine;

/// One-time metrics registration.
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_traffic_records_total",
            "Traffic records read from the source file."
        );
        describe_counter!(
            "ingest_performance_records_total",
            "Performance records read from the source file."
        );
        describe_counter!(
            "ingest_published_total",
            "Unified records published to the broker."
        );
        describe_counter!("ingest_runs_total", "Completed ingestion runs.");
    });
}

/// Source file locations for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestPaths {
    pub traffic: PathBuf,
    pub performance: PathBuf,
}

impl IngestPaths {
    pub fn new(traffic: impl AsRef<Path>, performance: impl AsRef<Path>) -> Self {
        Self {
            traffic: traffic.as_ref().to_path_buf(),
            performance: performance.as_ref().to_path_buf(),
        }
    }
}

/// Run one ingestion pass: read both feeds, join them, publish one message
/// per unified record. Returns the number of messages published.
///
/// All-or-nothing on the read side: either reader failing aborts before any
/// message goes out. A publish failure aborts the remaining loop; messages
/// already sent stay sent (at-least-once downstream).
pub async fn run_once(publisher: &dyn MessagePublisher, paths: &IngestPaths) -> Result<usize> {
    ensure_metrics_described();
    info!("starting data ingestion");

    let traffic = sources::read_traffic(&paths.traffic).await?;
    let perf = sources::read_performance(&paths.performance).await?;

    let combined = combine(&traffic, &perf);
    info!(count = combined.len(), "combined records");

    for record in &combined {
        let body = serde_json::to_vec(record).context("serializing unified record")?;
        publisher
            .publish(RAW_EXCHANGE, RAW_ROUTING_KEY, &body)
            .await
            .with_context(|| format!("publishing record {} {}", record.page, record.date))?;
        counter!("ingest_published_total").increment(1);
    }

    counter!("ingest_runs_total").increment(1);
    info!(published = combined.len(), "data ingestion completed");
    Ok(combined.len())
}
