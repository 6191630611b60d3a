// tests/e2e_pipeline.rs
// Feed files -> combiner -> published wire messages -> consumer processing
// -> SQLite roll-up, with only the broker transport mocked out.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use tokio::sync::watch;

use analytics_aggregator::broker::{DeadLetterSink, MessagePublisher};
use analytics_aggregator::ingest::{run_once, IngestPaths};
use analytics_aggregator::model::DeadLetterEnvelope;
use analytics_aggregator::store::SqliteStore;
use analytics_aggregator::worker::{Disposition, MessageProcessor, RetryPolicy};

#[derive(Default)]
struct CapturingBroker {
    published: Mutex<Vec<Vec<u8>>>,
    dead_letters: Mutex<Vec<DeadLetterEnvelope>>,
}

#[async_trait]
impl MessagePublisher for CapturingBroker {
    async fn publish(&self, _exchange: &str, _routing_key: &str, body: &[u8]) -> Result<()> {
        self.published.lock().push(body.to_vec());
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for CapturingBroker {
    async fn send(&self, envelope: &DeadLetterEnvelope) -> Result<()> {
        self.dead_letters.lock().push(envelope.clone());
        Ok(())
    }
}

#[tokio::test]
async fn published_messages_consume_into_a_correct_rollup() {
    let mut traffic = tempfile::NamedTempFile::new().unwrap();
    traffic
        .write_all(
            br#"[
                {"date":"2025-10-20","page":"/home","users":120,"sessions":150,"views":310},
                {"date":"2025-10-20","page":"/pricing","users":45,"sessions":52,"views":97}
            ]"#,
        )
        .unwrap();
    let mut perf = tempfile::NamedTempFile::new().unwrap();
    perf.write_all(
        br#"[{"date":"2025-10-20","page":"/home","performanceScore":0.9,"lcpMs":2100}]"#,
    )
    .unwrap();

    let broker = Arc::new(CapturingBroker::default());
    let paths = IngestPaths::new(traffic.path(), perf.path());
    let published = run_once(broker.as_ref(), &paths).await.unwrap();
    assert_eq!(published, 2);

    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let processor = MessageProcessor::new(
        store.clone(),
        broker.clone(),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
    );
    let (_tx, mut shutdown) = watch::channel(false);

    let bodies: Vec<Vec<u8>> = broker.published.lock().clone();
    for (i, body) in bodies.iter().enumerate() {
        let disposition = processor.handle(body, i as u64 + 1, &mut shutdown).await;
        assert_eq!(disposition, Disposition::Ack);
    }
    assert!(broker.dead_letters.lock().is_empty());

    let date = NaiveDate::from_ymd_opt(2025, 10, 20).unwrap();
    let rollup = store.rollup_for_date(date).await.unwrap().unwrap();
    assert_eq!(rollup.total_users, 165);
    assert_eq!(rollup.total_sessions, 202);
    assert_eq!(rollup.total_views, 407);
    // /pricing carries no score, so the average covers /home alone
    assert!((rollup.avg_performance - 0.9).abs() < 1e-9);
}
