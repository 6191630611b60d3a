// src/worker.rs
//! Consumer worker: a single manual-ack delivery loop with an in-process
//! retry ladder and best-effort dead-lettering.
//!
//! Backoff between retries blocks this loop on purpose (prefetch 1,
//! head-of-line): a poison message throttles the queue rather than being
//! processed out of order. Acknowledgment always happens after the delivery's
//! processing has resolved, one way or the other.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{self, AmqpPublisher, DeadLetterSink, RAW_QUEUE};
use crate::model::{from_json_ci, DeadLetterEnvelope, RawObservation, UnifiedRecord};
use crate::store::ObservationStore;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("consumer_ack_total", "Deliveries processed and acknowledged.");
        describe_counter!("consumer_retry_total", "Per-attempt processing failures.");
        describe_counter!(
            "consumer_dead_letter_total",
            "Deliveries routed to the dead-letter queue."
        );
    });
}

/// In-process retry knobs. Production default is 3 attempts with a 1 s base,
/// which yields 2 s / 4 s sleeps between attempts. Tests shrink the base.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^attempt`.
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// What the delivery loop should do with a delivery once processing has
/// resolved. Dead-lettered messages resolve to `Ack`; the failure lives on in
/// the dead-letter queue instead of being redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

/// Parse a wire date: plain `YYYY-MM-DD`, RFC 3339 (offset converted to
/// UTC), or a naive datetime treated as already UTC.
pub fn parse_wire_date(s: &str) -> Result<NaiveDate, String> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.date());
    }
    Err(format!("invalid date format: {s}"))
}

/// Per-message state machine, separated from the AMQP plumbing so the
/// retry/dead-letter behavior is testable with mock seams.
pub struct MessageProcessor {
    store: Arc<dyn ObservationStore>,
    dlq: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn ObservationStore>,
        dlq: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
    ) -> Self {
        ensure_metrics_described();
        Self { store, dlq, retry }
    }

    /// Resolve one delivery to an acknowledgment decision. Processing errors
    /// never propagate out of here.
    ///
    /// Structurally invalid payloads and unparsable dates are permanent
    /// failures: retrying cannot succeed, so they go straight to the
    /// dead-letter path. Storage failures retry with exponential backoff,
    /// then dead-letter. Shutdown during a backoff sleep abandons the
    /// remaining retries and requeues the delivery for the next worker run.
    pub async fn handle(
        &self,
        body: &[u8],
        delivery_tag: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disposition {
        let text = String::from_utf8_lossy(body).into_owned();

        let record: UnifiedRecord = match from_json_ci(&text) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "failed to deserialize message");
                return self
                    .dead_letter(&text, &format!("malformed message: {e}"), delivery_tag)
                    .await;
            }
        };

        let date = match parse_wire_date(&record.date) {
            Ok(date) => date,
            Err(reason) => {
                warn!(date = %record.date, "invalid date in message");
                return self.dead_letter(&text, &reason, delivery_tag).await;
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.persist_and_aggregate(&record, date).await {
                Ok(()) => {
                    counter!("consumer_ack_total").increment(1);
                    return Disposition::Ack;
                }
                Err(e) => {
                    counter!("consumer_retry_total").increment(1);
                    warn!(
                        attempt,
                        max = self.retry.max_attempts,
                        error = %e,
                        "error processing message"
                    );

                    if attempt >= self.retry.max_attempts {
                        return self.dead_letter(&text, &e.to_string(), delivery_tag).await;
                    }

                    let delay = self.retry.delay_for(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            info!("shutdown during backoff, requeueing delivery");
                            return Disposition::Requeue;
                        }
                    }
                }
            }
        }
    }

    /// Steps 4-5 of the processing contract, re-run from scratch on every
    /// attempt: persist the observation, then recompute its date's roll-up.
    async fn persist_and_aggregate(&self, record: &UnifiedRecord, date: NaiveDate) -> Result<()> {
        let observation = RawObservation {
            date,
            page: record.page.clone(),
            users: record.users,
            sessions: record.sessions,
            views: record.views,
            performance_score: record.performance_score,
            lcp_ms: record.lcp_ms,
            received_at: Utc::now(),
        };
        self.store.insert_observation(&observation).await?;
        self.store.recompute_rollup(date).await?;
        Ok(())
    }

    /// Best-effort dead-lettering: a failed publish is logged and swallowed,
    /// and the original delivery is still acknowledged.
    async fn dead_letter(&self, original: &str, reason: &str, delivery_tag: u64) -> Disposition {
        let envelope = DeadLetterEnvelope {
            original_message: original.to_string(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
            delivery_tag,
        };
        match self.dlq.send(&envelope).await {
            Ok(()) => warn!(reason, delivery_tag, "message sent to dead-letter queue"),
            Err(e) => error!(error = %e, "failed to publish dead-letter envelope"),
        }
        counter!("consumer_dead_letter_total").increment(1);
        Disposition::Ack
    }
}

/// The long-running consumer process: bounded connect, topology declaration,
/// then the delivery loop until shutdown.
pub struct ConsumerWorker {
    amqp_url: String,
    store: Arc<dyn ObservationStore>,
    retry: RetryPolicy,
}

impl ConsumerWorker {
    pub fn new(amqp_url: impl Into<String>, store: Arc<dyn ObservationStore>) -> Self {
        Self {
            amqp_url: amqp_url.into(),
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Run until `shutdown` flips or the broker goes away. Connection
    /// failures at startup are fatal after the bounded retry; they surface
    /// here rather than leaving the worker idling.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let conn = broker::connect_with_retry(&self.amqp_url).await?;
        let channel = conn.create_channel().await.context("creating channel")?;
        broker::declare_topology(&channel).await?;

        // One unacked delivery at a time; ack ordering follows processing.
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("setting prefetch")?;

        let mut consumer = channel
            .basic_consume(
                RAW_QUEUE,
                "analytics-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("starting consumer")?;

        let processor = MessageProcessor::new(
            self.store.clone(),
            Arc::new(AmqpPublisher::new(channel.clone())),
            self.retry,
        );

        info!("consumer started, waiting for messages");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => return Err(anyhow!(e).context("consumer stream error")),
                    None => {
                        warn!("consumer stream closed by broker");
                        break;
                    }
                },
            };

            let tag = delivery.delivery_tag;
            match processor.handle(&delivery.data, tag, &mut shutdown).await {
                Disposition::Ack => delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .context("acknowledging delivery")?,
                Disposition::Requeue => delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                    .context("requeueing delivery")?,
            }
        }

        info!("consumer shutting down");
        conn.close(200, "shutdown").await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn plain_date_parses() {
        assert_eq!(
            parse_wire_date("2025-10-20").unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 20).unwrap()
        );
    }

    #[test]
    fn offset_datetime_converts_to_utc_day() {
        // 23:30 at -03:00 is 02:30 UTC the next day.
        assert_eq!(
            parse_wire_date("2025-10-20T23:30:00-03:00").unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 21).unwrap()
        );
    }

    #[test]
    fn naive_datetime_is_treated_as_utc() {
        assert_eq!(
            parse_wire_date("2025-10-20T23:30:00").unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 20).unwrap()
        );
    }

    #[test]
    fn garbage_dates_are_rejected() {
        assert!(parse_wire_date("next tuesday").is_err());
        assert!(parse_wire_date("20-10-2025").is_err());
        assert!(parse_wire_date("").is_err());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }
}
