// src/broker.rs
//! AMQP plumbing: topology declaration, bounded connection retry, and the
//! publisher seams the pipeline is tested through.
//!
//! Topology (declared idempotently by both the publisher and the worker so
//! either can start first):
//!
//! ```text
//! analytics.raw (direct, durable) --analytics.raw--> analytics.raw.q
//!                                                    | x-dead-letter -> analytics.dlq
//! analytics.dlq (direct, durable) --analytics.dlq--> analytics.dlq
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::model::DeadLetterEnvelope;

pub const RAW_EXCHANGE: &str = "analytics.raw";
pub const RAW_QUEUE: &str = "analytics.raw.q";
pub const RAW_ROUTING_KEY: &str = "analytics.raw";
pub const DLQ_EXCHANGE: &str = "analytics.dlq";
pub const DLQ_QUEUE: &str = "analytics.dlq";
pub const DLQ_ROUTING_KEY: &str = "analytics.dlq";

pub const CONNECT_ATTEMPTS: u32 = 10;
pub const CONNECT_SPACING: Duration = Duration::from_secs(2);

/// Outbound message seam. Production uses [`AmqpPublisher`]; tests swap in a
/// recording mock.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;
}

/// Dead-letter seam, kept separate from [`MessagePublisher`] so the worker's
/// retry state machine can be tested without any broker types in sight.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, envelope: &DeadLetterEnvelope) -> Result<()>;
}

/// Connect with a fixed bound and fixed spacing. Exhausting the bound is
/// fatal to the caller; the worker never silently idles without a broker.
pub async fn connect_with_retry(url: &str) -> Result<Connection, PipelineError> {
    let mut last_error = String::new();
    for attempt in 1..=CONNECT_ATTEMPTS {
        match Connection::connect(url, ConnectionProperties::default()).await {
            Ok(conn) => {
                info!(attempt, "connected to broker");
                return Ok(conn);
            }
            Err(e) => {
                warn!(
                    attempt,
                    max = CONNECT_ATTEMPTS,
                    error = %e,
                    "failed to connect to broker"
                );
                last_error = e.to_string();
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_SPACING).await;
                }
            }
        }
    }
    Err(PipelineError::Connection(format!(
        "gave up after {CONNECT_ATTEMPTS} attempts: {last_error}"
    )))
}

/// Declare the full exchange/queue/dead-letter topology. Every declaration
/// is idempotent, so repeated startups are safe.
pub async fn declare_topology(channel: &Channel) -> Result<()> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(RAW_EXCHANGE, ExchangeKind::Direct, durable, FieldTable::default())
        .await
        .context("declaring raw exchange")?;

    channel
        .exchange_declare(DLQ_EXCHANGE, ExchangeKind::Direct, durable, FieldTable::default())
        .await
        .context("declaring dead-letter exchange")?;

    let queue_opts = QueueDeclareOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
        ..Default::default()
    };

    channel
        .queue_declare(DLQ_QUEUE, queue_opts, FieldTable::default())
        .await
        .context("declaring dead-letter queue")?;
    channel
        .queue_bind(
            DLQ_QUEUE,
            DLQ_EXCHANGE,
            DLQ_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("binding dead-letter queue")?;

    // Rejected/expired messages on the primary queue route to the DLQ pair.
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(DLQ_EXCHANGE.into()),
    );
    args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(DLQ_ROUTING_KEY.into()),
    );

    channel
        .queue_declare(RAW_QUEUE, queue_opts, args)
        .await
        .context("declaring raw queue")?;
    channel
        .queue_bind(
            RAW_QUEUE,
            RAW_EXCHANGE,
            RAW_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("binding raw queue")?;

    info!("broker topology declared");
    Ok(())
}

/// Fire-and-forget publisher over an open channel (no confirm wait, no
/// batching).
pub struct AmqpPublisher {
    channel: Channel,
}

impl AmqpPublisher {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl MessagePublisher for AmqpPublisher {
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        // Fire-and-forget: the returned confirm future is intentionally not
        // awaited.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await
            .with_context(|| format!("publishing to {exchange}/{routing_key}"))?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for AmqpPublisher {
    async fn send(&self, envelope: &DeadLetterEnvelope) -> Result<()> {
        let body = serde_json::to_vec(envelope).context("serializing dead-letter envelope")?;
        self.publish(DLQ_EXCHANGE, DLQ_ROUTING_KEY, &body).await
    }
}
