// src/model.rs
// Canonical record types shared by the publisher and the consumer.
// The unified-record wire shape is defined exactly once; both sides of the
// broker serialize/deserialize through it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of the traffic feed (users/sessions/views per page per day).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub date: String,
    pub page: String,
    pub users: i64,
    pub sessions: i64,
    pub views: i64,
}

/// One row of the performance feed (Lighthouse-style score + LCP per page per day).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub date: String,
    pub page: String,
    #[serde(rename = "performanceScore", alias = "performancescore")]
    pub performance_score: f64,
    // Feeds in the wild spell this both "lcpMs" and "LCP_ms".
    #[serde(rename = "lcpMs", alias = "lcpms", alias = "lcp_ms")]
    pub lcp_ms: i64,
}

/// The joined record and the wire message schema.
///
/// `performance_score`/`lcp_ms` are absent (not null) on the wire when no
/// performance record matched the traffic record's (date, page).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub page: String,
    pub date: String,
    pub users: i64,
    pub sessions: i64,
    pub views: i64,
    #[serde(
        rename = "performanceScore",
        alias = "performancescore",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub performance_score: Option<f64>,
    #[serde(
        rename = "lcpMs",
        alias = "lcpms",
        alias = "lcp_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub lcp_ms: Option<i64>,
}

/// Persisted unit: one consumed unified record, date normalized to a UTC
/// calendar day. Many rows may exist per (date, page) across ingestion runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub date: NaiveDate,
    pub page: String,
    pub users: i64,
    pub sessions: i64,
    pub views: i64,
    pub performance_score: Option<f64>,
    pub lcp_ms: Option<i64>,
    pub received_at: DateTime<Utc>,
}

/// Derived roll-up, one row per calendar date. Always the result of a full
/// recompute over the raw observations for that date.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRollup {
    pub date: NaiveDate,
    pub total_users: i64,
    pub total_sessions: i64,
    pub total_views: i64,
    /// Average over observations that carry a score; 0.0 when none do.
    pub avg_performance: f64,
    pub last_updated_at: DateTime<Utc>,
}

/// Written to the dead-letter queue after retries are exhausted. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    #[serde(rename = "originalMessage", alias = "originalmessage")]
    pub original_message: String,
    pub reason: String,
    #[serde(rename = "failedAt", alias = "failedat")]
    pub failed_at: DateTime<Utc>,
    #[serde(rename = "deliveryTag", alias = "deliverytag")]
    pub delivery_tag: u64,
}

/// Deserialize JSON with case-insensitive field names.
///
/// Object keys are lowercased (recursively) before handing the value to
/// serde; the record types above carry lowercase aliases for every field, so
/// any casing of e.g. `performanceScore` is accepted.
pub fn from_json_ci<T: DeserializeOwned>(input: &str) -> serde_json::Result<T> {
    let value: Value = serde_json::from_str(input)?;
    serde_json::from_value(lowercase_keys(value))
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}
