// src/combine.rs
//! Joins the two source feeds into unified records.
//!
//! Deliberately a one-to-one-or-none left join: one output per traffic
//! record, taking the *first* performance record whose (date, page) matches
//! by exact string equality. Not a grouping aggregation.

use crate::model::{PerformanceRecord, TrafficRecord, UnifiedRecord};

/// Output preserves traffic order and cardinality, duplicates included.
pub fn combine(traffic: &[TrafficRecord], perf: &[PerformanceRecord]) -> Vec<UnifiedRecord> {
    traffic
        .iter()
        .map(|t| {
            let matched = perf
                .iter()
                .find(|p| p.date == t.date && p.page == t.page);
            UnifiedRecord {
                page: t.page.clone(),
                date: t.date.clone(),
                users: t.users,
                sessions: t.sessions,
                views: t.views,
                performance_score: matched.map(|p| p.performance_score),
                lcp_ms: matched.map(|p| p.lcp_ms),
            }
        })
        .collect()
}
