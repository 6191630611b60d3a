// src/ingest/sources.rs
//! File-backed source readers for the two analytics feeds.
//!
//! Contract: a missing file is a hard `NotFound` error, malformed content is
//! a `Parse` error with no partial results, and an empty JSON array is valid
//! and yields zero records. Field names match case-insensitively.

use std::path::Path;

use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::error::PipelineError;
use crate::model::{from_json_ci, PerformanceRecord, TrafficRecord};

pub async fn read_traffic(path: &Path) -> Result<Vec<TrafficRecord>, PipelineError> {
    let records: Vec<TrafficRecord> = read_records(path).await?;
    counter!("ingest_traffic_records_total").increment(records.len() as u64);
    info!(count = records.len(), path = %path.display(), "read traffic records");
    Ok(records)
}

pub async fn read_performance(path: &Path) -> Result<Vec<PerformanceRecord>, PipelineError> {
    let records: Vec<PerformanceRecord> = read_records(path).await?;
    counter!("ingest_performance_records_total").increment(records.len() as u64);
    info!(count = records.len(), path = %path.display(), "read performance records");
    Ok(records)
}

async fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PipelineError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::NotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(PipelineError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
    };

    from_json_ci(&content).map_err(|e| PipelineError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = read_traffic(Path::new("/nonexistent/ga.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_array_yields_zero_records() {
        let f = write_temp("[]");
        let records = read_traffic(f.path()).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn malformed_content_is_parse_error() {
        let f = write_temp("{ not json");
        let err = read_performance(f.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }

    #[tokio::test]
    async fn field_names_match_case_insensitively() {
        let f = write_temp(
            r#"[{"Date":"2025-10-20","PAGE":"/home","Users":120,"sessions":150,"Views":310}]"#,
        );
        let records = read_traffic(f.path()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].page, "/home");
        assert_eq!(records[0].users, 120);
    }

    #[tokio::test]
    async fn order_is_preserved() {
        let f = write_temp(
            r#"[
                {"date":"2025-10-21","page":"/b","users":1,"sessions":1,"views":1},
                {"date":"2025-10-20","page":"/a","users":2,"sessions":2,"views":2}
            ]"#,
        );
        let records = read_traffic(f.path()).await.unwrap();
        assert_eq!(records[0].page, "/b");
        assert_eq!(records[1].page, "/a");
    }
}
