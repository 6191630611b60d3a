// src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy for the ingestion pipeline.
///
/// `NotFound` and `Parse` abort an ingestion run before anything is
/// published. `Connection` is fatal: the worker halts instead of idling.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("malformed source data in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("broker unreachable: {0}")]
    Connection(String),
}
