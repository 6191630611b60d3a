// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod broker;
pub mod combine;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod store;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::combine::combine;
pub use crate::error::PipelineError;
pub use crate::model::{DeadLetterEnvelope, RawObservation, UnifiedRecord};
pub use crate::worker::{ConsumerWorker, Disposition, MessageProcessor, RetryPolicy};
