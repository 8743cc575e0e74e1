//! Durable Postgres-backed job queue driving a document ETL pipeline
//! (fetch -> parse -> chunk -> embed -> upsert).
//!
//! Guarantees, all enforced through the database row as the single source
//! of truth:
//!
//! - exactly-once dispatch via `FOR UPDATE SKIP LOCKED` claiming
//! - crash recovery via lease expiry and the zombie sweeper
//! - cooperative cancellation observed at driver checkpoints

pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;

pub use config::Config;
pub use error::{FailureKind, FetchError, ParseError, PipelineError, StoreError};
