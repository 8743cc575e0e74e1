//! Durable job queue: model, store, manager, and admin surface.
//!
//! The database row is the authoritative state. Claiming uses row-level
//! locks with skip-locked semantics; everything after the claim is guarded
//! compare-and-swap updates keyed on `worker_id`/`status`, so a stale
//! holder can never clobber another worker's progress.

pub mod admin;
pub mod backoff;
mod job;
pub mod manager;
mod store;
pub mod testing;

pub use admin::{Admin, EnqueueOptions};
pub use backoff::BackoffPolicy;
pub use job::{Job, JobKind, JobStatus, NewJob};
pub use manager::{JobManager, ManagerConfig};
pub use store::{
    CancelOutcome, FailOutcome, JobFilter, JobStore, PostgresJobStore, RecoverOutcome,
    LEASE_EXPIRED_ERROR,
};
