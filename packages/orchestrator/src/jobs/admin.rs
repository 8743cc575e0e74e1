//! Admin surface over the job store.
//!
//! Consumed by the REST facade and CLI (both out of tree); everything here
//! is a thin, typed delegation to [`JobStore`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::job::{Job, JobKind, JobStatus, NewJob};
use crate::jobs::store::{CancelOutcome, JobFilter, JobStore};

/// Options for enqueueing a job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueOptions {
    pub kind: JobKind,
    pub input: Value,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Falls back to the configured default when absent
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i32>,
}

impl EnqueueOptions {
    pub fn immediate(kind: JobKind, input: Value) -> Self {
        Self::builder().kind(kind).input(input).build()
    }

    pub fn scheduled(kind: JobKind, input: Value, run_at: DateTime<Utc>) -> Self {
        Self::builder()
            .kind(kind)
            .input(input)
            .scheduled_at(run_at)
            .build()
    }
}

pub struct Admin {
    store: Arc<dyn JobStore>,
    default_max_retries: i32,
}

impl Admin {
    pub fn new(store: Arc<dyn JobStore>, default_max_retries: i32) -> Self {
        Self {
            store,
            default_max_retries,
        }
    }

    pub async fn enqueue(&self, options: EnqueueOptions) -> Result<Uuid, StoreError> {
        let mut new = NewJob::builder()
            .kind(options.kind)
            .input(options.input)
            .priority(options.priority)
            .max_retries(options.max_retries.unwrap_or(self.default_max_retries))
            .build();
        new.scheduled_at = options.scheduled_at;

        let job = self.store.create(new).await?;
        Ok(job.id)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, StoreError> {
        self.store.request_cancel(job_id, Utc::now()).await
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.store.get(job_id).await
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        self.store.list(filter).await
    }

    /// Reset a failed job to pending with a fresh retry budget.
    pub async fn retry(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.store.retry_failed(job_id).await
    }

    /// Delete terminal jobs older than the given number of days.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        self.store.cleanup_old(cutoff).await
    }

    pub async fn stats(&self) -> Result<HashMap<JobStatus, i64>, StoreError> {
        self.store.stats().await
    }
}
