//! In-memory job store for tests.
//!
//! Mirrors the Postgres store's state machine exactly (claim ordering,
//! guarded updates, recovery) so manager and driver behavior can be
//! exercised without a database.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{FailureKind, StoreError};
use crate::jobs::job::{Job, JobStatus, NewJob};
use crate::jobs::store::{
    CancelOutcome, FailOutcome, JobFilter, JobStore, RecoverOutcome, LEASE_EXPIRED_ERROR,
};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed row, bypassing `create`. Used to seed states
    /// (e.g. an expired running job) that normal operation only reaches
    /// through crashes.
    pub fn insert(&self, job: Job) {
        self.lock().insert(job.id, job);
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim ordering: priority DESC, scheduled_at ASC NULLS FIRST,
    /// created_at ASC, id ASC.
    fn claim_order(a: &Job, b: &Job) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| match (a.scheduled_at, b.scheduled_at) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(&y),
            })
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut job = Job::builder()
            .kind(new.kind)
            .input(new.input)
            .priority(new.priority)
            .max_retries(new.max_retries)
            .build();
        job.scheduled_at = new.scheduled_at;

        self.lock().insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.lock();

        let mut eligible: Vec<&Job> = jobs.values().filter(|j| j.is_ready(now)).collect();
        eligible.sort_by(|a, b| Self::claim_order(a, b));
        let Some(id) = eligible.first().map(|j| j.id) else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("job disappeared under lock");
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.heartbeat_at = Some(now);
        job.lease_expires_at = Some(now + lease);
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };

        if job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }

        job.heartbeat_at = Some(now);
        job.lease_expires_at = Some(now + lease);
        job.updated_at = now;
        Ok(true)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        output: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };

        if job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }

        job.status = JobStatus::Completed;
        job.output = Some(output);
        job.completed_at = Some(now);
        job.last_error = None;
        job.worker_id = None;
        job.heartbeat_at = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(FailOutcome::Conflict);
        };

        if job.status != JobStatus::Running {
            return Ok(FailOutcome::Conflict);
        }
        if let Some(expected) = worker_id {
            if job.worker_id.as_deref() != Some(expected) {
                return Ok(FailOutcome::Conflict);
            }
        }

        job.last_error = Some(error.to_string());
        job.worker_id = None;
        job.heartbeat_at = None;
        job.lease_expires_at = None;
        job.updated_at = now;

        if kind.should_retry() && job.can_retry() {
            job.status = JobStatus::Retrying;
            job.retry_count += 1;
            Ok(FailOutcome::Retried {
                retry_count: job.retry_count,
            })
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            Ok(FailOutcome::Failed)
        }
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Retrying {
            return Ok(false);
        }

        job.scheduled_at = Some(run_at);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn request_cancel(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(CancelOutcome::NotFound);
        };

        if job.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        job.status = JobStatus::Cancelled;
        job.worker_id = None;
        job.heartbeat_at = None;
        job.lease_expires_at = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(CancelOutcome::Cancelled)
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .get(&job_id)
            .map(|j| j.status == JobStatus::Cancelled)
            .unwrap_or(false))
    }

    async fn release_lease(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status == JobStatus::Cancelled && job.worker_id.as_deref() == Some(worker_id) {
                job.worker_id = None;
                job.heartbeat_at = None;
                job.lease_expires_at = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn list_zombies(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let cutoff = now - grace;
        let mut zombies: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.lease_expires_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .cloned()
            .collect();
        zombies.sort_by_key(|j| j.lease_expires_at);
        Ok(zombies)
    }

    async fn recover_zombie(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<RecoverOutcome, StoreError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(RecoverOutcome::Skipped);
        };

        let cutoff = now - grace;
        let still_expired = job.lease_expires_at.map(|at| at < cutoff).unwrap_or(false);
        if job.status != JobStatus::Running || !still_expired {
            return Ok(RecoverOutcome::Skipped);
        }

        job.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
        job.worker_id = None;
        job.heartbeat_at = None;
        job.lease_expires_at = None;
        job.updated_at = now;

        if job.can_retry() {
            job.status = JobStatus::Retrying;
            job.retry_count += 1;
            Ok(RecoverOutcome::Retried)
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            Ok(RecoverOutcome::Failed)
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().get(&job_id).cloned())
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| filter.status.map(|s| j.status == s).unwrap_or(true))
            .filter(|j| filter.kind.map(|k| j.kind == k).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(jobs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn retry_failed(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Failed {
            return Ok(false);
        }

        job.status = JobStatus::Pending;
        job.retry_count = 0;
        job.last_error = None;
        job.completed_at = None;
        job.output = None;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.is_terminal() && j.created_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn stats(&self) -> Result<HashMap<JobStatus, i64>, StoreError> {
        let mut counts = HashMap::new();
        for job in self.lock().values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
