//! Transactional job store.
//!
//! [`JobStore`] is the seam between the queue's state machine and its
//! persistence. [`PostgresJobStore`] is the production implementation; the
//! in-memory double lives in [`crate::jobs::testing`].
//!
//! Every operation is a single database transaction. Guarded updates
//! (`heartbeat`, `complete`, `fail`, `release_lease`) carry a predicate on
//! `worker_id`/`status` so a stale holder applies no update and learns about
//! it from the return value.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{FailureKind, StoreError};
use crate::jobs::job::{Job, JobKind, JobStatus, NewJob};

/// Error text written by zombie recovery.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// Result of `fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Retries remained; the row is `retrying` with the new count
    Retried { retry_count: i32 },
    /// Out of retries (or non-retryable); the row is `failed`
    Failed,
    /// The row no longer matches (holder changed or not running)
    Conflict,
}

/// Result of `request_cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
    NotFound,
}

/// Result of `recover_zombie`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverOutcome {
    Retried,
    Failed,
    /// Row was no longer a zombie under the lock (already recovered,
    /// completed, or its lease was extended in the meantime)
    Skipped,
}

/// Filters for the admin `list` operation.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            kind: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` row.
    async fn create(&self, new: NewJob) -> Result<Job, StoreError>;

    /// Atomically claim the single best eligible row for `worker_id`.
    ///
    /// Eligible: `pending` or `retrying`, with `scheduled_at` null or
    /// elapsed. Ordering: priority descending, then `scheduled_at` (nulls
    /// first), then `created_at`, then `id`. Rows locked by concurrent
    /// claimants are skipped, which is what makes dispatch exactly-once.
    async fn claim_one(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Extend the lease. Returns false when the row no longer names this
    /// worker as a running holder - the caller has lost the lease.
    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Finalize a run. Returns false on a holder mismatch.
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        output: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record a failure: `retrying` while retries remain and the failure is
    /// retryable, `failed` otherwise. Clears the lease fields either way.
    /// `worker_id` None lets the sweeper drive the transition.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError>;

    /// Write the backoff delay onto a `retrying` row.
    async fn schedule_retry(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Authoritative cancel. Pending, retrying, and running rows all move to
    /// `cancelled` in one transaction, lease fields cleared; a running
    /// holder observes the cancel through its next heartbeat. Terminal rows
    /// are refused.
    async fn request_cancel(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError>;

    /// Whether cancellation has been requested (row is `cancelled`).
    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Clear lease fields without a status change. No-op unless the row
    /// still names this worker.
    async fn release_lease(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Running rows whose lease expired more than `grace` ago.
    async fn list_zombies(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Recover one zombie under a row lock: re-verify it is still running
    /// and still expired beyond `grace`, then retry-or-fail it with
    /// `last_error = "lease expired"`.
    async fn recover_zombie(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<RecoverOutcome, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Admin reset: `failed` back to `pending` with `retry_count = 0`.
    async fn retry_failed(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Delete terminal rows created before `cutoff`.
    async fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Row counts by status.
    async fn stats(&self) -> Result<HashMap<JobStatus, i64>, StoreError>;
}

const JOB_COLUMNS: &str = "id, kind, input, status, priority, scheduled_at, retry_count, \
     max_retries, last_error, worker_id, heartbeat_at, lease_expires_at, \
     created_at, updated_at, completed_at, output";

/// Postgres-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO jobs (id, kind, input, status, priority, scheduled_at, max_retries)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.kind)
            .bind(new.input)
            .bind(new.priority)
            .bind(new.scheduled_at)
            .bind(new.max_retries)
            .fetch_one(&self.pool)
            .await?;

        Ok(job)
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status IN ('pending', 'retrying')
                  AND (scheduled_at IS NULL OR scheduled_at <= $2)
                ORDER BY priority DESC, scheduled_at ASC NULLS FIRST, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                worker_id = $1,
                heartbeat_at = $2,
                lease_expires_at = $3,
                updated_at = $2
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(now + lease)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = $3,
                lease_expires_at = $4,
                updated_at = $3
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .bind(now + lease)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        output: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                output = $3,
                completed_at = $4,
                last_error = NULL,
                worker_id = NULL,
                heartbeat_at = NULL,
                lease_expires_at = NULL,
                updated_at = $4
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(output)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let retryable = kind.should_retry();

        let row = sqlx::query_as::<_, (JobStatus, i32)>(
            r#"
            UPDATE jobs
            SET status = CASE
                    WHEN $4 AND retry_count + 1 <= max_retries THEN 'retrying'::job_status
                    ELSE 'failed'::job_status
                END,
                retry_count = CASE
                    WHEN $4 AND retry_count + 1 <= max_retries THEN retry_count + 1
                    ELSE retry_count
                END,
                completed_at = CASE
                    WHEN $4 AND retry_count + 1 <= max_retries THEN completed_at
                    ELSE $5
                END,
                last_error = $3,
                worker_id = NULL,
                heartbeat_at = NULL,
                lease_expires_at = NULL,
                updated_at = $5
            WHERE id = $1
              AND status = 'running'
              AND ($2::text IS NULL OR worker_id = $2)
            RETURNING status, retry_count
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .bind(retryable)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((JobStatus::Retrying, retry_count)) => FailOutcome::Retried { retry_count },
            Some(_) => FailOutcome::Failed,
            None => FailOutcome::Conflict,
        })
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET scheduled_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'retrying'
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn request_cancel(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                worker_id = NULL,
                heartbeat_at = NULL,
                lease_expires_at = NULL,
                completed_at = $2,
                updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'retrying', 'running')
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(CancelOutcome::Cancelled);
        }

        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(if exists {
            CancelOutcome::AlreadyTerminal
        } else {
            CancelOutcome::NotFound
        })
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let status = sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(matches!(status, Some(JobStatus::Cancelled)))
    }

    async fn release_lease(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET worker_id = NULL, heartbeat_at = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND status = 'cancelled'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_zombies(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'running' AND lease_expires_at < $1
            ORDER BY lease_expires_at ASC
            "#
        );

        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(now - grace)
            .fetch_all(&self.pool)
            .await?;

        Ok(jobs)
    }

    async fn recover_zombie(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<RecoverOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE id = $1 AND status = 'running' AND lease_expires_at < $2
            FOR UPDATE SKIP LOCKED
            "#
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .bind(now - grace)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(job) = job else {
            tx.rollback().await?;
            return Ok(RecoverOutcome::Skipped);
        };

        let outcome = if job.can_retry() {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'retrying',
                    retry_count = retry_count + 1,
                    last_error = $2,
                    worker_id = NULL,
                    heartbeat_at = NULL,
                    lease_expires_at = NULL,
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(LEASE_EXPIRED_ERROR)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            RecoverOutcome::Retried
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    last_error = $2,
                    completed_at = $3,
                    worker_id = NULL,
                    heartbeat_at = NULL,
                    lease_expires_at = NULL,
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(LEASE_EXPIRED_ERROR)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            RecoverOutcome::Failed
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::job_status IS NULL OR status = $1)
              AND ($2::job_kind IS NULL OR kind = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        );

        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(filter.status)
            .bind(filter.kind)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(jobs)
    }

    async fn retry_failed(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                retry_count = 0,
                last_error = NULL,
                completed_at = NULL,
                output = NULL,
                scheduled_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<HashMap<JobStatus, i64>, StoreError> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }
}
