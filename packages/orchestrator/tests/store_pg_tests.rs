//! Integration tests for the Postgres job store.
//!
//! These run against a real database: set DATABASE_URL and run with
//! `cargo test -- --ignored`. Each test uses throwaway rows keyed by fresh
//! UUIDs, so suites can share a database.

use chrono::{Duration, Utc};
use orchestrator::error::FailureKind;
use orchestrator::jobs::{
    CancelOutcome, FailOutcome, JobKind, JobStatus, JobStore, NewJob, PostgresJobStore,
    RecoverOutcome, LEASE_EXPIRED_ERROR,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");
    pool
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn create_claim_complete_roundtrip() {
    let store = PostgresJobStore::new(pool().await);
    let now = Utc::now();

    let job = store
        .create(NewJob::immediate(
            JobKind::FullEtl,
            json!({"url": "https://example.com"}),
        ))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let claimed = store
        .claim_one("itest-worker", now, Duration::seconds(300))
        .await
        .unwrap()
        .expect("claim returned nothing");
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.worker_id.as_deref(), Some("itest-worker"));
    assert!(claimed.lease_expires_at.is_some());

    assert!(store
        .complete(claimed.id, "itest-worker", json!({"ok": true}), Utc::now())
        .await
        .unwrap());

    let row = store.get(claimed.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    assert!(row.worker_id.is_none());
    assert!(row.lease_expires_at.is_none());
    assert!(row.completed_at.is_some());
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn two_workers_claim_distinct_rows() {
    let store = PostgresJobStore::new(pool().await);
    // High priority so our two rows outrank anything else in the table.
    for _ in 0..2 {
        store
            .create(
                NewJob::builder()
                    .kind(JobKind::Crawl)
                    .input(json!({"url": "x"}))
                    .priority(1000)
                    .build(),
            )
            .await
            .unwrap();
    }

    let now = Utc::now();
    let (a, b) = tokio::join!(
        store.claim_one("itest-a", now, Duration::seconds(300)),
        store.claim_one("itest-b", now, Duration::seconds(300)),
    );
    let a = a.unwrap().expect("worker a claimed nothing");
    let b = b.unwrap().expect("worker b claimed nothing");

    assert_ne!(a.id, b.id, "skip-locked must hand out distinct rows");
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn retryable_failure_then_cancel() {
    let store = PostgresJobStore::new(pool().await);
    let now = Utc::now();

    store
        .create(
            NewJob::builder()
                .kind(JobKind::Embed)
                .input(json!({"texts": ["a"]}))
                .priority(1001)
                .build(),
        )
        .await
        .unwrap();

    let job = store
        .claim_one("itest-worker", now, Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    let outcome = store
        .fail(job.id, Some("itest-worker"), "boom", FailureKind::Retryable, now)
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Retried { retry_count: 1 });

    assert!(store
        .schedule_retry(job.id, now + Duration::seconds(30))
        .await
        .unwrap());

    // A retrying row is cancelable like a pending one.
    assert_eq!(
        store.request_cancel(job.id, Utc::now()).await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(
        store.request_cancel(job.id, Utc::now()).await.unwrap(),
        CancelOutcome::AlreadyTerminal
    );
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn zombie_recovery_under_row_lock() {
    let store = PostgresJobStore::new(pool().await);
    let now = Utc::now();

    store
        .create(
            NewJob::builder()
                .kind(JobKind::Crawl)
                .input(json!({"url": "x"}))
                .priority(1002)
                .build(),
        )
        .await
        .unwrap();
    let job = store
        .claim_one("itest-dead", now - Duration::seconds(600), Duration::seconds(10))
        .await
        .unwrap()
        .unwrap();

    let grace = Duration::seconds(60);
    let zombies = store.list_zombies(now, grace).await.unwrap();
    assert!(zombies.iter().any(|z| z.id == job.id));

    let outcome = store.recover_zombie(job.id, now, grace).await.unwrap();
    assert_eq!(outcome, RecoverOutcome::Retried);

    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Retrying);
    assert_eq!(row.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));

    // Idempotent: the second recovery is a no-op.
    assert_eq!(
        store.recover_zombie(job.id, now, grace).await.unwrap(),
        RecoverOutcome::Skipped
    );
}
