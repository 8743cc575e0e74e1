//! State-machine properties of the job store: claim ordering, guarded
//! updates, cancellation, and zombie recovery.

use std::sync::Arc;

use chrono::{Duration, Utc};
use orchestrator::error::FailureKind;
use orchestrator::jobs::testing::MemoryJobStore;
use orchestrator::jobs::{
    CancelOutcome, FailOutcome, Job, JobKind, JobStatus, JobStore, NewJob, RecoverOutcome,
    LEASE_EXPIRED_ERROR,
};
use serde_json::json;
use uuid::Uuid;

fn lease() -> Duration {
    Duration::seconds(300)
}

fn grace() -> Duration {
    Duration::seconds(60)
}

async fn enqueue(store: &MemoryJobStore, priority: i32) -> Job {
    store
        .create(
            NewJob::builder()
                .kind(JobKind::FullEtl)
                .input(json!({"url": "https://example.com"}))
                .priority(priority)
                .build(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn claim_marks_running_with_lease_fields() {
    let store = MemoryJobStore::new();
    let job = enqueue(&store, 0).await;
    let now = Utc::now();

    let claimed = store.claim_one("w1", now, lease()).await.unwrap().unwrap();

    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
    assert_eq!(claimed.heartbeat_at, Some(now));
    assert_eq!(claimed.lease_expires_at, Some(now + lease()));
}

#[tokio::test]
async fn higher_priority_claims_first() {
    let store = MemoryJobStore::new();
    let now = Utc::now();

    let low = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({"url": "low"}))
        .priority(1)
        .created_at(now)
        .build();
    let high = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({"url": "high"}))
        .priority(5)
        .created_at(now + Duration::seconds(1))
        .build();
    let high_id = high.id;
    store.insert(low);
    store.insert(high);

    let claimed = store.claim_one("w1", Utc::now(), lease()).await.unwrap().unwrap();

    assert_eq!(claimed.id, high_id, "priority must beat age");
}

#[tokio::test]
async fn within_a_priority_tier_oldest_wins() {
    let store = MemoryJobStore::new();
    let now = Utc::now();

    let older = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({}))
        .created_at(now - Duration::seconds(10))
        .build();
    let newer = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({}))
        .created_at(now)
        .build();
    let older_id = older.id;
    store.insert(newer);
    store.insert(older);

    let claimed = store.claim_one("w1", now, lease()).await.unwrap().unwrap();
    assert_eq!(claimed.id, older_id);
}

#[tokio::test]
async fn future_scheduled_job_is_not_claimed_until_due() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    let run_at = now + Duration::seconds(120);

    let mut new = NewJob::builder()
        .kind(JobKind::Crawl)
        .input(json!({"url": "x"}))
        .build();
    new.scheduled_at = Some(run_at);
    store.create(new).await.unwrap();

    assert!(store.claim_one("w1", now, lease()).await.unwrap().is_none());
    // Eligible exactly at scheduled_at.
    assert!(store.claim_one("w1", run_at, lease()).await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_workers_get_distinct_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    for _ in 0..10 {
        enqueue(&store, 0).await;
    }

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let worker_id = format!("w{worker}");
            let mut claimed = Vec::new();
            while let Some(job) = store
                .claim_one(&worker_id, Utc::now(), Duration::seconds(300))
                .await
                .unwrap()
            {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all: Vec<Uuid> = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    assert_eq!(all.len(), 10, "every job claimed exactly once");
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 10, "no duplicate claims");
}

#[tokio::test]
async fn heartbeat_extends_lease_only_for_the_holder() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();

    let later = now + Duration::seconds(30);
    assert!(store.heartbeat(job.id, "w1", later, lease()).await.unwrap());

    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.heartbeat_at, Some(later));
    assert_eq!(row.lease_expires_at, Some(later + lease()));

    // A stale holder applies nothing.
    assert!(!store.heartbeat(job.id, "w2", later, lease()).await.unwrap());
}

#[tokio::test]
async fn complete_requires_matching_worker() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();

    assert!(!store
        .complete(job.id, "w2", json!({}), now)
        .await
        .unwrap());
    assert!(store
        .complete(job.id, "w1", json!({"ok": true}), now)
        .await
        .unwrap());

    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    assert!(row.completed_at.is_some());
    assert!(row.last_error.is_none());
    assert!(row.worker_id.is_none());
    assert!(row.lease_expires_at.is_none());
    assert!(row.heartbeat_at.is_none());
}

#[tokio::test]
async fn at_most_one_complete_applies() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();

    assert!(store.complete(job.id, "w1", json!({}), now).await.unwrap());
    assert!(!store.complete(job.id, "w1", json!({}), now).await.unwrap());
}

#[tokio::test]
async fn retryable_failure_moves_to_retrying() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();

    let outcome = store
        .fail(job.id, Some("w1"), "boom", FailureKind::Retryable, now)
        .await
        .unwrap();

    assert_eq!(outcome, FailOutcome::Retried { retry_count: 1 });
    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Retrying);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("boom"));
    assert!(row.worker_id.is_none());
    assert!(row.lease_expires_at.is_none());
}

#[tokio::test]
async fn non_retryable_failure_fails_immediately() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();

    let outcome = store
        .fail(job.id, Some("w1"), "bad input", FailureKind::NonRetryable, now)
        .await
        .unwrap();

    assert_eq!(outcome, FailOutcome::Failed);
    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.retry_count, 0);
}

#[tokio::test]
async fn zero_max_retries_fails_on_first_failure() {
    let store = MemoryJobStore::new();
    store
        .create(
            NewJob::builder()
                .kind(JobKind::Crawl)
                .input(json!({"url": "x"}))
                .max_retries(0)
                .build(),
        )
        .await
        .unwrap();
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();

    let outcome = store
        .fail(job.id, Some("w1"), "boom", FailureKind::Retryable, now)
        .await
        .unwrap();

    assert_eq!(outcome, FailOutcome::Failed);
}

#[tokio::test]
async fn retry_count_never_exceeds_max_retries() {
    let store = MemoryJobStore::new();
    store
        .create(
            NewJob::builder()
                .kind(JobKind::Crawl)
                .input(json!({"url": "x"}))
                .max_retries(2)
                .build(),
        )
        .await
        .unwrap();

    let mut failures = Vec::new();
    loop {
        let Some(job) = store.claim_one("w1", Utc::now(), lease()).await.unwrap() else {
            break;
        };
        let outcome = store
            .fail(job.id, Some("w1"), "boom", FailureKind::Retryable, Utc::now())
            .await
            .unwrap();
        failures.push(outcome);
        if matches!(outcome, FailOutcome::Failed) {
            break;
        }
    }

    assert_eq!(
        failures,
        vec![
            FailOutcome::Retried { retry_count: 1 },
            FailOutcome::Retried { retry_count: 2 },
            FailOutcome::Failed,
        ]
    );

    let jobs = store.snapshot();
    assert_eq!(jobs[0].retry_count, 2);
    assert!(jobs[0].retry_count <= jobs[0].max_retries);
}

#[tokio::test]
async fn cancel_pending_job() {
    let store = MemoryJobStore::new();
    let job = enqueue(&store, 0).await;

    let outcome = store.request_cancel(job.id, Utc::now()).await.unwrap();

    assert_eq!(outcome, CancelOutcome::Cancelled);
    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn cancel_retrying_job() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();
    store
        .fail(job.id, Some("w1"), "boom", FailureKind::Retryable, now)
        .await
        .unwrap();

    let outcome = store.request_cancel(job.id, now).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);
}

#[tokio::test]
async fn cancel_running_job_clears_lease_in_same_write() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();

    let outcome = store.request_cancel(job.id, now).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Cancelled);
    assert!(row.worker_id.is_none());
    assert!(row.lease_expires_at.is_none());
    assert!(row.heartbeat_at.is_none());

    // The old holder's heartbeat now fails: it has lost the lease.
    assert!(!store.heartbeat(job.id, "w1", now, lease()).await.unwrap());
    assert!(store.is_cancel_requested(job.id).await.unwrap());
}

#[tokio::test]
async fn cancel_is_idempotent_on_terminal_rows() {
    let store = MemoryJobStore::new();
    let job = enqueue(&store, 0).await;
    let now = Utc::now();

    assert_eq!(
        store.request_cancel(job.id, now).await.unwrap(),
        CancelOutcome::Cancelled
    );
    let first = store.get(job.id).await.unwrap().unwrap();

    assert_eq!(
        store
            .request_cancel(job.id, now + Duration::seconds(5))
            .await
            .unwrap(),
        CancelOutcome::AlreadyTerminal
    );
    let second = store.get(job.id).await.unwrap().unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.completed_at, second.completed_at);
    assert_eq!(first.updated_at, second.updated_at);
}

#[tokio::test]
async fn terminal_states_are_absorbing() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();
    store.complete(job.id, "w1", json!({}), now).await.unwrap();

    assert_eq!(
        store.request_cancel(job.id, now).await.unwrap(),
        CancelOutcome::AlreadyTerminal
    );
    assert_eq!(
        store
            .fail(job.id, Some("w1"), "x", FailureKind::Retryable, now)
            .await
            .unwrap(),
        FailOutcome::Conflict
    );
    assert!(!store.heartbeat(job.id, "w1", now, lease()).await.unwrap());
    assert!(store.claim_one("w1", now, lease()).await.unwrap().is_none());
}

#[tokio::test]
async fn zombie_listing_respects_grace() {
    let store = MemoryJobStore::new();
    let now = Utc::now();

    let fresh = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({}))
        .status(JobStatus::Running)
        .worker_id("w1".to_string())
        .heartbeat_at(now)
        .lease_expires_at(now - Duration::seconds(10))
        .build();
    let stale = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({}))
        .status(JobStatus::Running)
        .worker_id("w2".to_string())
        .heartbeat_at(now)
        .lease_expires_at(now - grace() * 2)
        .build();
    let stale_id = stale.id;
    store.insert(fresh);
    store.insert(stale);

    let zombies = store.list_zombies(now, grace()).await.unwrap();

    assert_eq!(zombies.len(), 1, "inside-grace lease is not a zombie yet");
    assert_eq!(zombies[0].id, stale_id);
}

#[tokio::test]
async fn recover_zombie_retries_with_lease_expired_error() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    let zombie = Job::builder()
        .kind(JobKind::FullEtl)
        .input(json!({"url": "x"}))
        .status(JobStatus::Running)
        .worker_id("dead".to_string())
        .heartbeat_at(now - grace() * 3)
        .lease_expires_at(now - grace() * 2)
        .build();
    let id = zombie.id;
    store.insert(zombie);

    let outcome = store.recover_zombie(id, now, grace()).await.unwrap();

    assert_eq!(outcome, RecoverOutcome::Retried);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Retrying);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
    assert!(row.worker_id.is_none());
    assert!(row.lease_expires_at.is_none());

    // The row is claimable again.
    assert!(store.claim_one("w2", now, lease()).await.unwrap().is_some());
}

#[tokio::test]
async fn recover_zombie_fails_when_out_of_retries() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    let mut zombie = Job::builder()
        .kind(JobKind::FullEtl)
        .input(json!({"url": "x"}))
        .status(JobStatus::Running)
        .worker_id("dead".to_string())
        .heartbeat_at(now - grace() * 3)
        .lease_expires_at(now - grace() * 2)
        .max_retries(1)
        .build();
    zombie.retry_count = 1;
    let id = zombie.id;
    store.insert(zombie);

    let outcome = store.recover_zombie(id, now, grace()).await.unwrap();

    assert_eq!(outcome, RecoverOutcome::Failed);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
}

#[tokio::test]
async fn recover_zombie_is_a_noop_when_already_recovered() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    let zombie = Job::builder()
        .kind(JobKind::FullEtl)
        .input(json!({"url": "x"}))
        .status(JobStatus::Running)
        .worker_id("dead".to_string())
        .heartbeat_at(now - grace() * 3)
        .lease_expires_at(now - grace() * 2)
        .build();
    let id = zombie.id;
    store.insert(zombie);

    assert_eq!(
        store.recover_zombie(id, now, grace()).await.unwrap(),
        RecoverOutcome::Retried
    );
    assert_eq!(
        store.recover_zombie(id, now, grace()).await.unwrap(),
        RecoverOutcome::Skipped
    );

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 1, "second recovery must not re-increment");
}

#[tokio::test]
async fn recover_skips_row_whose_lease_was_extended() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    let job = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({}))
        .status(JobStatus::Running)
        .worker_id("w1".to_string())
        .heartbeat_at(now)
        .lease_expires_at(now + lease())
        .build();
    let id = job.id;
    store.insert(job);

    assert_eq!(
        store.recover_zombie(id, now, grace()).await.unwrap(),
        RecoverOutcome::Skipped
    );
}

#[tokio::test]
async fn retry_failed_resets_the_row() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    let now = Utc::now();
    let job = store.claim_one("w1", now, lease()).await.unwrap().unwrap();
    store
        .fail(job.id, Some("w1"), "x", FailureKind::NonRetryable, now)
        .await
        .unwrap();

    assert!(store.retry_failed(job.id).await.unwrap());

    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Pending);
    assert_eq!(row.retry_count, 0);
    assert!(row.last_error.is_none());
}

#[tokio::test]
async fn cleanup_deletes_only_old_terminal_rows() {
    let store = MemoryJobStore::new();
    let now = Utc::now();

    let old_done = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({}))
        .status(JobStatus::Completed)
        .created_at(now - Duration::days(40))
        .completed_at(now - Duration::days(40))
        .build();
    let old_pending = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({}))
        .created_at(now - Duration::days(40))
        .build();
    let recent_done = Job::builder()
        .kind(JobKind::Crawl)
        .input(json!({}))
        .status(JobStatus::Completed)
        .created_at(now)
        .completed_at(now)
        .build();
    store.insert(old_done);
    store.insert(old_pending);
    store.insert(recent_done);

    let deleted = store.cleanup_old(now - Duration::days(30)).await.unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(store.snapshot().len(), 2);
}

#[tokio::test]
async fn stats_groups_by_status() {
    let store = MemoryJobStore::new();
    enqueue(&store, 0).await;
    enqueue(&store, 0).await;
    let now = Utc::now();
    store.claim_one("w1", now, lease()).await.unwrap();

    let stats = store.stats().await.unwrap();

    assert_eq!(stats.get(&JobStatus::Pending), Some(&1));
    assert_eq!(stats.get(&JobStatus::Running), Some(&1));
}
