//! Job manager: claims work, runs drivers, keeps leases alive, recovers
//! zombies, and shuts down gracefully.
//!
//! Each claimed job gets two cooperating tasks: the driver and a heartbeat.
//! The heartbeat extends the lease and refreshes a cached "cancel
//! requested" flag; the driver polls that flag at its checkpoints. The
//! database row stays authoritative - the in-process flag may lag it by at
//! most one heartbeat interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::jobs::backoff::BackoffPolicy;
use crate::jobs::job::Job;
use crate::jobs::store::{CancelOutcome, FailOutcome, JobStore, RecoverOutcome};
use crate::pipeline::PipelineDriver;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Sleep between empty-queue polls
    pub poll_interval: Duration,
    /// Per-process parallelism
    pub max_concurrent_jobs: usize,
    /// Liveness cadence
    pub heartbeat_interval: Duration,
    /// Lease expiry horizon
    pub lease_duration: Duration,
    /// Safety margin past lease expiry before recovery
    pub zombie_grace: Duration,
    /// Maximum wait for in-flight jobs during stop
    pub shutdown_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent_jobs: 5,
            heartbeat_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(300),
            zombie_grace: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

struct RunningJob {
    token: CancellationToken,
    cancel_flag: Arc<AtomicBool>,
}

pub struct JobManager {
    store: Arc<dyn JobStore>,
    driver: Arc<PipelineDriver>,
    config: ManagerConfig,
    worker_id: String,
    running: Arc<RwLock<HashMap<Uuid, RunningJob>>>,
}

/// Stable per-process worker identity: `host-pid-randomN`.
fn generate_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let pid = std::process::id();
    let suffix: u32 = rand::random();
    format!("{host}-{pid}-{suffix:08x}")
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, driver: Arc<PipelineDriver>, config: ManagerConfig) -> Self {
        Self::with_worker_id(store, driver, config, generate_worker_id())
    }

    pub fn with_worker_id(
        store: Arc<dyn JobStore>,
        driver: Arc<PipelineDriver>,
        config: ManagerConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            driver,
            config,
            worker_id: worker_id.into(),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until `shutdown` fires, then stop gracefully.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.worker_id,
            max_concurrent = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job manager starting"
        );

        // Recover anything a previous process left behind before taking on
        // new work.
        self.sweep().await;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.claim_available().await;
            self.sweep().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Claim jobs until the queue is empty or the concurrency limit is hit.
    async fn claim_available(&self) {
        loop {
            if self.running.read().await.len() >= self.config.max_concurrent_jobs {
                return;
            }

            let claimed = self
                .store
                .claim_one(
                    &self.worker_id,
                    Utc::now(),
                    to_chrono(self.config.lease_duration),
                )
                .await;

            match claimed {
                Ok(Some(job)) => self.spawn_job(job).await,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    return;
                }
            }
        }
    }

    async fn spawn_job(&self, job: Job) {
        let job_id = job.id;
        let token = CancellationToken::new();
        let cancel_flag = Arc::new(AtomicBool::new(false));

        debug!(job_id = %job_id, kind = job.kind.as_str(), "claimed job");

        self.running.write().await.insert(
            job_id,
            RunningJob {
                token: token.clone(),
                cancel_flag: cancel_flag.clone(),
            },
        );

        let store = self.store.clone();
        let driver = self.driver.clone();
        let running = self.running.clone();
        let worker_id = self.worker_id.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            process_job(job, store, driver, &config, worker_id, token, cancel_flag).await;
            running.write().await.remove(&job_id);
        });
    }

    /// Recover running jobs whose lease expired beyond the grace period.
    async fn sweep(&self) {
        let now = Utc::now();
        let grace = to_chrono(self.config.zombie_grace);

        let zombies = match self.store.list_zombies(now, grace).await {
            Ok(zombies) => zombies,
            Err(e) => {
                error!(error = %e, "zombie sweep failed");
                return;
            }
        };

        for job in zombies {
            match self.store.recover_zombie(job.id, now, grace).await {
                Ok(RecoverOutcome::Retried) => {
                    warn!(
                        job_id = %job.id,
                        old_worker = ?job.worker_id,
                        retry_count = job.retry_count + 1,
                        "recovered zombie job for retry"
                    );
                }
                Ok(RecoverOutcome::Failed) => {
                    warn!(
                        job_id = %job.id,
                        old_worker = ?job.worker_id,
                        "zombie job exhausted retries"
                    );
                }
                Ok(RecoverOutcome::Skipped) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "zombie recovery failed"),
            }
        }
    }

    /// Graceful shutdown: signal every in-flight job's cancel probe, wait up
    /// to `shutdown_timeout`, then abandon the rest to lease recovery.
    async fn stop(&self) {
        let in_flight = {
            let running = self.running.read().await;
            for job in running.values() {
                job.cancel_flag.store(true, Ordering::SeqCst);
                job.token.cancel();
            }
            running.len()
        };

        if in_flight > 0 {
            info!(count = in_flight, "waiting for in-flight jobs");
            let start = Instant::now();
            while !self.running.read().await.is_empty()
                && start.elapsed() < self.config.shutdown_timeout
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            let abandoned = self.running.read().await.len();
            if abandoned > 0 {
                warn!(
                    count = abandoned,
                    "abandoning jobs; lease expiry will recover them"
                );
            }
        }

        info!(worker_id = %self.worker_id, "job manager stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_job(
    job: Job,
    store: Arc<dyn JobStore>,
    driver: Arc<PipelineDriver>,
    config: &ManagerConfig,
    worker_id: String,
    token: CancellationToken,
    cancel_flag: Arc<AtomicBool>,
) {
    let job_id = job.id;
    let lease_lost = Arc::new(AtomicBool::new(false));

    let heartbeat = tokio::spawn(heartbeat_loop(
        store.clone(),
        job_id,
        worker_id.clone(),
        config.heartbeat_interval,
        to_chrono(config.lease_duration),
        token.clone(),
        cancel_flag.clone(),
        lease_lost.clone(),
    ));

    let probe = {
        let flag = cancel_flag.clone();
        let token = token.clone();
        move || flag.load(Ordering::SeqCst) || token.is_cancelled()
    };

    let result = driver.run(&job, &probe).await;

    token.cancel();
    let _ = heartbeat.await;

    match result {
        Ok(output) => match store.complete(job_id, &worker_id, output, Utc::now()).await {
            Ok(true) => info!(job_id = %job_id, kind = job.kind.as_str(), "job completed"),
            Ok(false) => debug!(job_id = %job_id, "completion skipped; another owner is authoritative"),
            Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job completed"),
        },
        Err(PipelineError::Cancelled) => {
            if lease_lost.load(Ordering::SeqCst) {
                debug!(job_id = %job_id, "lease lost; abandoning job");
                return;
            }

            // The terminal write may already be done by the requester; this
            // covers locally-initiated stops (shutdown) and is idempotent.
            match store.request_cancel(job_id, Utc::now()).await {
                Ok(CancelOutcome::Cancelled | CancelOutcome::AlreadyTerminal) => {}
                Ok(CancelOutcome::NotFound) => {
                    warn!(job_id = %job_id, "cancelled job vanished from store")
                }
                Err(e) => error!(job_id = %job_id, error = %e, "failed to record cancellation"),
            }
            if let Err(e) = store.release_lease(job_id, &worker_id).await {
                warn!(job_id = %job_id, error = %e, "failed to release lease");
            }
            info!(job_id = %job_id, "job cancelled");
        }
        Err(PipelineError::Store(e)) => {
            // Control-plane failure: write nothing and let the lease expire;
            // the sweeper will recover the row.
            warn!(job_id = %job_id, error = %e, "store unavailable during job; leaving to lease recovery");
        }
        Err(e) => {
            let kind = e.failure_kind();
            warn!(job_id = %job_id, error = %e, retryable = kind.should_retry(), "job failed");

            match store
                .fail(job_id, Some(&worker_id), &e.to_string(), kind, Utc::now())
                .await
            {
                Ok(FailOutcome::Retried { retry_count }) => {
                    let delay = config.backoff.delay(retry_count.max(1) as u32);
                    let run_at = Utc::now() + to_chrono(delay);
                    match store.schedule_retry(job_id, run_at).await {
                        Ok(true) => {
                            info!(job_id = %job_id, retry_count, run_at = %run_at, "job scheduled for retry")
                        }
                        Ok(false) => debug!(job_id = %job_id, "retry scheduling skipped"),
                        Err(e) => error!(job_id = %job_id, error = %e, "failed to schedule retry"),
                    }
                }
                Ok(FailOutcome::Failed) => {
                    warn!(job_id = %job_id, "job failed permanently");
                }
                Ok(FailOutcome::Conflict) => {
                    debug!(job_id = %job_id, "failure write skipped; another owner is authoritative");
                }
                Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job failed"),
            }
        }
    }
}

/// Lease keep-alive paired with each driver.
///
/// A false heartbeat means the row no longer names this worker: the lease
/// is lost, so the driver is cancelled and the job handler exits silently.
#[allow(clippy::too_many_arguments)]
async fn heartbeat_loop(
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    worker_id: String,
    interval: Duration,
    lease: chrono::Duration,
    token: CancellationToken,
    cancel_flag: Arc<AtomicBool>,
    lease_lost: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match store.heartbeat(job_id, &worker_id, Utc::now(), lease).await {
                    Ok(true) => {
                        match store.is_cancel_requested(job_id).await {
                            Ok(true) => {
                                debug!(job_id = %job_id, "cancel requested; flagging driver");
                                cancel_flag.store(true, Ordering::SeqCst);
                            }
                            Ok(false) => {}
                            Err(e) => warn!(job_id = %job_id, error = %e, "cancel check failed"),
                        }
                    }
                    Ok(false) => {
                        warn!(job_id = %job_id, "lease lost; cancelling driver");
                        lease_lost.store(true, Ordering::SeqCst);
                        token.cancel();
                        break;
                    }
                    Err(e) => {
                        // Transient; retry on the next tick. If this keeps
                        // failing the lease expires and the sweeper takes
                        // over.
                        warn!(job_id = %job_id, error = %e, "heartbeat failed; will retry");
                    }
                }
            }
        }
    }
}
