//! Shared harness for manager-level tests: a memory-backed store and a
//! pipeline wired to fakes, with timings tightened so scenarios settle in
//! milliseconds.

use std::sync::Arc;
use std::time::Duration;

use orchestrator::jobs::testing::MemoryJobStore;
use orchestrator::jobs::{BackoffPolicy, JobManager, JobStatus, JobStore, ManagerConfig};
use orchestrator::pipeline::testing::StaticFetcher;
use orchestrator::pipeline::{ChunkConfig, MemoryDocumentSink, PipelineDriver};
use embeddings_client::testing::FakeEmbedder;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub sink: Arc<MemoryDocumentSink>,
    pub fetcher: Arc<StaticFetcher>,
    pub manager: Arc<JobManager>,
    pub shutdown: CancellationToken,
}

pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval: Duration::from_millis(25),
        max_concurrent_jobs: 5,
        heartbeat_interval: Duration::from_millis(50),
        lease_duration: Duration::from_secs(30),
        zombie_grace: Duration::from_secs(1),
        shutdown_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy {
            base: Duration::from_millis(50),
            factor: 1.0,
            cap: Duration::from_secs(1),
            jitter: 0.0,
        },
    }
}

pub fn harness(fetcher: StaticFetcher, config: ManagerConfig) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let sink = Arc::new(MemoryDocumentSink::new());
    let fetcher = Arc::new(fetcher);

    let driver = Arc::new(PipelineDriver::new(
        fetcher.clone(),
        ChunkConfig::default(),
        Arc::new(FakeEmbedder::default()),
        sink.clone(),
    ));
    let manager = Arc::new(JobManager::with_worker_id(
        store.clone(),
        driver,
        config,
        "test-worker-1",
    ));

    Harness {
        store,
        sink,
        fetcher,
        manager,
        shutdown: CancellationToken::new(),
    }
}

/// Poll until the job reaches `status` or the deadline passes.
pub async fn wait_for_status(
    store: &MemoryJobStore,
    job_id: Uuid,
    status: JobStatus,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(Some(job)) = store.get(job_id).await {
            if job.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
