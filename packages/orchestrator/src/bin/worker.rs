// Worker process entry point.
//
// A worker exposes no network surface: its inputs are the database and
// process signals. SIGINT/SIGTERM initiate graceful shutdown; jobs that do
// not stop within the shutdown timeout are recovered later via lease
// expiry.

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator::jobs::{JobManager, PostgresJobStore};
use orchestrator::pipeline::{HttpFetcher, PipelineDriver, PostgresDocumentStore};
use orchestrator::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    info!("connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    info!("migrations complete");

    let embedder = embeddings_client::from_env().context("failed to build embedding provider")?;
    let fetcher = Arc::new(
        HttpFetcher::new(&config.fetch).map_err(|e| anyhow::anyhow!("fetcher init: {e}"))?,
    );
    let store = Arc::new(PostgresJobStore::new(pool.clone()));
    let sink = Arc::new(PostgresDocumentStore::new(pool.clone()));

    let driver = Arc::new(PipelineDriver::new(
        fetcher,
        config.chunk.clone(),
        embedder,
        sink,
    ));
    let manager = Arc::new(JobManager::new(store, driver, config.manager.clone()));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    manager.run(shutdown).await
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("shutdown signal received");
        shutdown.cancel();
    });
}
