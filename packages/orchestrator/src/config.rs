//! Application configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use tracing::warn;

use crate::jobs::{BackoffPolicy, ManagerConfig};
use crate::pipeline::{ChunkConfig, FetchConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub manager: ManagerConfig,
    pub fetch: FetchConfig,
    pub chunk: ChunkConfig,
    /// Applied when an enqueue request does not set its own
    pub default_max_retries: i32,
}

impl Config {
    /// Load configuration from the environment (and `.env` in development).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Self::report_defaults();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let manager = ManagerConfig {
            poll_interval: env_secs("JOB_POLL_INTERVAL", 5)?,
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 5usize)?,
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL", 30)?,
            lease_duration: env_secs("LEASE_DURATION", 300)?,
            zombie_grace: env_secs("ZOMBIE_GRACE", 60)?,
            shutdown_timeout: env_secs("SHUTDOWN_TIMEOUT", 30)?,
            backoff: BackoffPolicy {
                base: env_secs("RETRY_BACKOFF_BASE", 2)?,
                cap: env_secs("RETRY_BACKOFF_CAP", 60)?,
                ..Default::default()
            },
        };

        let fetch = FetchConfig {
            timeout: env_secs("FETCH_TIMEOUT", 30)?,
            max_bytes: env_parse("FETCH_MAX_BYTES", 10 * 1024 * 1024usize)?,
        };

        let chunk = ChunkConfig {
            size: env_parse("CHUNK_SIZE", 512usize)?,
            overlap: env_parse("CHUNK_OVERLAP", 50usize)?,
            ..Default::default()
        };

        Ok(Self {
            database_url,
            manager,
            fetch,
            chunk,
            default_max_retries: env_parse("JOB_MAX_RETRIES", 3i32)?,
        })
    }

    /// Log which optional variables are falling back to defaults.
    fn report_defaults() {
        let optional = [
            ("JOB_POLL_INTERVAL", "5"),
            ("MAX_CONCURRENT_JOBS", "5"),
            ("HEARTBEAT_INTERVAL", "30"),
            ("LEASE_DURATION", "300"),
            ("ZOMBIE_GRACE", "60"),
            ("SHUTDOWN_TIMEOUT", "30"),
            ("JOB_MAX_RETRIES", "3"),
            ("EMBEDDINGS_PROVIDER", "off"),
        ];

        let missing: Vec<_> = optional
            .iter()
            .filter(|(var, _)| env::var(var).is_err())
            .collect();

        if !missing.is_empty() {
            for (var, default) in missing {
                warn!(var, default, "environment variable not set, using default");
            }
        }
    }
}

fn env_secs(var: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(var, default)?))
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{var} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
