//! Job model for the durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// A failure with retries remaining; re-selected as pending by the claim
    /// query. Distinct from `Pending` for observability only.
    Retrying,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing: no operation transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Selects the pipeline shape the driver runs for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// fetch -> parse -> chunk -> embed -> upsert
    FullEtl,
    Crawl,
    Parse,
    Chunk,
    Embed,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FullEtl => "full_etl",
            JobKind::Crawl => "crawl",
            JobKind::Parse => "parse",
            JobKind::Chunk => "chunk",
            JobKind::Embed => "embed",
        }
    }
}

/// A row in the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub kind: JobKind,

    /// Opaque structured payload; contract defined per kind
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub input: serde_json::Value,

    #[builder(default)]
    pub status: JobStatus,

    /// Higher runs first
    #[builder(default = 0)]
    pub priority: i32,

    /// Earliest-execution time; eligible when <= now
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    // Lease fields; set only while running
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    /// Result map, set on completion
    #[builder(default, setter(strip_option))]
    pub output: Option<serde_json::Value>,
}

impl Job {
    /// Whether the claim query would consider this row at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if !matches!(self.status, JobStatus::Pending | JobStatus::Retrying) {
            return false;
        }
        match self.scheduled_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count + 1 <= self.max_retries
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Parameters for a new `pending` row.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub kind: JobKind,
    pub input: serde_json::Value,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default = 3)]
    pub max_retries: i32,
}

impl NewJob {
    pub fn immediate(kind: JobKind, input: serde_json::Value) -> Self {
        Self::builder().kind(kind).input(input).build()
    }
}
