//! Typed errors for the orchestrator.
//!
//! Library errors use `thiserror`; `anyhow` is reserved for the binary and
//! the manager's top-level loop.

use embeddings_client::EmbeddingError;
use thiserror::Error;

/// Failures of the control plane (job and document storage).
///
/// Guard mismatches (another worker took the row over) are *not* errors -
/// store operations report those through their return values so callers can
/// abandon quietly.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Errors from the fetch stage.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("timeout fetching {url}")]
    Timeout { url: String },

    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("request failed: {0}")]
    Io(#[source] reqwest::Error),
}

/// Errors from the parse stage.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the pipeline driver, translated by the manager into
/// job-status transitions.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed job payload; fatal and non-retryable
    #[error("bad input: {0}")]
    BadInput(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Control-plane failure; the driver aborts without a status write and
    /// lease expiry hands the job to the sweeper
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cooperative cancellation observed at a checkpoint; not a failure
    #[error("cancelled")]
    Cancelled,
}

/// Classification of a failure for the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    NonRetryable,
}

impl FailureKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

impl FetchError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FetchError::Timeout { .. } | FetchError::Io(_) => FailureKind::Retryable,
            FetchError::Status { status, .. } if *status >= 500 || *status == 429 => {
                FailureKind::Retryable
            }
            _ => FailureKind::NonRetryable,
        }
    }
}

impl PipelineError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::BadInput(_) | PipelineError::Parse(_) => FailureKind::NonRetryable,
            PipelineError::Fetch(e) => e.failure_kind(),
            PipelineError::Embedding(e) if e.is_permanent() => FailureKind::NonRetryable,
            PipelineError::Embedding(_) => FailureKind::Retryable,
            PipelineError::Store(_) => FailureKind::Retryable,
            PipelineError::Cancelled => FailureKind::NonRetryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_input_is_not_retryable() {
        let err = PipelineError::BadInput("missing url".into());
        assert_eq!(err.failure_kind(), FailureKind::NonRetryable);
    }

    #[test]
    fn fetch_timeout_is_retryable() {
        let err = PipelineError::Fetch(FetchError::Timeout {
            url: "https://example.com".into(),
        });
        assert!(err.failure_kind().should_retry());
    }

    #[test]
    fn upstream_5xx_retries_4xx_does_not() {
        let server = FetchError::Status {
            status: 503,
            url: "x".into(),
        };
        let client = FetchError::Status {
            status: 404,
            url: "x".into(),
        };

        assert_eq!(server.failure_kind(), FailureKind::Retryable);
        assert_eq!(client.failure_kind(), FailureKind::NonRetryable);
    }

    #[test]
    fn too_large_is_not_retryable() {
        let err = FetchError::TooLarge { limit: 1024 };
        assert_eq!(err.failure_kind(), FailureKind::NonRetryable);
    }

    #[test]
    fn permanent_embedding_errors_do_not_retry() {
        let transient = PipelineError::Embedding(EmbeddingError::Provider {
            status: 503,
            message: "busy".into(),
            permanent: false,
        });
        let permanent = PipelineError::Embedding(EmbeddingError::Provider {
            status: 400,
            message: "bad request".into(),
            permanent: true,
        });

        assert!(transient.failure_kind().should_retry());
        assert!(!permanent.failure_kind().should_retry());
    }
}
