use thiserror::Error;

/// Errors produced by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Transport failure talking to the provider
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider rejected or failed the request
    #[error("embedding provider error (HTTP {status}): {message}")]
    Provider {
        status: u16,
        message: String,
        permanent: bool,
    },

    /// The provider returned fewer vectors than inputs
    #[error("embedding response missing vector for input {index}")]
    MissingVector { index: usize },

    /// Provider selected but its credential is absent
    #[error("OPENAI_API_KEY must be set when EMBEDDINGS_PROVIDER=openai")]
    MissingApiKey,

    /// Unrecognized `EMBEDDINGS_PROVIDER` value
    #[error("unknown embeddings provider: {0}")]
    UnknownProvider(String),
}

impl EmbeddingError {
    /// Whether the error is permanent, i.e. retrying the same request cannot
    /// succeed. Transport errors and 429/5xx responses are transient.
    pub fn is_permanent(&self) -> bool {
        match self {
            EmbeddingError::Http(_) => false,
            EmbeddingError::Provider { permanent, .. } => *permanent,
            EmbeddingError::MissingVector { .. } => true,
            EmbeddingError::MissingApiKey => true,
            EmbeddingError::UnknownProvider(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_respects_permanent_flag() {
        let transient = EmbeddingError::Provider {
            status: 503,
            message: "overloaded".into(),
            permanent: false,
        };
        let permanent = EmbeddingError::Provider {
            status: 400,
            message: "bad model".into(),
            permanent: true,
        };

        assert!(!transient.is_permanent());
        assert!(permanent.is_permanent());
    }

    #[test]
    fn config_errors_are_permanent() {
        assert!(EmbeddingError::MissingApiKey.is_permanent());
        assert!(EmbeddingError::UnknownProvider("foo".into()).is_permanent());
    }
}
