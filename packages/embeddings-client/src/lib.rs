//! Embedding providers with env-based switching.
//!
//! The pipeline depends on the [`Embedder`] trait only; which provider backs
//! it is decided once at startup via [`from_env`]:
//!
//! - `EMBEDDINGS_PROVIDER=openai` - OpenAI REST API (requires `OPENAI_API_KEY`)
//! - `EMBEDDINGS_PROVIDER=off` - disabled, returns empty vectors (default)
//!
//! `EMBEDDINGS_MODEL` overrides the provider's default model.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

mod error;
mod openai;
pub mod testing;

pub use error::EmbeddingError;
pub use openai::OpenAiEmbedder;

/// Capability for turning a batch of texts into vectors.
///
/// Implementations must preserve input order and return one vector per input
/// text. Batching against the upstream API is internal to the provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Vector dimension this provider produces. Zero means embeddings are
    /// disabled and `embed` returns empty vectors.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Disabled provider - every text maps to an empty vector.
///
/// Documents are still chunked and persisted, just without embeddings.
pub struct OffEmbedder;

#[async_trait]
impl Embedder for OffEmbedder {
    fn dimension(&self) -> usize {
        0
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(vec![Vec::new(); texts.len()])
    }
}

/// Build the embedding provider selected by `EMBEDDINGS_PROVIDER`.
pub fn from_env() -> Result<Arc<dyn Embedder>, EmbeddingError> {
    let provider = env::var("EMBEDDINGS_PROVIDER").unwrap_or_else(|_| "off".to_string());
    let model = env::var("EMBEDDINGS_MODEL").ok();

    info!(provider = %provider, "creating embedding provider");

    match provider.as_str() {
        "off" => {
            warn!("embeddings are disabled (provider 'off'); chunks are stored without vectors");
            Ok(Arc::new(OffEmbedder))
        }
        "openai" => {
            let api_key = env::var("OPENAI_API_KEY").map_err(|_| EmbeddingError::MissingApiKey)?;
            Ok(Arc::new(OpenAiEmbedder::new(api_key, model)))
        }
        other => Err(EmbeddingError::UnknownProvider(other.to_string())),
    }
}
