//! Deterministic embedder for tests.

use async_trait::async_trait;

use crate::{Embedder, EmbeddingError};

/// Produces stable, content-derived vectors without any network access.
///
/// Two equal texts always embed to the same vector, so assertions on
/// persisted embeddings are reproducible.
pub struct FakeEmbedder {
    dimension: usize,
}

impl FakeEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for FakeEmbedder {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                let seed: u32 = text.bytes().map(u32::from).sum();
                (0..self.dimension)
                    .map(|i| ((seed.wrapping_add(i as u32)) % 1000) as f32 / 1000.0)
                    .collect()
            })
            .collect())
    }
}
