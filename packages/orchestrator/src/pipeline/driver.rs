//! Pipeline driver: composes the stages for each job kind and threads
//! cooperative cancellation between them.
//!
//! Checkpoints are the only place cancellation takes effect. Each one reads
//! the caller's probe; when it reports true the driver unwinds with
//! [`PipelineError::Cancelled`]. Partial effects of completed stages are
//! retained - the only persistent side effect is the document upsert, which
//! is atomic.

use std::sync::Arc;

use embeddings_client::Embedder;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::jobs::{Job, JobKind};
use crate::pipeline::chunk::{ChunkConfig, Chunker};
use crate::pipeline::fetch::PageFetcher;
use crate::pipeline::parse::parse;
use crate::pipeline::store::{DocumentMeta, DocumentSink};

/// Texts per embedding call; the driver probes for cancellation between
/// batches so long embed phases stay responsive to cancel.
const EMBED_BATCH: usize = 32;

pub struct PipelineDriver {
    fetcher: Arc<dyn PageFetcher>,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    sink: Arc<dyn DocumentSink>,
}

#[derive(Debug, Deserialize)]
struct FullEtlInput {
    url: String,
    title: Option<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct CrawlInput {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ParseInput {
    content: String,
    #[serde(default = "default_content_type")]
    content_type: String,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Deserialize)]
struct ChunkInput {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedInput {
    texts: Vec<String>,
}

impl PipelineDriver {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        chunk_config: ChunkConfig,
        embedder: Arc<dyn Embedder>,
        sink: Arc<dyn DocumentSink>,
    ) -> Self {
        Self {
            fetcher,
            chunker: Chunker::new(chunk_config),
            embedder,
            sink,
        }
    }

    /// Execute `job`'s kind. `cancel` is polled at every checkpoint.
    pub async fn run(
        &self,
        job: &Job,
        cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Value, PipelineError> {
        debug!(job_id = %job.id, kind = job.kind.as_str(), "driver starting");

        match job.kind {
            JobKind::FullEtl => self.run_full_etl(job, cancel).await,
            JobKind::Crawl => self.run_crawl(job, cancel).await,
            JobKind::Parse => self.run_parse(job, cancel).await,
            JobKind::Chunk => self.run_chunk(job, cancel).await,
            JobKind::Embed => self.run_embed(job, cancel).await,
        }
    }

    async fn run_full_etl(
        &self,
        job: &Job,
        cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Value, PipelineError> {
        let input: FullEtlInput = decode_input(job)?;

        checkpoint(cancel)?;
        let page = self.fetcher.fetch(&input.url).await?;

        checkpoint(cancel)?;
        let text = parse(&page.body, &page.content_type)?;

        checkpoint(cancel)?;
        let chunks = self.chunker.chunk(&text);
        if chunks.is_empty() {
            info!(job_id = %job.id, url = %input.url, "no content to index");
            return Ok(json!({ "document_id": Value::Null, "chunk_count": 0 }));
        }

        checkpoint(cancel)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embed_texts(&texts, cancel).await?;

        checkpoint(cancel)?;
        let meta = DocumentMeta {
            source_url: page.final_url.clone(),
            title: input.title,
            metadata: input.metadata,
        };
        let document_id = self.sink.upsert(&meta, &chunks, &embeddings).await?;

        info!(
            job_id = %job.id,
            document_id = %document_id,
            chunks = chunks.len(),
            "pipeline completed"
        );

        Ok(json!({
            "document_id": document_id,
            "chunk_count": chunks.len(),
        }))
    }

    async fn run_crawl(
        &self,
        job: &Job,
        cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Value, PipelineError> {
        let input: CrawlInput = decode_input(job)?;

        checkpoint(cancel)?;
        let page = self.fetcher.fetch(&input.url).await?;

        Ok(json!({
            "url": input.url,
            "final_url": page.final_url,
            "content_type": page.content_type,
            "size": page.size(),
            "content": String::from_utf8_lossy(&page.body),
        }))
    }

    async fn run_parse(
        &self,
        job: &Job,
        cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Value, PipelineError> {
        let input: ParseInput = decode_input(job)?;

        checkpoint(cancel)?;
        let text = parse(input.content.as_bytes(), &input.content_type)?;

        Ok(json!({ "length": text.len(), "text": text }))
    }

    async fn run_chunk(
        &self,
        job: &Job,
        cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Value, PipelineError> {
        let input: ChunkInput = decode_input(job)?;

        checkpoint(cancel)?;
        let chunks = self.chunker.chunk(&input.text);

        Ok(json!({ "count": chunks.len(), "chunks": chunks }))
    }

    async fn run_embed(
        &self,
        job: &Job,
        cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Value, PipelineError> {
        let input: EmbedInput = decode_input(job)?;

        checkpoint(cancel)?;
        let embeddings = self.embed_texts(&input.texts, cancel).await?;

        Ok(json!({
            "count": embeddings.len(),
            "dimension": self.embedder.dimension(),
            "embeddings": embeddings,
        }))
    }

    async fn embed_texts(
        &self,
        texts: &[String],
        cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH) {
            checkpoint(cancel)?;
            vectors.extend(self.embedder.embed(batch).await?);
        }
        Ok(vectors)
    }
}

fn checkpoint(cancel: &(dyn Fn() -> bool + Send + Sync)) -> Result<(), PipelineError> {
    if cancel() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

fn decode_input<T: for<'de> Deserialize<'de>>(job: &Job) -> Result<T, PipelineError> {
    serde_json::from_value(job.input.clone()).map_err(|e| PipelineError::BadInput(e.to_string()))
}
