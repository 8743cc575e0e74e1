//! Upsert stage: persist a document and its chunk set atomically.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::chunk::Chunk;

/// How many leading chunks feed the stored content preview.
const PREVIEW_CHUNKS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub source_url: String,
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Destination for processed documents.
///
/// `upsert` is all-or-nothing across the document row and its chunks:
/// either the whole set is persisted or none of it is. Re-upserting the
/// same `source_url` replaces the previous chunk set.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn upsert(
        &self,
        meta: &DocumentMeta,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<Uuid, StoreError>;
}

pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentSink for PostgresDocumentStore {
    async fn upsert(
        &self,
        meta: &DocumentMeta,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<Uuid, StoreError> {
        let preview = chunks
            .iter()
            .take(PREVIEW_CHUNKS)
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let mut tx = self.pool.begin().await?;

        let document_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO documents (id, source_url, title, content_preview, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_url) DO UPDATE SET
                title = EXCLUDED.title,
                content_preview = EXCLUDED.content_preview,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&meta.source_url)
        .bind(&meta.title)
        .bind(&preview)
        .bind(&meta.metadata)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let embedding = embeddings
                .get(chunk.index)
                .filter(|v| !v.is_empty())
                .cloned();

            sqlx::query(
                r#"
                INSERT INTO document_chunks (id, document_id, chunk_index, content, embedding)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(document_id)
            .bind(chunk.index as i32)
            .bind(&chunk.text)
            .bind(embedding)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            document_id = %document_id,
            source_url = %meta.source_url,
            chunks = chunks.len(),
            "upserted document"
        );

        Ok(document_id)
    }
}

/// In-memory sink for tests; records every upsert.
#[derive(Default)]
pub struct MemoryDocumentSink {
    documents: Mutex<HashMap<String, StoredDocument>>,
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: Uuid,
    pub meta: DocumentMeta,
    pub chunks: Vec<Chunk>,
    pub embeddings: Vec<Vec<f32>>,
}

impl MemoryDocumentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<StoredDocument> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredDocument>> {
        self.documents.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentSink for MemoryDocumentSink {
    async fn upsert(
        &self,
        meta: &DocumentMeta,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<Uuid, StoreError> {
        let mut documents = self.lock();
        let id = documents
            .get(&meta.source_url)
            .map(|d| d.id)
            .unwrap_or_else(Uuid::new_v4);

        documents.insert(
            meta.source_url.clone(),
            StoredDocument {
                id,
                meta: meta.clone(),
                chunks: chunks.to_vec(),
                embeddings: embeddings.to_vec(),
            },
        );

        Ok(id)
    }
}
