use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use captrace_model::DocId;

use super::{Chunk, Embeddings, SearchFilters, SearchHit, VectorIndex, VectorError};

/// Vector index on the primary Postgres instance via the pgvector
/// extension. Keeping chunks next to the fact tables means one transactional
/// store to operate, at the cost of sharing its failure domain.
pub struct PgVectorIndex {
    pool: PgPool,
    embeddings: Arc<dyn Embeddings>,
}

impl std::fmt::Debug for PgVectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgVectorIndex")
            .field("pool_size", &self.pool.size())
            .field("dimension", &self.embeddings.dimension())
            .finish()
    }
}

impl PgVectorIndex {
    pub fn new(pool: PgPool, embeddings: Arc<dyn Embeddings>) -> Self {
        Self { pool, embeddings }
    }
}

fn map_sqlx(e: sqlx::Error) -> VectorError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            VectorError::Transient(e.to_string())
        }
        other => VectorError::Fatal(other.to_string()),
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn add_chunks(
        &self,
        doc_id: &DocId,
        chunks: &[Chunk],
    ) -> Result<Vec<String>, VectorError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embeddings.embed(&texts).await?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let mut ids = Vec::with_capacity(chunks.len());
        for (idx, (chunk, vector)) in chunks.iter().zip(vectors).enumerate() {
            let id = Uuid::now_v7();
            sqlx::query(
                r#"
                INSERT INTO pe_document_chunk (id, doc_id, chunk_no, content, metadata, embedding)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(id)
            .bind(doc_id.as_str())
            .bind(idx as i32)
            .bind(&chunk.text)
            .bind(&chunk.metadata)
            .bind(Vector::from(vector))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            ids.push(id.to_string());
        }
        tx.commit().await.map_err(map_sqlx)?;
        debug!(doc_id = %doc_id, chunks = ids.len(), "chunks indexed");
        Ok(ids)
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let embedded = self.embeddings.embed(&[query.to_string()]).await?;
        let Some(vector) = embedded.into_iter().next() else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT id, content, metadata, embedding <=> $1 AS distance
            FROM pe_document_chunk
            WHERE ($2::text IS NULL OR metadata->>'doc_type' = $2)
              AND ($3::text IS NULL OR metadata->>'fund_ref' = $3)
              AND ($4::text IS NULL OR metadata->>'investor_ref' = $4)
            ORDER BY embedding <=> $1
            LIMIT $5
            "#,
        )
        .bind(Vector::from(vector))
        .bind(filters.doc_type.map(|t| t.as_str().to_string()))
        .bind(filters.fund_ref.map(|f| f.to_string()))
        .bind(filters.investor_ref.map(|i| i.to_string()))
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: Uuid = row.get("id");
                let distance: f64 = row.get("distance");
                SearchHit {
                    id: id.to_string(),
                    text: row.get("content"),
                    metadata: row.get("metadata"),
                    // Cosine distance to a similarity-flavored score.
                    score: 1.0 - distance,
                }
            })
            .collect())
    }

    async fn delete(&self, doc_id: &DocId) -> Result<(), VectorError> {
        sqlx::query("DELETE FROM pe_document_chunk WHERE doc_id = $1")
            .bind(doc_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
