//! Vector index capability: chunk storage and semantic retrieval.

use async_trait::async_trait;

use captrace_model::{DocId, DocType, FundId, InvestorId};

mod embeddings;
mod pgvector_index;

pub use embeddings::OpenAiEmbeddings;
pub use pgvector_index::PgVectorIndex;

/// Vector capability failures. `Transient` is retryable by the indexer's
/// backoff sweep.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorError {
    #[error("transient vector index failure: {0}")]
    Transient(String),
    #[error("vector index failure: {0}")]
    Fatal(String),
}

impl VectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VectorError::Transient(_))
    }
}

/// One chunk of text plus its retrieval metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub metadata: serde_json::Value,
}

/// A search result from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub score: f64,
}

/// Metadata filters applied server-side where the backend supports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub doc_type: Option<DocType>,
    pub fund_ref: Option<FundId>,
    pub investor_ref: Option<InvestorId>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store chunks for a document, returning backend ids.
    async fn add_chunks(
        &self,
        doc_id: &DocId,
        chunks: &[Chunk],
    ) -> Result<Vec<String>, VectorError>;

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>, VectorError>;

    /// Drop all chunks of a document (used by force reprocessing).
    async fn delete(&self, doc_id: &DocId) -> Result<(), VectorError>;
}

/// Text embedding capability backing the index.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embeddings: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, VectorError>;

    /// Output dimension, needed for schema checks.
    fn dimension(&self) -> usize;
}
