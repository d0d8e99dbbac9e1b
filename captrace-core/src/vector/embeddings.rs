use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;

use super::{Embeddings, VectorError};

/// OpenAI embeddings backend (`text-embedding-3-small`, 1536 dims by
/// default).
pub struct OpenAiEmbeddings {
    client: Client<OpenAIConfig>,
    model: String,
    dimension: usize,
}

impl std::fmt::Debug for OpenAiEmbeddings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddings")
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl OpenAiEmbeddings {
    pub fn from_env() -> Self {
        Self {
            client: Client::new(),
            model: "text-embedding-3-small".into(),
            dimension: 1536,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.model = model.into();
        self.dimension = dimension;
        self
    }
}

#[async_trait]
impl Embeddings for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, VectorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input(texts.to_vec())
            .build()
            .map_err(|e| VectorError::Fatal(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| VectorError::Transient(e.to_string()))?;
        if response.data.len() != texts.len() {
            return Err(VectorError::Fatal(format!(
                "provider returned {} embeddings for {} inputs",
                response.data.len(),
                texts.len()
            )));
        }
        let mut out = vec![Vec::new(); texts.len()];
        for item in response.data {
            let idx = item.index as usize;
            if idx < out.len() {
                out[idx] = item.embedding;
            }
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
