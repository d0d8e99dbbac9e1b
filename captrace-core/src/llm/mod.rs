//! LLM capability consumed by classification and field extraction.
//!
//! The pipeline only sees [`LlmClient`]; the provider lives behind it. Error
//! kinds matter more than messages here: `RateLimited` and `Transient` are
//! retryable, `Invalid` is not.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use captrace_model::DocType;

use crate::parse::Table;

mod openai;

pub use openai::OpenAiLlm;

/// LLM failure kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by provider")]
    RateLimited,
    #[error("transient llm failure: {0}")]
    Transient(String),
    #[error("invalid llm response: {0}")]
    Invalid(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited | LlmError::Transient(_))
    }
}

/// Classification answer from the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub doc_type: DocType,
    pub confidence: f64,
}

/// One field the matcher should look for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPrompt {
    pub name: String,
    /// Label aliases shown to the model as extraction hints.
    pub hints: Vec<String>,
}

/// Input to [`LlmClient::extract_fields`]. Callers bound the payload: at
/// most 3 tables and 3000 characters of text reach the provider.
#[derive(Debug, Clone)]
pub struct FieldExtractionRequest {
    pub doc_type: DocType,
    pub fields: Vec<FieldPrompt>,
    pub text_excerpt: String,
    pub tables: Vec<Table>,
    pub filename: String,
}

/// Maximum tables forwarded to the provider.
pub const MAX_PROMPT_TABLES: usize = 3;
/// Maximum characters of running text forwarded to the provider.
pub const MAX_PROMPT_TEXT: usize = 3000;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Classify a document from a text excerpt and its filename.
    async fn classify(
        &self,
        text: &str,
        filename: &str,
    ) -> Result<Classification, LlmError>;

    /// Return a JSON object keyed by field name. Missing fields are simply
    /// absent; values are re-validated by the extraction chain.
    async fn extract_fields(
        &self,
        request: &FieldExtractionRequest,
    ) -> Result<serde_json::Map<String, serde_json::Value>, LlmError>;
}

/// Token bucket: `rate_per_minute` tokens, refilled continuously.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    fn new(rate_per_minute: u32) -> Self {
        let capacity = f64::from(rate_per_minute.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refreshed: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.refreshed).as_secs_f64();
                state.tokens =
                    (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.refreshed = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            debug!(wait = ?wait, "token bucket drained; waiting for refill");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Decorator applying the global concurrency cap and token-bucket rate
/// limit to any [`LlmClient`].
pub struct RateLimitedLlm<C> {
    inner: C,
    semaphore: Arc<Semaphore>,
    bucket: TokenBucket,
}

impl<C: std::fmt::Debug> std::fmt::Debug for RateLimitedLlm<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedLlm")
            .field("inner", &self.inner)
            .field("available_permits", &self.semaphore.available_permits())
            .finish()
    }
}

impl<C: LlmClient> RateLimitedLlm<C> {
    pub fn new(inner: C, concurrency: usize, rate_per_minute: u32) -> Self {
        Self {
            inner,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            bucket: TokenBucket::new(rate_per_minute),
        }
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for RateLimitedLlm<C> {
    async fn classify(
        &self,
        text: &str,
        filename: &str,
    ) -> Result<Classification, LlmError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Transient("limiter closed".into()))?;
        self.bucket.acquire().await;
        self.inner.classify(text, filename).await
    }

    async fn extract_fields(
        &self,
        request: &FieldExtractionRequest,
    ) -> Result<serde_json::Map<String, serde_json::Value>, LlmError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Transient("limiter closed".into()))?;
        self.bucket.acquire().await;
        self.inner.extract_fields(request).await
    }
}

/// Render a table compactly for a prompt.
pub(crate) fn render_table(table: &Table) -> String {
    let mut out = table.headers.join(" | ");
    out.push('\n');
    for row in table.rows.iter().take(30) {
        out.push_str(&row.join(" | "));
        out.push('\n');
    }
    out
}

/// Truncate on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
