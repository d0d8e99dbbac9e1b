use std::time::Duration;

use captrace_model::TransitionError;

use crate::llm::LlmError;

/// Error taxonomy driving retry/terminal decisions. Kinds, not types: every
/// concrete error maps onto exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// I/O, network, LLM transient, database deadlock. Retried with backoff.
    Transient,
    /// Decoding failure after all fallbacks. Terminal.
    EncodingIssue,
    /// Malformed file. Terminal.
    ParseError,
    /// Best classification confidence below the configured floor. Not a
    /// failure: the document persists as `other` with a medium audit entry.
    ClassificationLow,
    /// Required fields missing. Not a failure: partial persistence.
    ExtractionIncomplete,
    /// Identity/tolerance violations. Not a failure: persisted as
    /// inconsistent.
    ValidationInconsistent,
    /// Duplicate doc_id at write time. Ledger goes to Skipped.
    PersistenceConflict,
    /// Programming/invariant violations. Terminal.
    Fatal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::EncodingIssue => "encoding_issue",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::ClassificationLow => "classification_low",
            ErrorKind::ExtractionIncomplete => "extraction_incomplete",
            ErrorKind::ValidationInconsistent => "validation_inconsistent",
            ErrorKind::PersistenceConflict => "persistence_conflict",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Errors raised by pipeline components.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("parse error ({path}): {message}")]
    Parse { path: String, message: String },

    #[error("encoding issue ({path}): {message}")]
    Encoding { path: String, message: String },

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("duplicate document {doc_id}")]
    DuplicateDocument { doc_id: String },

    #[error("ledger conflict: {0}")]
    Ledger(#[from] TransitionError),

    #[error("stage deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("shutdown requested")]
    Cancelled,

    #[error("invariant violated: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn encoding(path: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Encoding {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Map the concrete error onto its taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Io(_) => ErrorKind::Transient,
            PipelineError::Database(err) => database_kind(err),
            PipelineError::Parse { .. } => ErrorKind::ParseError,
            PipelineError::Encoding { .. } => ErrorKind::EncodingIssue,
            PipelineError::Llm(err) => match err {
                LlmError::RateLimited | LlmError::Transient(_) => ErrorKind::Transient,
                LlmError::Invalid(_) => ErrorKind::Fatal,
            },
            PipelineError::DuplicateDocument { .. } => ErrorKind::PersistenceConflict,
            PipelineError::Ledger(_) => ErrorKind::Fatal,
            PipelineError::DeadlineExceeded(_) => ErrorKind::Transient,
            PipelineError::Cancelled => ErrorKind::Transient,
            PipelineError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

fn database_kind(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Database(db) => {
            // 23505 = unique_violation, 40P01 = deadlock_detected.
            match db.code().as_deref() {
                Some("23505") => ErrorKind::PersistenceConflict,
                Some("40P01") | Some("40001") => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Base delay for transient retries.
const RETRY_BASE: Duration = Duration::from_millis(250);
/// Upper bound on any single retry delay.
const RETRY_CAP: Duration = Duration::from_secs(60);

/// Exponential backoff with full jitter: `250ms * 2^attempt`, jittered,
/// capped at 60s.
pub fn retry_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let exp = RETRY_BASE.saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
    let capped = exp.min(RETRY_CAP);
    let jitter: f64 = rand::rng().random_range(0.5..1.0);
    capped.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let early = retry_delay(0);
        assert!(early <= Duration::from_millis(250));
        let late = retry_delay(20);
        assert!(late <= Duration::from_secs(60));
        assert!(late >= Duration::from_secs(30));
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::ParseError.is_retryable());
        assert!(!ErrorKind::EncodingIssue.is_retryable());
        assert!(!ErrorKind::PersistenceConflict.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
    }

    #[test]
    fn llm_errors_map_by_kind() {
        assert_eq!(
            PipelineError::Llm(LlmError::RateLimited).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            PipelineError::Llm(LlmError::Invalid("bad json".into())).kind(),
            ErrorKind::Fatal
        );
    }
}
