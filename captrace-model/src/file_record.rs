use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Lifecycle state of a discovered file.
///
/// Transitions are strictly forward except `Failed -> Queued` on retry and
/// the cancellation path `Parsing/Extracting -> Queued`, which requeues
/// without consuming an attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Discovered,
    Queued,
    Parsing,
    Extracting,
    Persisted,
    Embedded,
    Failed,
    Skipped,
}

impl FileState {
    /// States that end processing for this content (success or skip).
    /// `Failed` is terminal only once attempts are exhausted, so it is not
    /// listed here.
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Embedded | FileState::Skipped)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, to),
            (Discovered, Queued)
                | (Discovered, Skipped)
                | (Queued, Parsing)
                | (Queued, Skipped)
                | (Parsing, Extracting)
                | (Parsing, Failed)
                | (Parsing, Queued)
                | (Extracting, Persisted)
                | (Extracting, Failed)
                | (Extracting, Queued)
                | (Extracting, Skipped)
                | (Persisted, Embedded)
                | (Persisted, Failed)
                | (Failed, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Discovered => "discovered",
            FileState::Queued => "queued",
            FileState::Parsing => "parsing",
            FileState::Extracting => "extracting",
            FileState::Persisted => "persisted",
            FileState::Embedded => "embedded",
            FileState::Failed => "failed",
            FileState::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected compare-and-swap on a file record's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub expected: FileState,
    pub actual: FileState,
    pub requested: FileState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "state conflict: expected {}, found {} (requested {})",
            self.expected, self.actual, self.requested
        )
    }
}

impl std::error::Error for TransitionError {}

/// One entry in the file ledger.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    /// Full SHA-256 hex digest of the file contents.
    pub content_hash: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    pub state: FileState,
    pub error: Option<String>,
    pub attempts: u32,
}

impl FileRecord {
    pub fn new(
        path: PathBuf,
        content_hash: String,
        size: u64,
        mtime: DateTime<Utc>,
    ) -> Self {
        Self {
            path,
            content_hash,
            size,
            mtime,
            discovered_at: Utc::now(),
            state: FileState::Discovered,
            error: None,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_legal() {
        use FileState::*;
        let path = [Discovered, Queued, Parsing, Extracting, Persisted, Embedded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn no_backwards_jumps() {
        use FileState::*;
        assert!(!Persisted.can_transition_to(Parsing));
        assert!(!Embedded.can_transition_to(Queued));
        assert!(!Skipped.can_transition_to(Queued));
        assert!(!Extracting.can_transition_to(Parsing));
    }

    #[test]
    fn failed_requeues_but_nothing_leaves_skip() {
        use FileState::*;
        assert!(Failed.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Parsing));
        assert!(!Skipped.can_transition_to(Parsing));
    }

    #[test]
    fn cancellation_returns_to_queued() {
        use FileState::*;
        assert!(Parsing.can_transition_to(Queued));
        assert!(Extracting.can_transition_to(Queued));
    }

    #[test]
    fn terminal_states() {
        assert!(FileState::Embedded.is_terminal());
        assert!(FileState::Skipped.is_terminal());
        assert!(!FileState::Failed.is_terminal());
        assert!(!FileState::Persisted.is_terminal());
    }
}
