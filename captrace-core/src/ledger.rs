use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use captrace_model::{FileRecord, FileState, TransitionError};

use crate::error::{PipelineError, Result};
use crate::fs::FileSystem;

/// Cached hash for a `(path, mtime, size)` tuple so registering the same
/// unchanged file never re-reads it.
#[derive(Debug, Clone, PartialEq)]
struct Fingerprint {
    mtime: DateTime<Utc>,
    size: u64,
    content_hash: String,
}

/// Outcome of [`FileLedger::register`].
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub record: FileRecord,
    /// False when another register already created the record (the caller
    /// lost the race or the content was seen before).
    pub created: bool,
}

/// Content-hash + path registry; the single source of truth for file state.
///
/// All state changes go through the compare-and-swap [`transition`] API,
/// which also serializes pipeline stages for a given document: a stage only
/// proceeds if its expected `from` state still holds.
///
/// [`transition`]: FileLedger::transition
pub struct FileLedger {
    fs: Arc<dyn FileSystem>,
    records: DashMap<String, FileRecord>,
    by_path: DashMap<PathBuf, Fingerprint>,
    max_attempts: u32,
}

impl std::fmt::Debug for FileLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLedger")
            .field("records", &self.records.len())
            .field("cached_paths", &self.by_path.len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl FileLedger {
    pub fn new(fs: Arc<dyn FileSystem>, max_attempts: u32) -> Self {
        Self {
            fs,
            records: DashMap::new(),
            by_path: DashMap::new(),
            max_attempts,
        }
    }

    /// Compute (or reuse) the content hash for `path` and insert a record in
    /// `Discovered` state, or return the existing record for that content.
    pub async fn register(&self, path: &Path) -> Result<RegisterOutcome> {
        let md = self
            .fs
            .metadata(path)
            .await
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        if !md.is_file {
            return Err(PipelineError::Fatal(format!(
                "register called on non-file {}",
                path.display()
            )));
        }
        let mtime: DateTime<Utc> = md
            .modified
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        let content_hash = self.hash_cached(path, mtime, md.len).await?;

        // Entry API makes exactly one concurrent register the creator;
        // losers observe the record that won.
        let mut created = false;
        let record = self
            .records
            .entry(content_hash.clone())
            .or_insert_with(|| {
                created = true;
                FileRecord::new(path.to_path_buf(), content_hash.clone(), md.len, mtime)
            })
            .clone();

        if created {
            debug!(path = %path.display(), hash = %short(&content_hash), "registered new file");
        }
        Ok(RegisterOutcome { record, created })
    }

    async fn hash_cached(
        &self,
        path: &Path,
        mtime: DateTime<Utc>,
        size: u64,
    ) -> Result<String> {
        if let Some(cached) = self.by_path.get(path) {
            if cached.mtime == mtime && cached.size == size {
                return Ok(cached.content_hash.clone());
            }
        }
        let content_hash = self
            .fs
            .sha256(path)
            .await
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        self.by_path.insert(
            path.to_path_buf(),
            Fingerprint {
                mtime,
                size,
                content_hash: content_hash.clone(),
            },
        );
        Ok(content_hash)
    }

    /// Atomic compare-and-swap on state. The transition must both match the
    /// caller's expectation and be legal in the state machine.
    pub fn transition(
        &self,
        hash: &str,
        from: FileState,
        to: FileState,
        error: Option<String>,
    ) -> std::result::Result<FileRecord, TransitionError> {
        let mut entry = self.records.get_mut(hash).ok_or(TransitionError {
            expected: from,
            actual: FileState::Discovered,
            requested: to,
        })?;
        if entry.state != from {
            return Err(TransitionError {
                expected: from,
                actual: entry.state,
                requested: to,
            });
        }
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                expected: from,
                actual: entry.state,
                requested: to,
            });
        }
        entry.state = to;
        if to == FileState::Failed {
            entry.attempts += 1;
            entry.error = error;
        } else if to != FileState::Queued {
            // Keep the last error around on requeue for operator context.
            entry.error = error.or_else(|| entry.error.take());
        }
        Ok(entry.clone())
    }

    /// Automatic retry: Failed → Queued while attempts remain. Returns
    /// `None` once the attempt budget is exhausted.
    pub fn retry(&self, hash: &str) -> Option<FileRecord> {
        let mut entry = self.records.get_mut(hash)?;
        if entry.state != FileState::Failed {
            return None;
        }
        if entry.attempts >= self.max_attempts {
            warn!(
                hash = %short(hash),
                attempts = entry.attempts,
                "attempt budget exhausted; waiting for operator reset"
            );
            return None;
        }
        entry.state = FileState::Queued;
        Some(entry.clone())
    }

    /// Operator reset: Failed → Queued regardless of the attempt count,
    /// clearing it.
    pub fn reset(&self, hash: &str) -> std::result::Result<FileRecord, TransitionError> {
        let mut entry = self.records.get_mut(hash).ok_or(TransitionError {
            expected: FileState::Failed,
            actual: FileState::Discovered,
            requested: FileState::Queued,
        })?;
        if entry.state != FileState::Failed {
            return Err(TransitionError {
                expected: FileState::Failed,
                actual: entry.state,
                requested: FileState::Queued,
            });
        }
        entry.state = FileState::Queued;
        entry.attempts = 0;
        entry.error = None;
        Ok(entry.clone())
    }

    pub fn get(&self, hash: &str) -> Option<FileRecord> {
        self.records.get(hash).map(|r| r.clone())
    }

    /// Look up the record for a path without hashing, using the cached
    /// fingerprint. Only a hit whose `(mtime, size)` still matches counts;
    /// a changed file must be re-hashed through [`register`].
    ///
    /// [`register`]: FileLedger::register
    pub fn find_by_fingerprint(
        &self,
        path: &Path,
        mtime: DateTime<Utc>,
        size: u64,
    ) -> Option<FileRecord> {
        let cached = self.by_path.get(path)?;
        if cached.mtime != mtime || cached.size != size {
            return None;
        }
        self.get(&cached.content_hash)
    }

    pub fn stats_by_state(&self) -> BTreeMap<FileState, u64> {
        let mut out = BTreeMap::new();
        for entry in self.records.iter() {
            *out.entry(entry.state).or_insert(0) += 1;
        }
        out
    }

    /// Records currently in `Failed` state, for operator inspection.
    pub fn failed_records(&self) -> Vec<FileRecord> {
        self.records
            .iter()
            .filter(|r| r.state == FileState::Failed)
            .map(|r| r.clone())
            .collect()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    fn ledger_with(files: &[(&str, &[u8])]) -> (FileLedger, Arc<MemoryFs>) {
        let fs = Arc::new(MemoryFs::new());
        for (path, data) in files {
            fs.add_file(*path, data.to_vec());
        }
        (FileLedger::new(fs.clone(), 3), fs)
    }

    #[tokio::test]
    async fn register_is_idempotent_for_same_content() {
        let (ledger, _fs) = ledger_with(&[("/r/a.pdf", b"same bytes")]);
        let first = ledger.register(Path::new("/r/a.pdf")).await.unwrap();
        assert!(first.created);
        let second = ledger.register(Path::new("/r/a.pdf")).await.unwrap();
        assert!(!second.created);
        assert_eq!(first.record.content_hash, second.record.content_hash);
    }

    #[tokio::test]
    async fn identical_content_under_two_paths_shares_a_record() {
        let (ledger, _fs) = ledger_with(&[
            ("/r/a.pdf", b"same bytes"),
            ("/r/copy_of_a.pdf", b"same bytes"),
        ]);
        let a = ledger.register(Path::new("/r/a.pdf")).await.unwrap();
        let b = ledger.register(Path::new("/r/copy_of_a.pdf")).await.unwrap();
        assert!(a.created);
        assert!(!b.created);
        assert_eq!(a.record.content_hash, b.record.content_hash);
        // The record keeps the first observed path.
        assert_eq!(b.record.path, PathBuf::from("/r/a.pdf"));
    }

    #[tokio::test]
    async fn concurrent_registers_agree_on_one_creator() {
        let fs = Arc::new(MemoryFs::new());
        fs.add_file("/r/x.csv", b"content".to_vec());
        fs.add_file("/r/y.csv", b"content".to_vec());
        let ledger = Arc::new(FileLedger::new(fs, 3));

        let l1 = ledger.clone();
        let l2 = ledger.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { l1.register(Path::new("/r/x.csv")).await.unwrap() }),
            tokio::spawn(async move { l2.register(Path::new("/r/y.csv")).await.unwrap() }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.record.content_hash, b.record.content_hash);
        assert_eq!(
            usize::from(a.created) + usize::from(b.created),
            1,
            "exactly one register creates the record"
        );
    }

    #[tokio::test]
    async fn cas_rejects_stale_expectations() {
        let (ledger, _fs) = ledger_with(&[("/r/a.pdf", b"x")]);
        let rec = ledger.register(Path::new("/r/a.pdf")).await.unwrap().record;
        let hash = rec.content_hash;

        ledger
            .transition(&hash, FileState::Discovered, FileState::Queued, None)
            .unwrap();
        let err = ledger
            .transition(&hash, FileState::Discovered, FileState::Queued, None)
            .unwrap_err();
        assert_eq!(err.actual, FileState::Queued);
    }

    #[tokio::test]
    async fn retry_bumps_attempts_until_budget_is_spent() {
        let (ledger, _fs) = ledger_with(&[("/r/a.pdf", b"x")]);
        let hash = ledger
            .register(Path::new("/r/a.pdf"))
            .await
            .unwrap()
            .record
            .content_hash;
        ledger
            .transition(&hash, FileState::Discovered, FileState::Queued, None)
            .unwrap();

        for attempt in 1..=3u32 {
            ledger
                .transition(&hash, FileState::Queued, FileState::Parsing, None)
                .unwrap();
            let failed = ledger
                .transition(
                    &hash,
                    FileState::Parsing,
                    FileState::Failed,
                    Some("boom".into()),
                )
                .unwrap();
            assert_eq!(failed.attempts, attempt);
            if attempt < 3 {
                assert!(ledger.retry(&hash).is_some());
            }
        }
        // Budget exhausted: automatic retry refuses, operator reset works.
        assert!(ledger.retry(&hash).is_none());
        let reset = ledger.reset(&hash).unwrap();
        assert_eq!(reset.attempts, 0);
        assert_eq!(reset.state, FileState::Queued);
    }

    #[tokio::test]
    async fn fingerprint_lookup_only_hits_unchanged_files() {
        let (ledger, fs) = ledger_with(&[("/r/a.pdf", b"v1")]);
        let rec = ledger.register(Path::new("/r/a.pdf")).await.unwrap().record;
        let hit = ledger.find_by_fingerprint(Path::new("/r/a.pdf"), rec.mtime, rec.size);
        assert!(hit.is_some());

        // Touch the file: the stale fingerprint must not match.
        fs.touch("/r/a.pdf", b"v2 longer".to_vec());
        let md = fs.metadata(Path::new("/r/a.pdf")).await.unwrap();
        let miss = ledger.find_by_fingerprint(
            Path::new("/r/a.pdf"),
            DateTime::<Utc>::from(md.modified.unwrap()),
            md.len,
        );
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn stats_count_states() {
        let (ledger, _fs) = ledger_with(&[("/r/a.pdf", b"a"), ("/r/b.pdf", b"b")]);
        let a = ledger.register(Path::new("/r/a.pdf")).await.unwrap().record;
        ledger.register(Path::new("/r/b.pdf")).await.unwrap();
        ledger
            .transition(&a.content_hash, FileState::Discovered, FileState::Queued, None)
            .unwrap();
        let stats = ledger.stats_by_state();
        assert_eq!(stats[&FileState::Discovered], 1);
        assert_eq!(stats[&FileState::Queued], 1);
    }
}
