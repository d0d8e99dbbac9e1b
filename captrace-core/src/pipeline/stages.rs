//! Stage workers: parse, then extract/persist. The ledger CAS keeps stages
//! ordered per document and makes concurrent attempts on the same content
//! mutually exclusive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use captrace_model::{
    AuditSeverity, DocId, DocType, ExtractorTag, FieldAudit, FileState,
    ValidationStatus,
};

use crate::error::{ErrorKind, PipelineError, Result};
use crate::index::{build_chunks, IndexJob};
use crate::metrics::Metrics;
use crate::parse::{self, ParsedDoc};
use crate::persist::repository::DocumentRecord;
use crate::persist::{DocumentBundle, PersistReport};
use crate::queue::WorkItem;

use super::EngineInner;

/// Characters of leading text stored on the document row.
const RAW_EXCERPT_LEN: usize = 2000;

/// Outcome of driving one file through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Processed,
    AlreadyProcessed,
    Skipped,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Processed => "processed",
            ProcessStatus::AlreadyProcessed => "already_processed",
            ProcessStatus::Skipped => "skipped",
            ProcessStatus::Failed => "failed",
        }
    }
}

/// Result of [`Engine::process_file`](super::Engine::process_file).
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub doc_id: Option<DocId>,
    pub status: ProcessStatus,
    pub confidence: f64,
    pub findings_count: u64,
}

/// A file that cleared parsing, heading for extraction.
pub(crate) struct ParsedItem {
    pub path: PathBuf,
    pub content_hash: String,
    pub investor_code: String,
    pub parsed: ParsedDoc,
    pub attempt: u32,
}

/// Spawn both stage pools over the work queue.
pub(crate) fn spawn_stage_pools(
    inner: Arc<EngineInner>,
    work_rx: mpsc::Receiver<WorkItem>,
    parsed_capacity: usize,
) {
    let (parsed_tx, parsed_rx) = mpsc::channel::<ParsedItem>(parsed_capacity);

    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    for worker_no in 0..inner.settings.workers.parser_workers.max(1) {
        let inner = inner.clone();
        let work_rx = work_rx.clone();
        let parsed_tx = parsed_tx.clone();
        tokio::spawn(async move {
            debug!(worker_no, "parser worker started");
            loop {
                let item = tokio::select! {
                    _ = inner.token.cancelled() => return,
                    item = async { work_rx.lock().await.recv().await } => item,
                };
                let Some(item) = item else { return };
                Metrics::gauge_add(&inner.metrics.queue_depth, -1);
                Metrics::gauge_add(&inner.metrics.busy_workers, 1);
                if let Some(parsed) = parse_stage(&inner, item, None).await {
                    if parsed_tx.send(parsed).await.is_err() {
                        Metrics::gauge_add(&inner.metrics.busy_workers, -1);
                        return;
                    }
                }
                Metrics::gauge_add(&inner.metrics.busy_workers, -1);
            }
        });
    }

    let parsed_rx = Arc::new(tokio::sync::Mutex::new(parsed_rx));
    for worker_no in 0..inner.settings.workers.extractor_workers.max(1) {
        let inner = inner.clone();
        let parsed_rx = parsed_rx.clone();
        tokio::spawn(async move {
            debug!(worker_no, "extractor worker started");
            loop {
                let item = tokio::select! {
                    _ = inner.token.cancelled() => return,
                    item = async { parsed_rx.lock().await.recv().await } => item,
                };
                let Some(item) = item else { return };
                Metrics::gauge_add(&inner.metrics.busy_workers, 1);
                extract_persist_stage(&inner, item, false).await;
                Metrics::gauge_add(&inner.metrics.busy_workers, -1);
            }
        });
    }
}

/// Claim the record and parse the file. Returns the parsed item, or `None`
/// when the file is a duplicate, in flight elsewhere, or failed.
/// `investor_override` lets the operator path attribute files that live
/// outside the configured roots.
async fn parse_stage(
    inner: &Arc<EngineInner>,
    item: WorkItem,
    investor_override: Option<&str>,
) -> Option<ParsedItem> {
    let outcome = match inner.ledger.register(&item.path).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(path = %item.path.display(), error = %err, "register failed");
            if err.is_retryable() {
                schedule_work_retry(inner, item);
            }
            return None;
        }
    };
    let hash = outcome.record.content_hash.clone();

    // Claim: only one worker may carry a record through Queued -> Parsing.
    match outcome.record.state {
        FileState::Discovered => {
            inner
                .ledger
                .transition(&hash, FileState::Discovered, FileState::Queued, None)
                .ok()?;
        }
        FileState::Queued => {}
        FileState::Failed => {
            if inner.ledger.retry(&hash).is_none() {
                debug!(path = %item.path.display(), "attempt budget spent; leaving failed");
                return None;
            }
        }
        // In flight on another worker, or already done.
        _ => {
            Metrics::incr(&inner.metrics.duplicates_skipped);
            return None;
        }
    }
    if inner
        .ledger
        .transition(&hash, FileState::Queued, FileState::Parsing, None)
        .is_err()
    {
        return None;
    }

    if inner.token.is_cancelled() {
        requeue_for_cancel(inner, &hash, FileState::Parsing);
        return None;
    }

    let investor_code = match investor_override {
        Some(code) => code.to_string(),
        None => match inner.settings.investor_for_path(&item.path) {
            Some(root) => root.investor_code.clone(),
            None => {
                fail_record(
                    inner,
                    &hash,
                    &item,
                    ErrorKind::Fatal,
                    "file is outside every configured investor root".into(),
                );
                return None;
            }
        },
    };

    let bytes = match inner.fs.read(&item.path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            fail_record(inner, &hash, &item, ErrorKind::Transient, err);
            return None;
        }
    };

    let deadline = Duration::from_secs(inner.settings.deadlines.parser_secs);
    let path = item.path.clone();
    let parse_result = tokio::time::timeout(
        deadline,
        tokio::task::spawn_blocking(move || parse::parse_file(&path, &bytes)),
    )
    .await;

    let parsed = match parse_result {
        Err(_) => {
            // Deadline: back to Queued, no attempt burned; the requeue is
            // delayed so a chronically slow file cannot hot-loop.
            warn!(path = %item.path.display(), ?deadline, "parse deadline exceeded");
            requeue_for_cancel(inner, &hash, FileState::Parsing);
            if item.attempt < inner.settings.max_attempts {
                schedule_work_retry(inner, item);
            }
            return None;
        }
        Ok(Err(join_err)) => {
            fail_record(
                inner,
                &hash,
                &item,
                ErrorKind::Fatal,
                format!("parser task panicked: {join_err}"),
            );
            return None;
        }
        Ok(Ok(Err(parse_err))) => {
            Metrics::incr(&inner.metrics.parse_failures);
            fail_record(inner, &hash, &item, parse_err.kind(), parse_err.to_string());
            return None;
        }
        Ok(Ok(Ok(parsed))) => parsed,
    };

    Metrics::incr(&inner.metrics.parsed);
    Some(ParsedItem {
        path: item.path,
        content_hash: hash,
        investor_code,
        parsed,
        attempt: item.attempt,
    })
}

/// Classify, extract, persist, and hand off to indexing/reconciliation.
pub(crate) async fn extract_persist_stage(
    inner: &Arc<EngineInner>,
    item: ParsedItem,
    force: bool,
) -> Option<(PersistReport, f64)> {
    let hash = item.content_hash.clone();
    if inner
        .ledger
        .transition(&hash, FileState::Parsing, FileState::Extracting, None)
        .is_err()
    {
        return None;
    }

    let doc_id = match DocId::from_content_hash(&hash) {
        Ok(doc_id) => doc_id,
        Err(err) => {
            fail_terminal(inner, &hash, format!("bad content hash: {err}"));
            return None;
        }
    };
    let filename = item
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();

    let classification = inner.classifier.classify(&filename, &item.parsed).await;
    let (doc_type, class_confidence, low_confidence) =
        if classification.confidence < inner.settings.classification_min_confidence {
            (DocType::Other, classification.confidence, true)
        } else {
            (classification.doc_type, classification.confidence, false)
        };

    let mut extraction = inner
        .chain
        .run(&doc_id, doc_type, &item.parsed, &filename)
        .await;
    if low_confidence {
        let mut audit = FieldAudit::new(doc_id.clone(), "doc_type", ExtractorTag::Default, class_confidence);
        audit.raw_value = Some(classification.doc_type.as_str().to_string());
        audit.normalized_value = Some(DocType::Other.as_str().to_string());
        audit.validation_status = ValidationStatus::Unchecked;
        audit.severity = AuditSeverity::Medium;
        audit.note = Some("classification confidence below floor; stored as other".into());
        extraction.audits.push(audit);
    }

    if inner.token.is_cancelled() {
        requeue_for_cancel(inner, &hash, FileState::Extracting);
        return None;
    }

    let overall_confidence = extraction.overall_confidence;
    let raw_excerpt: String = item
        .parsed
        .full_text()
        .chars()
        .take(RAW_EXCERPT_LEN)
        .collect();
    let bundle = DocumentBundle {
        doc_id: doc_id.clone(),
        content_hash: hash.clone(),
        source_path: item.path.clone(),
        doc_type,
        classification_confidence: class_confidence,
        extraction,
        raw_excerpt,
        investor_code: item.investor_code.clone(),
    };

    let persist_deadline = Duration::from_secs(inner.settings.deadlines.persist_secs);
    let persisted = tokio::time::timeout(persist_deadline, inner.writer.persist(&bundle, force)).await;

    let report = match persisted {
        Err(_) => {
            // The driver rolls the transaction back when the future is
            // dropped; nothing partial is visible.
            warn!(doc_id = %doc_id, ?persist_deadline, "persist deadline exceeded");
            requeue_for_cancel(inner, &hash, FileState::Extracting);
            if item.attempt < inner.settings.max_attempts {
                schedule_work_retry(
                    inner,
                    WorkItem {
                        path: item.path.clone(),
                        attempt: item.attempt,
                    },
                );
            }
            return None;
        }
        Ok(Err(PipelineError::DuplicateDocument { .. })) => {
            Metrics::incr(&inner.metrics.duplicates_skipped);
            let _ = inner
                .ledger
                .transition(&hash, FileState::Extracting, FileState::Skipped, None);
            info!(doc_id = %doc_id, "document already in store; skipped");
            return None;
        }
        Ok(Err(err)) => {
            Metrics::incr(&inner.metrics.persist_failures);
            let kind = err.kind();
            fail_record(
                inner,
                &hash,
                &WorkItem {
                    path: item.path.clone(),
                    attempt: item.attempt,
                },
                kind,
                err.to_string(),
            );
            return None;
        }
        Ok(Ok(report)) => report,
    };

    if inner
        .ledger
        .transition(&hash, FileState::Extracting, FileState::Persisted, None)
        .is_err()
    {
        return None;
    }

    // Indexing is decoupled and non-fatal.
    let chunks = build_chunks(&bundle, &report, &item.parsed.pages);
    if chunks.is_empty() {
        let _ = inner
            .repository
            .update_embedding_status(doc_id.as_str(), "completed", 0, None)
            .await;
        let _ = inner
            .ledger
            .transition(&hash, FileState::Persisted, FileState::Embedded, None);
    } else {
        inner
            .indexer
            .enqueue(IndexJob {
                doc_id: doc_id.clone(),
                content_hash: hash.clone(),
                chunks,
                attempt: 0,
            })
            .await;
    }

    if let Some((fund, as_of)) = report.reconcile_key {
        let _ = inner.recon_tx.send((fund, as_of)).await;
    }
    Some((report, overall_confidence))
}

/// Synchronous single-file path used by the operator API.
pub(crate) async fn process_one(
    inner: &Arc<EngineInner>,
    path: &Path,
    investor_code: Option<&str>,
    force: bool,
) -> Result<ProcessResult> {
    let outcome = inner.ledger.register(path).await?;
    let hash = outcome.record.content_hash.clone();
    let doc_id = DocId::from_content_hash(&hash)
        .map_err(|e| PipelineError::Fatal(e.to_string()))?;

    if !force {
        match outcome.record.state {
            FileState::Discovered | FileState::Queued | FileState::Failed => {}
            state if state.is_terminal() => {
                return Ok(ProcessResult {
                    doc_id: Some(doc_id),
                    status: ProcessStatus::AlreadyProcessed,
                    confidence: 0.0,
                    findings_count: 0,
                });
            }
            _ => {
                // Another worker owns it right now.
                return Ok(ProcessResult {
                    doc_id: Some(doc_id),
                    status: ProcessStatus::AlreadyProcessed,
                    confidence: 0.0,
                    findings_count: 0,
                });
            }
        }
    }

    let investor_code = match investor_code {
        Some(code) => code.to_string(),
        None => inner
            .settings
            .investor_for_path(path)
            .map(|r| r.investor_code.clone())
            .ok_or_else(|| {
                PipelineError::Fatal("path is outside every configured root".into())
            })?,
    };

    // Force reprocessing runs outside the ledger state machine: the record
    // stays terminal while the operator path rewrites rows and re-indexes.
    if force {
        let bytes = inner
            .fs
            .read(path)
            .await
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        let path_owned = path.to_path_buf();
        let parsed = tokio::task::spawn_blocking(move || parse::parse_file(&path_owned, &bytes))
            .await
            .map_err(|e| PipelineError::Fatal(e.to_string()))??;

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let classification = inner.classifier.classify(filename, &parsed).await;
        let extraction = inner
            .chain
            .run(&doc_id, classification.doc_type, &parsed, filename)
            .await;
        let confidence = extraction.overall_confidence;
        let raw_excerpt: String = parsed.full_text().chars().take(RAW_EXCERPT_LEN).collect();
        let bundle = DocumentBundle {
            doc_id: doc_id.clone(),
            content_hash: hash.clone(),
            source_path: path.to_path_buf(),
            doc_type: classification.doc_type,
            classification_confidence: classification.confidence,
            extraction,
            raw_excerpt,
            investor_code,
        };
        let report = inner.writer.persist(&bundle, true).await?;

        // Stale chunks out, fresh chunks in.
        if let Err(err) = inner.vector.delete(&doc_id).await {
            warn!(doc_id = %doc_id, error = %err, "stale chunk delete failed");
        }
        let chunks = build_chunks(&bundle, &report, &parsed.pages);
        if !chunks.is_empty() {
            inner
                .indexer
                .enqueue(IndexJob {
                    doc_id: doc_id.clone(),
                    content_hash: hash.clone(),
                    chunks,
                    attempt: 0,
                })
                .await;
        }

        let findings_count = match report.reconcile_key {
            Some((fund, as_of)) => inner
                .reconciler
                .reconcile(fund, as_of, &[])
                .await?
                .map(|run| run.findings.len() as u64)
                .unwrap_or(0),
            None => 0,
        };
        return Ok(ProcessResult {
            doc_id: Some(doc_id),
            status: ProcessStatus::Processed,
            confidence,
            findings_count,
        });
    }

    // Normal path: drive the regular stages inline.
    let item = WorkItem {
        path: path.to_path_buf(),
        attempt: 0,
    };
    let Some(parsed) = parse_stage(inner, item, Some(&investor_code)).await else {
        let record = inner.ledger.get(&hash);
        let status = match record.as_ref().map(|r| r.state) {
            Some(FileState::Skipped) | Some(FileState::Embedded) | Some(FileState::Persisted) => {
                ProcessStatus::AlreadyProcessed
            }
            Some(FileState::Failed) => ProcessStatus::Failed,
            _ => ProcessStatus::Skipped,
        };
        return Ok(ProcessResult {
            doc_id: Some(doc_id),
            status,
            confidence: 0.0,
            findings_count: 0,
        });
    };

    match extract_persist_stage(inner, parsed, false).await {
        Some((report, confidence)) => {
            let findings_count = match report.reconcile_key {
                Some((fund, as_of)) => inner
                    .reconciler
                    .reconcile(fund, as_of, &[])
                    .await?
                    .map(|run| run.findings.len() as u64)
                    .unwrap_or(0),
                None => 0,
            };
            Ok(ProcessResult {
                doc_id: Some(doc_id),
                status: ProcessStatus::Processed,
                confidence,
                findings_count,
            })
        }
        None => {
            let record = inner.ledger.get(&hash);
            let status = match record.as_ref().map(|r| r.state) {
                Some(FileState::Skipped) => ProcessStatus::AlreadyProcessed,
                Some(FileState::Failed) => ProcessStatus::Failed,
                _ => ProcessStatus::Skipped,
            };
            Ok(ProcessResult {
                doc_id: Some(doc_id),
                status,
                confidence: 0.0,
                findings_count: 0,
            })
        }
    }
}

/// Rebuild an index job for the retry sweep from what the document row
/// still carries.
pub(crate) async fn rebuild_index_job(doc: &DocumentRecord) -> Option<IndexJob> {
    let excerpt = doc.raw_excerpt.as_deref()?.trim();
    if excerpt.is_empty() {
        return None;
    }
    let mut metadata = serde_json::json!({
        "doc_id": doc.doc_id,
        "doc_type": doc.doc_type,
        "investor_ref": doc.investor_id.to_string(),
    });
    if let Some(fund) = doc.fund_id {
        metadata["fund_ref"] = serde_json::json!(fund.to_string());
    }
    if let Some(date) = doc.as_of_date {
        metadata["as_of_date"] = serde_json::json!(date.to_string());
    }
    Some(IndexJob {
        doc_id: DocId::from_trusted(doc.doc_id.clone()),
        content_hash: doc.content_hash.clone(),
        chunks: vec![crate::vector::Chunk {
            text: excerpt.to_string(),
            metadata,
        }],
        attempt: 0,
    })
}

/// Cancellation path: back to Queued without consuming an attempt.
fn requeue_for_cancel(inner: &Arc<EngineInner>, hash: &str, from: FileState) {
    if let Err(err) = inner.ledger.transition(hash, from, FileState::Queued, None) {
        debug!(error = %err, "cancel requeue lost a race");
    }
}

/// Error path: Failed with the message; transient kinds re-enter the queue
/// with backoff while the attempt budget lasts.
fn fail_record(
    inner: &Arc<EngineInner>,
    hash: &str,
    item: &WorkItem,
    kind: ErrorKind,
    message: String,
) {
    let from = inner
        .ledger
        .get(hash)
        .map(|r| r.state)
        .unwrap_or(FileState::Parsing);
    let failed = inner
        .ledger
        .transition(hash, from, FileState::Failed, Some(message.clone()));
    warn!(path = %item.path.display(), kind = kind.as_str(), message, "work item failed");

    if kind.is_retryable() {
        if let Ok(record) = failed {
            if record.attempts < inner.ledger.max_attempts() {
                schedule_work_retry(
                    inner,
                    WorkItem {
                        path: item.path.clone(),
                        attempt: record.attempts,
                    },
                );
            }
        }
    }
}

fn fail_terminal(inner: &Arc<EngineInner>, hash: &str, message: String) {
    let from = inner
        .ledger
        .get(hash)
        .map(|r| r.state)
        .unwrap_or(FileState::Extracting);
    let _ = inner
        .ledger
        .transition(hash, from, FileState::Failed, Some(message));
}

/// Delayed re-enqueue with the taxonomy's jittered exponential backoff.
fn schedule_work_retry(inner: &Arc<EngineInner>, item: WorkItem) {
    Metrics::incr(&inner.metrics.retries_scheduled);
    let delay = crate::error::retry_delay(item.attempt);
    let work_tx = inner.work_tx.clone();
    let token = inner.token.clone();
    let metrics = inner.metrics.clone();
    let next = WorkItem {
        path: item.path,
        attempt: item.attempt + 1,
    };
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                Metrics::gauge_add(&metrics.queue_depth, 1);
                if work_tx.send(next).await.is_err() {
                    Metrics::gauge_add(&metrics.queue_depth, -1);
                }
            }
        }
    });
}
