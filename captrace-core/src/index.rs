//! Chunk building and bounded-concurrent indexing into the vector store.
//!
//! Indexing failures are non-fatal to persistence: the ledger stays at
//! `Persisted` with `embedding_status = failed`, and retries happen with
//! exponential backoff up to five attempts.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use captrace_model::{DocId, EmbeddingStatus, FileState};

use crate::ledger::FileLedger;
use crate::metrics::Metrics;
use crate::parse::Page;
use crate::persist::{DocumentBundle, PersistReport, Repository};
use crate::vector::{Chunk, VectorIndex};

/// Attempts per document before the indexer gives up.
const MAX_INDEX_ATTEMPTS: u32 = 5;
/// Base delay for indexing retries.
const INDEX_RETRY_BASE: Duration = Duration::from_secs(5);

/// One indexing unit. Carries the chunks so retries do not depend on
/// re-reading the source file.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub doc_id: DocId,
    pub content_hash: String,
    pub chunks: Vec<Chunk>,
    pub attempt: u32,
}

/// Build the chunk set for a persisted document.
///
/// Structured facts (capital accounts) synthesize one canonical chunk from
/// the normalized fields; free-text documents split by page, dropping
/// whitespace-only pages.
pub fn build_chunks(
    bundle: &DocumentBundle,
    report: &PersistReport,
    pages: &[Page],
) -> Vec<Chunk> {
    let base_metadata = |page_no: Option<usize>| {
        let mut meta = json!({
            "doc_id": bundle.doc_id.as_str(),
            "doc_type": bundle.doc_type.as_str(),
            "investor_ref": report.investor_id.to_string(),
            "currency": report.currency,
        });
        if let Some(fund) = report.fund_id {
            meta["fund_ref"] = json!(fund.to_string());
        }
        if let Some(date) = report.as_of_date {
            meta["as_of_date"] = json!(date.to_string());
        }
        if let Some(no) = page_no {
            meta["page_no"] = json!(no);
        }
        meta
    };

    if bundle.doc_type.has_structured_facts() && report.wrote_capital_account {
        return vec![Chunk {
            text: canonical_fact_text(bundle, report),
            metadata: base_metadata(None),
        }];
    }

    pages
        .iter()
        .filter(|page| !page.text.trim().is_empty())
        .map(|page| Chunk {
            text: page.text.clone(),
            metadata: base_metadata(Some(page.no)),
        })
        .collect()
}

/// One dense sentence-per-fact rendering; this is what analytical retrieval
/// queries land on.
fn canonical_fact_text(bundle: &DocumentBundle, report: &PersistReport) -> String {
    let e = &bundle.extraction;
    let mut out = String::new();
    out.push_str("Capital account statement");
    if let Some(fund) = e.text("fund_name") {
        out.push_str(&format!(" for fund {fund}"));
    }
    if let Some(investor) = e.text("investor_name") {
        out.push_str(&format!(", investor {investor}"));
    } else {
        out.push_str(&format!(", investor {}", bundle.investor_code));
    }
    if let Some(date) = report.as_of_date {
        out.push_str(&format!(", as of {date}"));
    }
    out.push_str(&format!(" ({}).", report.currency));

    let mut line = |label: &str, field: &str| {
        if let Some(value) = e.money(field) {
            out.push_str(&format!(" {label}: {value:.2}."));
        }
    };
    line("Beginning balance", "beginning_balance");
    line("Ending balance", "ending_balance");
    line("Contributions in period", "contributions_period");
    line("Distributions in period", "distributions_period");
    line("Management fees", "management_fees_period");
    line("Partnership expenses", "partnership_expenses_period");
    line("Realized gain/loss", "realized_gain_loss_period");
    line("Unrealized gain/loss", "unrealized_gain_loss_period");
    line("Total commitment", "total_commitment");
    line("Drawn commitment", "drawn_commitment");
    line("Unfunded commitment", "unfunded_commitment");
    out
}

/// Bounded pool writing chunks to the vector index.
pub struct Indexer {
    vector: Arc<dyn VectorIndex>,
    repository: Repository,
    ledger: Arc<FileLedger>,
    metrics: Arc<Metrics>,
    upload_timeout: Duration,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("upload_timeout", &self.upload_timeout)
            .finish()
    }
}

/// Handle used by the pipeline to enqueue jobs.
#[derive(Clone)]
pub struct IndexerHandle {
    tx: mpsc::Sender<IndexJob>,
}

impl std::fmt::Debug for IndexerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerHandle").finish()
    }
}

impl IndexerHandle {
    pub async fn enqueue(&self, job: IndexJob) {
        if self.tx.send(job).await.is_err() {
            warn!("indexer pool is gone; dropping index job");
        }
    }
}

impl Indexer {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        repository: Repository,
        ledger: Arc<FileLedger>,
        metrics: Arc<Metrics>,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            vector,
            repository,
            ledger,
            metrics,
            upload_timeout,
        }
    }

    /// Spawn `workers` consumers plus the retry sweep. Returns the enqueue
    /// handle and the worker join handles.
    pub fn spawn(
        self,
        workers: usize,
        token: CancellationToken,
    ) -> (IndexerHandle, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<IndexJob>(workers.max(1) * 4);
        let shared = Arc::new(self);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::new();

        for worker_no in 0..workers.max(1) {
            let shared = shared.clone();
            let rx = rx.clone();
            let tx = tx.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = token.cancelled() => return,
                        job = async { rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { return };
                    shared.process(job, &tx, &token).await;
                }
            }));
            debug!(worker_no, "indexer worker started");
        }

        (IndexerHandle { tx }, handles)
    }

    async fn process(
        &self,
        job: IndexJob,
        tx: &mpsc::Sender<IndexJob>,
        token: &CancellationToken,
    ) {
        let outcome = tokio::time::timeout(
            self.upload_timeout,
            self.vector.add_chunks(&job.doc_id, &job.chunks),
        )
        .await;

        match outcome {
            Ok(Ok(ids)) => {
                Metrics::incr(&self.metrics.indexed);
                if let Err(err) = self
                    .repository
                    .update_embedding_status(
                        job.doc_id.as_str(),
                        EmbeddingStatus::Completed.as_str(),
                        ids.len() as i32,
                        None,
                    )
                    .await
                {
                    warn!(doc_id = %job.doc_id, error = %err, "embedding status update failed");
                }
                if let Err(err) = self.ledger.transition(
                    &job.content_hash,
                    FileState::Persisted,
                    FileState::Embedded,
                    None,
                ) {
                    debug!(doc_id = %job.doc_id, error = %err, "ledger already advanced");
                }
                info!(doc_id = %job.doc_id, chunks = ids.len(), "document embedded");
            }
            Ok(Err(err)) => {
                self.record_failure(&job, err.to_string(), tx, token).await;
            }
            Err(_) => {
                self.record_failure(
                    &job,
                    format!("chunk upload exceeded {:?}", self.upload_timeout),
                    tx,
                    token,
                )
                .await;
            }
        }
    }

    async fn record_failure(
        &self,
        job: &IndexJob,
        error: String,
        tx: &mpsc::Sender<IndexJob>,
        token: &CancellationToken,
    ) {
        Metrics::incr(&self.metrics.index_failures);
        if let Err(err) = self
            .repository
            .update_embedding_status(
                job.doc_id.as_str(),
                EmbeddingStatus::Failed.as_str(),
                0,
                Some(&error),
            )
            .await
        {
            warn!(doc_id = %job.doc_id, error = %err, "embedding status update failed");
        }

        let next_attempt = job.attempt + 1;
        if next_attempt >= MAX_INDEX_ATTEMPTS {
            warn!(doc_id = %job.doc_id, error = %error, "indexing abandoned after retries");
            return;
        }
        let delay = INDEX_RETRY_BASE * 2u32.pow(job.attempt.min(8));
        warn!(doc_id = %job.doc_id, attempt = next_attempt, delay = ?delay, error = %error, "indexing failed; retrying");

        let retry = IndexJob {
            attempt: next_attempt,
            ..job.clone()
        };
        let tx = tx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(retry).await;
                }
            }
        });
    }
}

/// In-memory attempt bookkeeping for the background sweep, so restarts of
/// the sweep do not retry a document forever.
#[derive(Debug, Default)]
pub struct SweepAttempts {
    attempts: DashMap<String, u32>,
}

impl SweepAttempts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more sweep attempt; false once the budget is spent.
    pub fn try_claim(&self, doc_id: &str) -> bool {
        let mut entry = self.attempts.entry(doc_id.to_string()).or_insert(0);
        if *entry >= MAX_INDEX_ATTEMPTS {
            return false;
        }
        *entry += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractorChain;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::parse::ParsedDoc;
    use captrace_model::{DocType, FundId, InvestorId};
    use chrono::NaiveDate;

    async fn sample_bundle_and_report() -> (DocumentBundle, PersistReport) {
        let mut llm = MockLlmClient::new();
        llm.expect_extract_fields()
            .returning(|_| Err(LlmError::Transient("offline".into())));
        let chain = ExtractorChain::new(Arc::new(llm), Arc::new(Metrics::new()));
        let text = "Capital Account Statement\nFund: Alpha Fund\nAs of Date: 2023-12-31\n\
                    Beginning Balance: 35,000,000\nEnding Balance: 40,700,000";
        let parsed = ParsedDoc {
            pages: vec![Page { no: 1, text: text.into() }],
            tables: vec![],
            metadata: Default::default(),
        };
        let doc_id = DocId::from_trusted("aaaaaaaaaaaaaaaa");
        let extraction = chain
            .run(&doc_id, DocType::CapitalAccountStatement, &parsed, "cas.pdf")
            .await;
        let bundle = DocumentBundle {
            doc_id: doc_id.clone(),
            content_hash: "aa".repeat(32),
            source_path: "/inv/cas.pdf".into(),
            doc_type: DocType::CapitalAccountStatement,
            classification_confidence: 0.95,
            extraction,
            raw_excerpt: text.into(),
            investor_code: "brainweb".into(),
        };
        let report = PersistReport {
            doc_id,
            investor_id: InvestorId::new(),
            fund_id: Some(FundId::new()),
            as_of_date: NaiveDate::from_ymd_opt(2023, 12, 31),
            currency: "EUR".into(),
            wrote_capital_account: true,
            reconcile_key: None,
        };
        (bundle, report)
    }

    #[tokio::test]
    async fn capital_accounts_become_one_canonical_chunk() {
        let (bundle, report) = sample_bundle_and_report().await;
        let pages = vec![Page { no: 1, text: "raw page".into() }];
        let chunks = build_chunks(&bundle, &report, &pages);
        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert!(chunk.text.contains("Ending balance: 40700000.00"));
        assert!(chunk.text.contains("Alpha Fund"));
        assert_eq!(chunk.metadata["doc_type"], "capital_account_statement");
        assert_eq!(chunk.metadata["as_of_date"], "2023-12-31");
        assert!(chunk.metadata.get("page_no").is_none());
    }

    #[tokio::test]
    async fn free_text_documents_chunk_by_page() {
        let (mut bundle, mut report) = sample_bundle_and_report().await;
        bundle.doc_type = DocType::Lpa;
        report.wrote_capital_account = false;
        let pages = vec![
            Page { no: 1, text: "clause one".into() },
            Page { no: 2, text: "   ".into() },
            Page { no: 3, text: "clause two".into() },
        ];
        let chunks = build_chunks(&bundle, &report, &pages);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata["page_no"], 1);
        assert_eq!(chunks[1].metadata["page_no"], 3);
    }

    #[tokio::test]
    async fn sweep_attempts_cap_at_budget() {
        let attempts = SweepAttempts::new();
        for _ in 0..MAX_INDEX_ATTEMPTS {
            assert!(attempts.try_claim("doc1"));
        }
        assert!(!attempts.try_claim("doc1"));
        assert!(attempts.try_claim("doc2"));
    }
}
