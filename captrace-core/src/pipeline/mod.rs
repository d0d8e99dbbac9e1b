//! Pipeline orchestration: bounded channels, stage worker pools, and the
//! [`Engine`] façade the binary (and tests) drive.
//!
//! ```text
//! Discovery -> Debouncer -> WorkQueue -> ParserPool -> ExtractorPool
//!           -> PersistenceWriter (serialized per doc) -> IndexerPool
//!                                   \-> ReconciliationEngine
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use captrace_config::Settings;
use captrace_model::{FileState, FundId, ReconciliationRun, ReconciliationType};

use crate::classify::Classifier;
use crate::error::{PipelineError, Result};
use crate::extract::ExtractorChain;
use crate::fs::FileSystem;
use crate::index::{Indexer, IndexerHandle, SweepAttempts};
use crate::ledger::FileLedger;
use crate::llm::LlmClient;
use crate::metrics::Metrics;
use crate::persist::{PersistenceWriter, Repository};
use crate::queue::{Debouncer, WorkItem};
use crate::reconcile::ReconciliationEngine;
use crate::vector::{SearchFilters, SearchHit, VectorIndex};
use crate::watch::{DiscoveryEvent, EventSource, Sweeper};

mod stages;

pub use stages::{ProcessResult, ProcessStatus};

/// Capacity of the discovery channel between watchers and the debouncer.
const DISCOVERY_CHANNEL_CAPACITY: usize = 256;
/// Capacity of the parsed-document channel between the two stage pools.
const PARSED_CHANNEL_CAPACITY: usize = 64;
/// Secondary cap on distinct in-window paths held by the debouncer.
const DEBOUNCE_PENDING_CAP: usize = 4096;
/// Cadence of the embedding retry sweep.
const EMBED_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Snapshot returned by [`Engine::status`].
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub ledger_states: BTreeMap<String, u64>,
    pub queue_depth: i64,
    pub busy_workers: i64,
    pub backlog: u64,
    pub counters: BTreeMap<&'static str, i64>,
}

/// Result of a rescan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescanStats {
    pub queued: u64,
    pub skipped: u64,
}

/// Ingestion overview assembled from the read-side repository.
#[derive(Debug, Clone)]
pub struct ProcessingReport {
    pub by_type: Vec<crate::persist::repository::DocTypeCount>,
    pub by_investor: Vec<crate::persist::repository::InvestorDocCount>,
    pub recent: Vec<crate::persist::repository::DocumentRecord>,
}

pub(crate) struct EngineInner {
    pub settings: Arc<Settings>,
    pub fs: Arc<dyn FileSystem>,
    pub metrics: Arc<Metrics>,
    pub ledger: Arc<FileLedger>,
    pub classifier: Classifier,
    pub chain: ExtractorChain,
    pub writer: PersistenceWriter,
    pub repository: Repository,
    pub reconciler: Arc<ReconciliationEngine>,
    pub vector: Arc<dyn VectorIndex>,
    pub indexer: IndexerHandle,
    pub work_tx: mpsc::Sender<WorkItem>,
    pub recon_tx: mpsc::Sender<(FundId, NaiveDate)>,
    pub token: CancellationToken,
}

/// The assembled pipeline. Capabilities are injected at construction; no
/// globals beyond the ledger and metrics the engine itself owns.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("roots", &self.inner.settings.roots.len())
            .finish()
    }
}

impl Engine {
    /// Wire channels, spawn every worker pool, and start watching. The
    /// returned engine is live until [`Engine::shutdown`].
    pub async fn start(
        settings: Settings,
        pool: sqlx::PgPool,
        llm: Arc<dyn LlmClient>,
        vector: Arc<dyn VectorIndex>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let metrics = Arc::new(Metrics::new());
        let ledger = Arc::new(FileLedger::new(fs.clone(), settings.max_attempts));
        let token = CancellationToken::new();

        let repository = Repository::new(pool.clone());
        let writer = PersistenceWriter::new(
            pool.clone(),
            metrics.clone(),
            settings.reporting_currency.clone(),
        );
        let reconciler = Arc::new(ReconciliationEngine::new(
            repository.clone(),
            settings.tolerances.clone(),
            metrics.clone(),
        ));

        let (discovery_tx, discovery_rx) =
            mpsc::channel::<DiscoveryEvent>(DISCOVERY_CHANNEL_CAPACITY);
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(settings.work_queue_capacity);
        let (recon_tx, recon_rx) = mpsc::channel::<(FundId, NaiveDate)>(64);

        let indexer = Indexer::new(
            vector.clone(),
            repository.clone(),
            ledger.clone(),
            metrics.clone(),
            Duration::from_secs(settings.deadlines.indexer_secs),
        );
        let (indexer_handle, _indexer_tasks) =
            indexer.spawn(settings.workers.indexer_workers, token.clone());

        let inner = Arc::new(EngineInner {
            settings: settings.clone(),
            fs: fs.clone(),
            metrics: metrics.clone(),
            ledger: ledger.clone(),
            classifier: Classifier::new(llm.clone(), metrics.clone()),
            chain: ExtractorChain::new(llm, metrics.clone()),
            writer,
            repository,
            reconciler: reconciler.clone(),
            vector,
            indexer: indexer_handle,
            work_tx: work_tx.clone(),
            recon_tx: recon_tx.clone(),
            token: token.clone(),
        });
        let engine = Engine { inner: inner.clone() };

        // Discovery: filesystem events plus the startup sweep.
        EventSource::new(settings.clone(), fs.clone(), metrics.clone(), discovery_tx.clone())
            .spawn(token.clone());
        let sweeper = Sweeper::new(
            settings.clone(),
            fs.clone(),
            metrics.clone(),
            discovery_tx.clone(),
        );
        tokio::spawn(async move {
            sweeper.sweep_all().await;
        });
        engine.spawn_rescan_cron(discovery_tx);

        // Debouncer between discovery and the work queue.
        let debouncer = Debouncer::new(
            Duration::from_secs(settings.debounce_seconds),
            DEBOUNCE_PENDING_CAP,
            ledger.clone(),
            fs.clone(),
            metrics.clone(),
            work_tx,
        );
        tokio::spawn(debouncer.run(discovery_rx, token.clone()));

        // Stage pools.
        stages::spawn_stage_pools(
            inner.clone(),
            work_rx,
            PARSED_CHANNEL_CAPACITY,
        );

        // Reconciliation workers plus the nightly sweep.
        engine.spawn_reconciliation_workers(recon_rx, reconciler);
        engine.spawn_nightly_reconciliation();
        engine.spawn_embedding_retry_sweep();

        info!(
            roots = engine.inner.settings.roots.len(),
            parser_workers = engine.inner.settings.workers.parser_workers,
            extractor_workers = engine.inner.settings.workers.extractor_workers,
            "pipeline started"
        );
        Ok(engine)
    }

    /// Apply pending schema migrations.
    pub async fn migrate(pool: &sqlx::PgPool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| PipelineError::Fatal(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Process one file end to end, bypassing discovery. Used by the
    /// operator CLI and by tests.
    pub async fn process_file(
        &self,
        path: &Path,
        investor_code: Option<&str>,
        force: bool,
    ) -> Result<ProcessResult> {
        stages::process_one(&self.inner, path, investor_code, force).await
    }

    /// Walk one root (or all configured roots), enqueueing unseen files.
    /// Files whose unchanged fingerprint already maps to a live or finished
    /// record are skipped, which makes back-to-back rescans idempotent.
    pub async fn rescan(&self, root: Option<&Path>) -> Result<RescanStats> {
        let (tx, mut rx) = mpsc::channel::<DiscoveryEvent>(DISCOVERY_CHANNEL_CAPACITY);
        let sweeper = Sweeper::new(
            self.inner.settings.clone(),
            self.inner.fs.clone(),
            self.inner.metrics.clone(),
            tx,
        );
        let roots: Vec<PathBuf> = match root {
            Some(root) => vec![root.to_path_buf()],
            None => self
                .inner
                .settings
                .roots
                .iter()
                .map(|r| r.path.clone())
                .collect(),
        };
        let sweep = tokio::spawn(async move {
            for root in roots {
                if let Err(err) = sweeper.sweep_root(&root).await {
                    warn!(root = %root.display(), error = %err, "rescan sweep failed");
                }
            }
        });

        let mut stats = RescanStats::default();
        while let Some(event) = rx.recv().await {
            match self.admit_for_rescan(&event.path).await {
                true => {
                    stats.queued += 1;
                    Metrics::incr(&self.inner.metrics.queued);
                    Metrics::gauge_add(&self.inner.metrics.queue_depth, 1);
                    if self
                        .inner
                        .work_tx
                        .send(WorkItem {
                            path: event.path,
                            attempt: 0,
                        })
                        .await
                        .is_err()
                    {
                        Metrics::gauge_add(&self.inner.metrics.queue_depth, -1);
                        break;
                    }
                }
                false => {
                    stats.skipped += 1;
                    Metrics::incr(&self.inner.metrics.duplicates_skipped);
                }
            }
        }
        let _ = sweep.await;
        Ok(stats)
    }

    /// A file enters the queue only when its unchanged fingerprint is not
    /// already tracked by a non-Failed record.
    async fn admit_for_rescan(&self, path: &Path) -> bool {
        let Ok(md) = self.inner.fs.metadata(path).await else {
            return false;
        };
        let mtime = md
            .modified
            .map(chrono::DateTime::<chrono::Utc>::from)
            .unwrap_or_else(chrono::Utc::now);
        match self.inner.ledger.find_by_fingerprint(path, mtime, md.len) {
            Some(record) => record.state == FileState::Failed,
            None => true,
        }
    }

    /// Run reconciliation on demand. `None` means a run for the same key
    /// was already in flight.
    pub async fn reconcile(
        &self,
        fund_ref: FundId,
        as_of_date: NaiveDate,
        scope: &[ReconciliationType],
    ) -> Result<Option<ReconciliationRun>> {
        self.inner.reconciler.reconcile(fund_ref, as_of_date, scope).await
    }

    /// Semantic search over indexed chunks, newest reporting dates first on
    /// equal scores.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = self
            .inner
            .vector
            .search(query, top_k, filters)
            .await
            .map_err(|e| PipelineError::Fatal(e.to_string()))?;
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let date = |hit: &SearchHit| {
                        hit.metadata
                            .get("as_of_date")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    };
                    date(b).cmp(&date(a))
                })
        });
        Ok(hits)
    }

    /// Operator reset of a failed ledger entry.
    pub fn reset(&self, content_hash: &str) -> Result<()> {
        self.inner.ledger.reset(content_hash)?;
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        let ledger_states = self
            .inner
            .ledger
            .stats_by_state()
            .into_iter()
            .map(|(state, count)| (state.as_str().to_string(), count))
            .collect::<BTreeMap<_, _>>();
        let counters = self.inner.metrics.snapshot();
        let queue_depth = counters.get("queue_depth").copied().unwrap_or(0);
        let busy_workers = counters.get("busy_workers").copied().unwrap_or(0);
        let backlog = ledger_states.get("queued").copied().unwrap_or(0)
            + ledger_states.get("parsing").copied().unwrap_or(0)
            + ledger_states.get("extracting").copied().unwrap_or(0);
        EngineStatus {
            ledger_states,
            queue_depth,
            busy_workers,
            backlog,
            counters,
        }
    }

    pub fn ledger(&self) -> &FileLedger {
        &self.inner.ledger
    }

    /// Read-side repository, for operator tooling and reports.
    pub fn repository(&self) -> &Repository {
        &self.inner.repository
    }

    /// Ingestion overview: counts per document type and per investor, plus
    /// the latest documents.
    pub async fn processing_report(&self) -> Result<ProcessingReport> {
        Ok(ProcessingReport {
            by_type: self.inner.repository.documents_by_type().await?,
            by_investor: self.inner.repository.documents_per_investor().await?,
            recent: self.inner.repository.recent_documents(20).await?,
        })
    }

    /// Signal every worker to stop. In-flight documents return to `Queued`
    /// without burning an attempt.
    pub fn shutdown(&self) {
        info!("pipeline shutdown requested");
        self.inner.token.cancel();
    }

    fn spawn_rescan_cron(&self, discovery_tx: mpsc::Sender<DiscoveryEvent>) -> Option<JoinHandle<()>> {
        use std::str::FromStr;
        let schedule = match cron::Schedule::from_str(&self.inner.settings.rescan_cron) {
            Ok(schedule) => schedule,
            Err(err) => {
                error!(
                    cron = %self.inner.settings.rescan_cron,
                    error = %err,
                    "invalid rescan cron; periodic sweeps disabled"
                );
                return None;
            }
        };
        let settings = self.inner.settings.clone();
        let fs = self.inner.fs.clone();
        let metrics = self.inner.metrics.clone();
        let token = self.inner.token.clone();
        Some(tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                    return;
                };
                let wait = (next - chrono::Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(1));
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                debug!("cron sweep tick");
                let sweeper = Sweeper::new(
                    settings.clone(),
                    fs.clone(),
                    metrics.clone(),
                    discovery_tx.clone(),
                );
                sweeper.sweep_all().await;
            }
        }))
    }

    fn spawn_reconciliation_workers(
        &self,
        recon_rx: mpsc::Receiver<(FundId, NaiveDate)>,
        reconciler: Arc<ReconciliationEngine>,
    ) {
        let workers = self.inner.settings.workers.reconciliation_workers.max(1);
        let rx = Arc::new(tokio::sync::Mutex::new(recon_rx));
        for _ in 0..workers {
            let rx = rx.clone();
            let reconciler = reconciler.clone();
            let token = self.inner.token.clone();
            tokio::spawn(async move {
                loop {
                    let trigger = tokio::select! {
                        _ = token.cancelled() => return,
                        trigger = async { rx.lock().await.recv().await } => trigger,
                    };
                    let Some((fund, as_of)) = trigger else { return };
                    if let Err(err) = reconciler.reconcile(fund, as_of, &[]).await {
                        warn!(fund = %fund, %as_of, error = %err, "triggered reconciliation failed");
                    }
                }
            });
        }
    }

    /// Nightly pass over funds with document activity in the last day.
    fn spawn_nightly_reconciliation(&self) {
        let repository = self.inner.repository.clone();
        let recon_tx = self.inner.recon_tx.clone();
        let token = self.inner.token.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 3600));
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let since = chrono::Utc::now() - chrono::Duration::days(1);
                match repository.funds_with_recent_activity(since).await {
                    Ok(pairs) => {
                        info!(funds = pairs.len(), "nightly reconciliation sweep");
                        for (fund, as_of) in pairs {
                            let _ = recon_tx.send((FundId(fund), as_of)).await;
                        }
                    }
                    Err(err) => warn!(error = %err, "nightly sweep query failed"),
                }
            }
        });
    }

    /// Re-enqueue documents whose chunks never reached the vector index.
    fn spawn_embedding_retry_sweep(&self) {
        let repository = self.inner.repository.clone();
        let indexer = self.inner.indexer.clone();
        let token = self.inner.token.clone();
        let attempts = Arc::new(SweepAttempts::new());
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EMBED_SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let docs = match repository.failed_embedding_documents(32).await {
                    Ok(docs) => docs,
                    Err(err) => {
                        warn!(error = %err, "embedding sweep query failed");
                        continue;
                    }
                };
                for doc in docs {
                    if !attempts.try_claim(&doc.doc_id) {
                        continue;
                    }
                    if let Some(job) = stages::rebuild_index_job(&doc).await {
                        debug!(doc_id = %doc.doc_id, "re-queued failed embedding");
                        indexer.enqueue(job).await;
                    }
                }
            }
        });
    }
}
