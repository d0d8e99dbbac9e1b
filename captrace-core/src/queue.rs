//! Debouncing and admission of discovery events into the work queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::fs::FileSystem;
use crate::ledger::FileLedger;
use crate::metrics::Metrics;
use crate::watch::DiscoveryEvent;

/// One unit of pipeline work. The hash is left to the ledger; the debouncer
/// only carries the path and the attempt ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub attempt: u32,
}

/// Coalesces rapid per-path events and feeds the bounded work channel.
///
/// A new event for a path already in its window resets that path's timer;
/// exactly one [`WorkItem`] is emitted when the window expires. Before
/// emitting, the ledger is consulted: an unchanged file whose record already
/// sits in a terminal non-Failed state is counted as a duplicate and not
/// enqueued.
///
/// Backpressure: `work_tx` is bounded. When it fills, the debouncer blocks
/// in `send`, which in turn stops it draining `events_rx`; the sweeper then
/// blocks on the discovery channel. Event-mode arrivals keep coalescing into
/// the pending map meanwhile, which is capped: at `pending_cap` distinct
/// paths the oldest entry is flushed early.
pub struct Debouncer {
    window: Duration,
    pending_cap: usize,
    ledger: Arc<FileLedger>,
    fs: Arc<dyn FileSystem>,
    metrics: Arc<Metrics>,
    work_tx: mpsc::Sender<WorkItem>,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("window", &self.window)
            .field("pending_cap", &self.pending_cap)
            .finish()
    }
}

impl Debouncer {
    pub fn new(
        window: Duration,
        pending_cap: usize,
        ledger: Arc<FileLedger>,
        fs: Arc<dyn FileSystem>,
        metrics: Arc<Metrics>,
        work_tx: mpsc::Sender<WorkItem>,
    ) -> Self {
        Self {
            window,
            pending_cap,
            ledger,
            fs,
            metrics,
            work_tx,
        }
    }

    /// Drain events until the channel closes or shutdown is requested.
    pub async fn run(
        self,
        mut events_rx: mpsc::Receiver<DiscoveryEvent>,
        token: CancellationToken,
    ) {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

        loop {
            let next_deadline = pending.values().min().copied();

            tokio::select! {
                _ = token.cancelled() => {
                    debug!(pending = pending.len(), "debouncer shutting down");
                    return;
                }
                maybe = events_rx.recv() => {
                    match maybe {
                        Some(event) => {
                            trace!(path = %event.path.display(), cause = event.cause.as_str(), "debouncing");
                            if !pending.contains_key(&event.path)
                                && pending.len() >= self.pending_cap
                            {
                                // Secondary cap reached: flush the oldest
                                // path early rather than grow unbounded.
                                if let Some(oldest) = pending
                                    .iter()
                                    .min_by_key(|(_, at)| **at)
                                    .map(|(p, _)| p.clone())
                                {
                                    pending.remove(&oldest);
                                    self.emit(oldest).await;
                                }
                            }
                            pending.insert(event.path, Instant::now() + self.window);
                        }
                        None => {
                            // Discovery went away: flush whatever is pending
                            // and stop.
                            for path in std::mem::take(&mut pending).into_keys() {
                                self.emit(path).await;
                            }
                            return;
                        }
                    }
                }
                _ = sleep_until_or_never(next_deadline), if next_deadline.is_some() => {
                    let now = Instant::now();
                    let expired: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(p, _)| p.clone())
                        .collect();
                    for path in expired {
                        pending.remove(&path);
                        self.emit(path).await;
                    }
                }
            }
        }
    }

    /// Ledger-aware emission of a settled path.
    async fn emit(&self, path: PathBuf) {
        let md = match self.fs.metadata(&path).await {
            Ok(md) if md.is_file => md,
            Ok(_) => return,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "file vanished before enqueue");
                return;
            }
        };
        let mtime: DateTime<Utc> = md
            .modified
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        if let Some(record) = self.ledger.find_by_fingerprint(&path, mtime, md.len) {
            if record.state.is_terminal() {
                Metrics::incr(&self.metrics.duplicates_skipped);
                debug!(path = %path.display(), state = %record.state, "duplicate; not enqueued");
                return;
            }
        }

        Metrics::incr(&self.metrics.queued);
        Metrics::gauge_add(&self.metrics.queue_depth, 1);
        if self
            .work_tx
            .send(WorkItem { path, attempt: 0 })
            .await
            .is_err()
        {
            Metrics::gauge_add(&self.metrics.queue_depth, -1);
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::watch::DiscoveryCause;
    use captrace_model::FileState;
    use std::path::Path;

    struct Harness {
        events_tx: mpsc::Sender<DiscoveryEvent>,
        work_rx: mpsc::Receiver<WorkItem>,
        ledger: Arc<FileLedger>,
        fs: Arc<MemoryFs>,
        metrics: Arc<Metrics>,
        token: CancellationToken,
    }

    fn start(window_secs: u64) -> Harness {
        let fs = Arc::new(MemoryFs::new());
        let ledger = Arc::new(FileLedger::new(fs.clone(), 3));
        let metrics = Arc::new(Metrics::new());
        let (events_tx, events_rx) = mpsc::channel(64);
        let (work_tx, work_rx) = mpsc::channel(64);
        let token = CancellationToken::new();
        let debouncer = Debouncer::new(
            Duration::from_secs(window_secs),
            1024,
            ledger.clone(),
            fs.clone(),
            metrics.clone(),
            work_tx,
        );
        tokio::spawn(debouncer.run(events_rx, token.clone()));
        Harness {
            events_tx,
            work_rx,
            ledger,
            fs,
            metrics,
            token,
        }
    }

    fn event(path: &str, cause: DiscoveryCause) -> DiscoveryEvent {
        DiscoveryEvent::new(PathBuf::from(path), cause)
    }

    #[tokio::test(start_paused = true)]
    async fn ten_rapid_events_coalesce_to_one_item() {
        let mut h = start(5);
        h.fs.add_file("/inv/a.pdf", b"x".to_vec());

        for _ in 0..10 {
            h.events_tx
                .send(event("/inv/a.pdf", DiscoveryCause::Modified))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_secs(6)).await;

        let item = h.work_rx.recv().await.unwrap();
        assert_eq!(item.path, PathBuf::from("/inv/a.pdf"));
        assert!(h.work_rx.try_recv().is_err(), "exactly one item expected");
        h.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_on_new_event() {
        let mut h = start(5);
        h.fs.add_file("/inv/a.pdf", b"x".to_vec());

        h.events_tx
            .send(event("/inv/a.pdf", DiscoveryCause::Created))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(h.work_rx.try_recv().is_err(), "still inside the window");

        h.events_tx
            .send(event("/inv/a.pdf", DiscoveryCause::Modified))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(h.work_rx.try_recv().is_err(), "second event reset the timer");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.work_rx.try_recv().is_ok(), "window finally expired");
        h.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_paths_debounce_independently() {
        let mut h = start(5);
        h.fs.add_file("/inv/a.pdf", b"a".to_vec());
        h.fs.add_file("/inv/b.pdf", b"b".to_vec());

        h.events_tx
            .send(event("/inv/a.pdf", DiscoveryCause::Created))
            .await
            .unwrap();
        h.events_tx
            .send(event("/inv/b.pdf", DiscoveryCause::Created))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let mut paths = vec![
            h.work_rx.recv().await.unwrap().path,
            h.work_rx.recv().await.unwrap().path,
        ];
        paths.sort();
        assert_eq!(
            paths,
            vec![PathBuf::from("/inv/a.pdf"), PathBuf::from("/inv/b.pdf")]
        );
        h.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_records_are_skipped_as_duplicates() {
        let mut h = start(1);
        h.fs.add_file("/inv/a.pdf", b"x".to_vec());

        // Drive the record to a terminal state first.
        let record = h.ledger.register(Path::new("/inv/a.pdf")).await.unwrap().record;
        let hash = record.content_hash;
        h.ledger
            .transition(&hash, FileState::Discovered, FileState::Skipped, None)
            .unwrap();

        h.events_tx
            .send(event("/inv/a.pdf", DiscoveryCause::Modified))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(h.work_rx.try_recv().is_err());
        assert_eq!(h.metrics.snapshot()["duplicates_skipped"], 1);
        h.token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_records_are_requeued_not_skipped() {
        let mut h = start(1);
        h.fs.add_file("/inv/a.pdf", b"x".to_vec());

        let record = h.ledger.register(Path::new("/inv/a.pdf")).await.unwrap().record;
        let hash = record.content_hash;
        h.ledger
            .transition(&hash, FileState::Discovered, FileState::Queued, None)
            .unwrap();
        h.ledger
            .transition(&hash, FileState::Queued, FileState::Parsing, None)
            .unwrap();
        h.ledger
            .transition(&hash, FileState::Parsing, FileState::Failed, Some("err".into()))
            .unwrap();

        h.events_tx
            .send(event("/inv/a.pdf", DiscoveryCause::Modified))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(h.work_rx.try_recv().is_ok(), "failed records re-enter the queue");
        h.token.cancel();
    }
}
