use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide counter registry surfaced through `Engine::status`.
///
/// Counters only move forward; the queue-depth gauge tracks the number of
/// work items currently between the debouncer and the parser pool.
#[derive(Debug, Default)]
pub struct Metrics {
    pub discovered: AtomicU64,
    pub unsupported_dropped: AtomicU64,
    pub oversize_dropped: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub queued: AtomicU64,
    pub parsed: AtomicU64,
    pub parse_failures: AtomicU64,
    pub extracted: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub indexed: AtomicU64,
    pub index_failures: AtomicU64,
    pub llm_calls: AtomicU64,
    pub llm_retries: AtomicU64,
    pub watcher_resubscribes: AtomicU64,
    pub reconciliation_runs: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub queue_depth: AtomicI64,
    pub busy_workers: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn gauge_add(gauge: &AtomicI64, delta: i64) {
        gauge.fetch_add(delta, Ordering::Relaxed);
    }

    /// Point-in-time snapshot for status reporting.
    pub fn snapshot(&self) -> BTreeMap<&'static str, i64> {
        let mut out = BTreeMap::new();
        out.insert("discovered", self.discovered.load(Ordering::Relaxed) as i64);
        out.insert(
            "unsupported_dropped",
            self.unsupported_dropped.load(Ordering::Relaxed) as i64,
        );
        out.insert(
            "oversize_dropped",
            self.oversize_dropped.load(Ordering::Relaxed) as i64,
        );
        out.insert(
            "duplicates_skipped",
            self.duplicates_skipped.load(Ordering::Relaxed) as i64,
        );
        out.insert("queued", self.queued.load(Ordering::Relaxed) as i64);
        out.insert("parsed", self.parsed.load(Ordering::Relaxed) as i64);
        out.insert(
            "parse_failures",
            self.parse_failures.load(Ordering::Relaxed) as i64,
        );
        out.insert("extracted", self.extracted.load(Ordering::Relaxed) as i64);
        out.insert("persisted", self.persisted.load(Ordering::Relaxed) as i64);
        out.insert(
            "persist_failures",
            self.persist_failures.load(Ordering::Relaxed) as i64,
        );
        out.insert("indexed", self.indexed.load(Ordering::Relaxed) as i64);
        out.insert(
            "index_failures",
            self.index_failures.load(Ordering::Relaxed) as i64,
        );
        out.insert("llm_calls", self.llm_calls.load(Ordering::Relaxed) as i64);
        out.insert("llm_retries", self.llm_retries.load(Ordering::Relaxed) as i64);
        out.insert(
            "watcher_resubscribes",
            self.watcher_resubscribes.load(Ordering::Relaxed) as i64,
        );
        out.insert(
            "reconciliation_runs",
            self.reconciliation_runs.load(Ordering::Relaxed) as i64,
        );
        out.insert(
            "retries_scheduled",
            self.retries_scheduled.load(Ordering::Relaxed) as i64,
        );
        out.insert("queue_depth", self.queue_depth.load(Ordering::Relaxed));
        out.insert("busy_workers", self.busy_workers.load(Ordering::Relaxed));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.oversize_dropped);
        Metrics::incr(&metrics.oversize_dropped);
        Metrics::gauge_add(&metrics.queue_depth, 3);
        Metrics::gauge_add(&metrics.queue_depth, -1);
        let snap = metrics.snapshot();
        assert_eq!(snap["oversize_dropped"], 2);
        assert_eq!(snap["queue_depth"], 2);
    }
}
