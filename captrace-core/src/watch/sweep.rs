use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use captrace_config::Settings;

use crate::fs::FileSystem;
use crate::metrics::Metrics;
use crate::watch::{admit_file, is_pruned_dir, DiscoveryCause, DiscoveryEvent};

/// Counters for one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub emitted: u64,
    pub dropped: u64,
    pub unreadable_dirs: u64,
}

/// Recursive walker over the configured roots. Runs once at startup and on
/// every rescan tick; emits supported files into the shared discovery
/// channel. Sending into the bounded channel is where backpressure lands:
/// a full pipeline pauses the sweep mid-walk.
pub struct Sweeper {
    settings: Arc<Settings>,
    fs: Arc<dyn FileSystem>,
    metrics: Arc<Metrics>,
    tx: mpsc::Sender<DiscoveryEvent>,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("roots", &self.settings.roots.len())
            .finish()
    }
}

impl Sweeper {
    pub fn new(
        settings: Arc<Settings>,
        fs: Arc<dyn FileSystem>,
        metrics: Arc<Metrics>,
        tx: mpsc::Sender<DiscoveryEvent>,
    ) -> Self {
        Self {
            settings,
            fs,
            metrics,
            tx,
        }
    }

    /// Walk every configured root. An unreadable root is logged and left for
    /// the next tick; it never halts the sweep.
    pub async fn sweep_all(&self) -> SweepStats {
        let mut total = SweepStats::default();
        for root in &self.settings.roots {
            match self.sweep_root(&root.path).await {
                Ok(stats) => {
                    info!(
                        root = %root.path.display(),
                        emitted = stats.emitted,
                        dropped = stats.dropped,
                        "sweep finished"
                    );
                    total.emitted += stats.emitted;
                    total.dropped += stats.dropped;
                    total.unreadable_dirs += stats.unreadable_dirs;
                }
                Err(err) => {
                    warn!(root = %root.path.display(), error = %err, "root unreadable; retrying next tick");
                    total.unreadable_dirs += 1;
                }
            }
        }
        total
    }

    /// Walk a single root, depth-first.
    pub async fn sweep_root(&self, root: &Path) -> Result<SweepStats, String> {
        if !self.fs.path_exists(root).await {
            return Err(format!("{} does not exist", root.display()));
        }

        let mut stats = SweepStats::default();
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let mut entries = match self.fs.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    // Only the root bubbles an error; inner directories are
                    // skipped so one bad permission bit cannot hide the rest
                    // of the tree.
                    if dir == root {
                        return Err(err);
                    }
                    warn!(dir = %dir.display(), error = %err, "skipping unreadable directory");
                    stats.unreadable_dirs += 1;
                    continue;
                }
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
                let md = match self.fs.metadata(&entry).await {
                    Ok(md) => md,
                    Err(err) => {
                        debug!(path = %entry.display(), error = %err, "metadata failed");
                        continue;
                    }
                };
                if md.is_dir {
                    if is_pruned_dir(&entry) {
                        debug!(dir = %entry.display(), "pruned excluded directory");
                        continue;
                    }
                    stack.push(entry);
                    continue;
                }
                if !md.is_file {
                    continue;
                }
                if admit_file(&self.settings, &self.fs, &self.metrics, &entry, Some(md.len))
                    .await
                {
                    Metrics::incr(&self.metrics.discovered);
                    stats.emitted += 1;
                    if self
                        .tx
                        .send(DiscoveryEvent::new(entry, DiscoveryCause::Sweep))
                        .await
                        .is_err()
                    {
                        // Receiver gone: the pipeline is shutting down.
                        return Ok(stats);
                    }
                } else {
                    stats.dropped += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use captrace_config::{RootConfig, Settings};
    use std::path::PathBuf;

    fn settings(root: &str) -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.roots = vec![RootConfig {
            path: PathBuf::from(root),
            investor_code: "test".into(),
        }];
        Arc::new(settings)
    }

    fn sweeper(
        settings: Arc<Settings>,
        fs: Arc<MemoryFs>,
    ) -> (Sweeper, mpsc::Receiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Sweeper::new(settings, fs, Arc::new(Metrics::new()), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn emits_supported_files_recursively() {
        let fs = Arc::new(MemoryFs::new());
        fs.add_file("/inv/fund_a/q1/statement.pdf", b"pdf".to_vec());
        fs.add_file("/inv/fund_a/book.xlsx", b"xlsx".to_vec());
        fs.add_file("/inv/fund_a/notes.txt", b"txt".to_vec());
        let (sweeper, mut rx) = sweeper(settings("/inv"), fs);

        let stats = sweeper.sweep_root(Path::new("/inv")).await.unwrap();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.dropped, 1);

        let mut seen = vec![];
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(ev.cause, DiscoveryCause::Sweep);
            seen.push(ev.path);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn prunes_bang_directories() {
        let fs = Arc::new(MemoryFs::new());
        fs.add_file("/inv/current/a.pdf", b"x".to_vec());
        fs.add_file("/inv/!old/b.pdf", b"x".to_vec());
        let (sweeper, mut rx) = sweeper(settings("/inv"), fs);

        let stats = sweeper.sweep_root(Path::new("/inv")).await.unwrap();
        assert_eq!(stats.emitted, 1);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.path, PathBuf::from("/inv/current/a.pdf"));
    }

    #[tokio::test]
    async fn oversize_files_are_dropped_with_counter() {
        let fs = Arc::new(MemoryFs::new());
        let mut settings = Settings::default();
        settings.roots = vec![RootConfig {
            path: PathBuf::from("/inv"),
            investor_code: "test".into(),
        }];
        settings.max_file_size_mb = 0; // every non-empty file is oversize
        fs.add_file("/inv/huge.pdf", vec![0u8; 10]);
        let metrics = Arc::new(Metrics::new());
        let (tx, mut rx) = mpsc::channel(8);
        let sweeper = Sweeper::new(Arc::new(settings), fs, metrics.clone(), tx);

        let stats = sweeper.sweep_root(Path::new("/inv")).await.unwrap();
        assert_eq!(stats.emitted, 0);
        assert_eq!(stats.dropped, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot()["oversize_dropped"], 1);
    }

    #[tokio::test]
    async fn missing_root_is_an_error_not_a_panic() {
        let fs = Arc::new(MemoryFs::new());
        let (sweeper, _rx) = sweeper(settings("/nope"), fs);
        assert!(sweeper.sweep_root(Path::new("/nope")).await.is_err());
    }
}
