use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use captrace_config::Settings;

use crate::fs::FileSystem;
use crate::metrics::Metrics;
use crate::watch::{admit_file, DiscoveryCause, DiscoveryEvent};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Filesystem-notification half of discovery. Subscribes to created/modified
/// events under every configured root and forwards admitted files into the
/// shared discovery channel. Watcher failures resubscribe with exponential
/// backoff (1s doubling to 30s).
pub struct EventSource {
    settings: Arc<Settings>,
    fs: Arc<dyn FileSystem>,
    metrics: Arc<Metrics>,
    tx: mpsc::Sender<DiscoveryEvent>,
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("roots", &self.settings.roots.len())
            .finish()
    }
}

impl EventSource {
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

    /// Run until shutdown, resubscribing on watcher failure.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = BACKOFF_START;
            loop {
                if token.is_cancelled() {
                    return;
                }
                match self.subscription_round(&token).await {
                    SubscriptionEnd::Shutdown => return,
                    SubscriptionEnd::Healthy => {
                        // At least one event flowed: start fresh next round.
                        backoff = BACKOFF_START;
                    }
                    SubscriptionEnd::Broken => {
                        Metrics::incr(&self.metrics.watcher_resubscribes);
                        warn!(delay = ?backoff, "watch subscription lost; resubscribing");
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        })
    }

    /// One watcher lifetime: subscribe, pump events, return why it ended.
    async fn subscription_round(&self, token: &CancellationToken) -> SubscriptionEnd {
        let (raw_tx, mut raw_rx) =
            mpsc::unbounded_channel::<Result<Event, notify::Error>>();

        let mut watcher: RecommendedWatcher = match notify::recommended_watcher(
            move |res: Result<Event, notify::Error>| {
                // The callback runs on notify's own thread; an unbounded
                // send never blocks it.
                let _ = raw_tx.send(res);
            },
        ) {
            Ok(watcher) => watcher,
            Err(err) => {
                error!(error = %err, "failed to create filesystem watcher");
                return SubscriptionEnd::Broken;
            }
        };

        let mut watched = 0usize;
        for root in &self.settings.roots {
            match watcher.watch(&root.path, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!(root = %root.path.display(), "watching for changes");
                    watched += 1;
                }
                Err(err) => {
                    warn!(root = %root.path.display(), error = %err, "cannot watch root");
                }
            }
        }
        if watched == 0 {
            return SubscriptionEnd::Broken;
        }

        let mut saw_event = false;
        loop {
            tokio::select! {
                _ = token.cancelled() => return SubscriptionEnd::Shutdown,
                msg = raw_rx.recv() => match msg {
                    Some(Ok(event)) => {
                        saw_event = true;
                        self.forward(event).await;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "watcher reported an error");
                        return if saw_event {
                            SubscriptionEnd::Healthy
                        } else {
                            SubscriptionEnd::Broken
                        };
                    }
                    None => {
                        return if saw_event {
                            SubscriptionEnd::Healthy
                        } else {
                            SubscriptionEnd::Broken
                        };
                    }
                }
            }
        }
    }

    async fn forward(&self, event: Event) {
        let cause = match event.kind {
            EventKind::Create(_) => DiscoveryCause::Created,
            EventKind::Modify(_) => DiscoveryCause::Modified,
            _ => return,
        };
        for path in event.paths {
            if admit_file(&self.settings, &self.fs, &self.metrics, &path, None).await {
                Metrics::incr(&self.metrics.discovered);
                debug!(path = %path.display(), cause = cause.as_str(), "file event");
                if self
                    .tx
                    .send(DiscoveryEvent::new(path, cause))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

enum SubscriptionEnd {
    Shutdown,
    Healthy,
    Broken,
}
