//! Discovery through debouncing over an in-memory filesystem: sweep, event
//! coalescing, ledger-backed duplicate suppression.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use captrace_config::{RootConfig, Settings};
use captrace_core::fs::MemoryFs;
use captrace_core::ledger::FileLedger;
use captrace_core::metrics::Metrics;
use captrace_core::queue::{Debouncer, WorkItem};
use captrace_core::watch::{DiscoveryCause, DiscoveryEvent, Sweeper};
use captrace_model::FileState;

fn settings() -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.roots = vec![RootConfig {
        path: PathBuf::from("/inv"),
        investor_code: "brainweb".into(),
    }];
    Arc::new(settings)
}

struct Rig {
    fs: Arc<MemoryFs>,
    ledger: Arc<FileLedger>,
    metrics: Arc<Metrics>,
    settings: Arc<Settings>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    work_rx: mpsc::Receiver<WorkItem>,
    token: CancellationToken,
}

/// Wire sweeper-style discovery into a real debouncer with a 1s window.
fn rig() -> Rig {
    let fs = Arc::new(MemoryFs::new());
    let ledger = Arc::new(FileLedger::new(fs.clone(), 3));
    let metrics = Arc::new(Metrics::new());
    let settings = settings();
    let (events_tx, events_rx) = mpsc::channel(128);
    let (work_tx, work_rx) = mpsc::channel(128);
    let token = CancellationToken::new();

    let debouncer = Debouncer::new(
        Duration::from_secs(1),
        1024,
        ledger.clone(),
        fs.clone(),
        metrics.clone(),
        work_tx,
    );
    tokio::spawn(debouncer.run(events_rx, token.clone()));

    Rig {
        fs,
        ledger,
        metrics,
        settings,
        events_tx,
        work_rx,
        token,
    }
}

#[tokio::test(start_paused = true)]
async fn sweep_feeds_the_debouncer_into_work_items() {
    let mut rig = rig();
    rig.fs.add_file("/inv/alpha/cas_q4.pdf", b"pdf-bytes".to_vec());
    rig.fs.add_file("/inv/alpha/book.xlsx", b"xlsx-bytes".to_vec());
    rig.fs.add_file("/inv/!archive/old.pdf", b"old".to_vec());
    rig.fs.add_file("/inv/alpha/notes.txt", b"txt".to_vec());

    let sweeper = Sweeper::new(
        rig.settings.clone(),
        rig.fs.clone(),
        rig.metrics.clone(),
        rig.events_tx.clone(),
    );
    let stats = sweeper.sweep_root(Path::new("/inv")).await.unwrap();
    assert_eq!(stats.emitted, 2, "pruned and unsupported files stay out");

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut got = vec![
        rig.work_rx.recv().await.unwrap().path,
        rig.work_rx.recv().await.unwrap().path,
    ];
    got.sort();
    assert_eq!(
        got,
        vec![
            PathBuf::from("/inv/alpha/book.xlsx"),
            PathBuf::from("/inv/alpha/cas_q4.pdf"),
        ]
    );
    assert!(rig.work_rx.try_recv().is_err());
    rig.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn second_sweep_is_suppressed_once_records_are_terminal() {
    let mut rig = rig();
    rig.fs.add_file("/inv/a.pdf", b"payload".to_vec());

    let sweeper = Sweeper::new(
        rig.settings.clone(),
        rig.fs.clone(),
        rig.metrics.clone(),
        rig.events_tx.clone(),
    );

    // First pass: the file flows through.
    sweeper.sweep_root(Path::new("/inv")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rig.work_rx.recv().await.is_some());

    // Simulate the pipeline finishing with this content.
    let record = rig.ledger.register(Path::new("/inv/a.pdf")).await.unwrap().record;
    let hash = record.content_hash;
    rig.ledger
        .transition(&hash, FileState::Discovered, FileState::Queued, None)
        .unwrap();
    rig.ledger
        .transition(&hash, FileState::Queued, FileState::Parsing, None)
        .unwrap();
    rig.ledger
        .transition(&hash, FileState::Parsing, FileState::Extracting, None)
        .unwrap();
    rig.ledger
        .transition(&hash, FileState::Extracting, FileState::Persisted, None)
        .unwrap();
    rig.ledger
        .transition(&hash, FileState::Persisted, FileState::Embedded, None)
        .unwrap();

    // Second pass: same bytes, same fingerprint, no new work.
    sweeper.sweep_root(Path::new("/inv")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rig.work_rx.try_recv().is_err());
    assert_eq!(rig.metrics.snapshot()["duplicates_skipped"], 1);
    rig.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn modified_content_is_rescheduled() {
    let mut rig = rig();
    rig.fs.add_file("/inv/a.pdf", b"v1".to_vec());

    // Process v1 to a terminal state.
    let record = rig.ledger.register(Path::new("/inv/a.pdf")).await.unwrap().record;
    rig.ledger
        .transition(&record.content_hash, FileState::Discovered, FileState::Skipped, None)
        .unwrap();

    // The file changes on disk: new mtime and size, stale fingerprint.
    rig.fs.touch("/inv/a.pdf", b"v2 with more bytes".to_vec());
    rig.events_tx
        .send(DiscoveryEvent::new(
            PathBuf::from("/inv/a.pdf"),
            DiscoveryCause::Modified,
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(
        rig.work_rx.try_recv().is_ok(),
        "changed content must be re-enqueued"
    );
    rig.token.cancel();
}
