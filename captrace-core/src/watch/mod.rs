//! Discovery: recursive sweeps plus filesystem-event subscriptions, both
//! feeding one outbound channel of [`DiscoveryEvent`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use captrace_config::Settings;

use crate::fs::FileSystem;
use crate::metrics::Metrics;

mod events;
mod sweep;

pub use events::EventSource;
pub use sweep::{SweepStats, Sweeper};

/// What produced a discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryCause {
    Sweep,
    Created,
    Modified,
}

impl DiscoveryCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryCause::Sweep => "sweep",
            DiscoveryCause::Created => "created",
            DiscoveryCause::Modified => "modified",
        }
    }
}

/// A candidate file surfaced by discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub path: PathBuf,
    pub cause: DiscoveryCause,
    pub observed_at: DateTime<Utc>,
}

impl DiscoveryEvent {
    pub fn new(path: PathBuf, cause: DiscoveryCause) -> Self {
        Self {
            path,
            cause,
            observed_at: Utc::now(),
        }
    }
}

/// Shared admission filter for both discovery modes. Returns true when the
/// file should be emitted; drops increment the matching counter.
pub(crate) async fn admit_file(
    settings: &Settings,
    fs: &Arc<dyn FileSystem>,
    metrics: &Metrics,
    path: &Path,
    size_hint: Option<u64>,
) -> bool {
    if !settings.is_supported_extension(path) {
        Metrics::incr(&metrics.unsupported_dropped);
        return false;
    }
    let size = match size_hint {
        Some(size) => size,
        None => match fs.metadata(path).await {
            Ok(md) if md.is_file => md.len,
            _ => return false,
        },
    };
    // Exactly at the limit is accepted; one byte over is rejected.
    if size > settings.max_file_size_bytes() {
        Metrics::incr(&metrics.oversize_dropped);
        return false;
    }
    true
}

/// Directories whose name starts with `!` are excluded archives by operator
/// convention.
pub(crate) fn is_pruned_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('!'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bang_prefix_prunes() {
        assert!(is_pruned_dir(Path::new("/data/!archive")));
        assert!(!is_pruned_dir(Path::new("/data/current")));
    }
}
