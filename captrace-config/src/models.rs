use std::path::PathBuf;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

fn default_extensions() -> Vec<String> {
    vec![".pdf".into(), ".xlsx".into(), ".xls".into(), ".csv".into()]
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_debounce_seconds() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_work_queue_capacity() -> usize {
    1024
}

fn default_reporting_currency() -> String {
    "EUR".into()
}

fn default_rescan_cron() -> String {
    // Six-field expression (with seconds): daily sweep at 02:30.
    "0 30 2 * * *".into()
}

fn default_classification_min_confidence() -> f64 {
    0.3
}

/// One watched investor root. The directory tree below `path` belongs to the
/// investor identified by `investor_code`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RootConfig {
    pub path: PathBuf,
    pub investor_code: String,
}

/// Numeric allowances used by extraction validation and reconciliation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tolerances {
    /// Relative NAV tolerance (fraction, 0.001 = 0.1%).
    pub nav_pct: f64,
    /// Absolute NAV tolerance in currency units.
    pub nav_abs: f64,
    /// Relative commitment tolerance.
    pub commitment_pct: f64,
    /// Absolute commitment tolerance in currency units.
    pub commitment_abs: f64,
    /// IRR tolerance in percentage points (fraction, 0.001 = 0.1 pp).
    pub irr_pp: f64,
    /// Absolute tolerance for MOIC/TVPI/DPI/RVPI comparisons.
    pub multiple_abs: f64,
    /// Allowed |TVPI - (DPI + RVPI)|.
    pub tvpi_identity: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            nav_pct: 0.001,
            nav_abs: 100.0,
            commitment_pct: 0.001,
            commitment_abs: 1.0,
            irr_pp: 0.001,
            multiple_abs: 0.01,
            tvpi_identity: 0.001,
        }
    }
}

impl Tolerances {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("nav_pct", self.nav_pct),
            ("nav_abs", self.nav_abs),
            ("commitment_pct", self.commitment_pct),
            ("commitment_abs", self.commitment_abs),
            ("irr_pp", self.irr_pp),
            ("multiple_abs", self.multiple_abs),
            ("tvpi_identity", self.tvpi_identity),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("tolerance {name} must be non-negative, got {value}"));
            }
        }
        Ok(())
    }
}

/// Worker-pool sizing per pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub parser_workers: usize,
    pub extractor_workers: usize,
    pub indexer_workers: usize,
    pub reconciliation_workers: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            parser_workers: 4,
            extractor_workers: 4,
            indexer_workers: 4,
            reconciliation_workers: 2,
        }
    }
}

/// LLM capability limits and deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSettings {
    /// Global concurrency cap across all LLM calls.
    pub concurrency: usize,
    /// Token-bucket refill rate.
    pub rate_per_minute: u32,
    /// Seconds allowed for a classification call.
    pub classify_timeout_secs: u64,
    /// Seconds allowed for a field-extraction call.
    pub extract_timeout_secs: u64,
    /// Model name passed to the provider.
    pub model: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            rate_per_minute: 60,
            classify_timeout_secs: 45,
            extract_timeout_secs: 45,
            model: "gpt-4o-mini".into(),
        }
    }
}

/// Per-stage deadlines, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageDeadlines {
    pub parser_secs: u64,
    pub persist_secs: u64,
    pub indexer_secs: u64,
}

impl Default for StageDeadlines {
    fn default() -> Self {
        Self {
            parser_secs: 60,
            persist_secs: 30,
            indexer_secs: 30,
        }
    }
}

/// Top-level pipeline settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Investor roots to watch.
    pub roots: Vec<RootConfig>,
    /// Extensions (with leading dot) accepted by discovery.
    pub supported_extensions: Vec<String>,
    /// Files larger than this are dropped with a counter increment.
    pub max_file_size_mb: u64,
    /// Per-path debounce window for filesystem events.
    pub debounce_seconds: u64,
    /// Attempts before a Failed ledger entry becomes terminal.
    pub max_attempts: u32,
    /// Bound of the work channel between debouncer and parser pool.
    pub work_queue_capacity: usize,
    pub workers: WorkerSettings,
    pub deadlines: StageDeadlines,
    pub tolerances: Tolerances,
    /// ISO-4217 code unknown currencies fall back to.
    pub reporting_currency: String,
    /// Six-field cron expression for periodic rescans.
    pub rescan_cron: String,
    /// Classifications below this confidence persist as `other` with a
    /// medium-severity audit entry.
    pub classification_min_confidence: f64,
    pub llm: LlmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            supported_extensions: default_extensions(),
            max_file_size_mb: default_max_file_size_mb(),
            debounce_seconds: default_debounce_seconds(),
            max_attempts: default_max_attempts(),
            work_queue_capacity: default_work_queue_capacity(),
            workers: WorkerSettings::default(),
            deadlines: StageDeadlines::default(),
            tolerances: Tolerances::default(),
            reporting_currency: default_reporting_currency(),
            rescan_cron: default_rescan_cron(),
            classification_min_confidence: default_classification_min_confidence(),
            llm: LlmSettings::default(),
        }
    }
}

impl Settings {
    /// Maximum accepted file size in bytes. A file exactly at the limit is
    /// accepted; one byte over is rejected.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Whether a path's extension is accepted by discovery.
    pub fn is_supported_extension(&self, path: &std::path::Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let dotted = format!(".{}", ext.to_ascii_lowercase());
        self.supported_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&dotted))
    }

    /// Resolve the investor code owning `path`, if any configured root is a
    /// prefix of it.
    pub fn investor_for_path(&self, path: &std::path::Path) -> Option<&RootConfig> {
        self.roots
            .iter()
            .filter(|root| path.starts_with(&root.path))
            .max_by_key(|root| root.path.components().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn extension_check_is_case_insensitive() {
        let settings = Settings::default();
        assert!(settings.is_supported_extension(Path::new("/a/report.PDF")));
        assert!(settings.is_supported_extension(Path::new("/a/book.xlsx")));
        assert!(!settings.is_supported_extension(Path::new("/a/notes.txt")));
        assert!(!settings.is_supported_extension(Path::new("/a/noext")));
    }

    #[test]
    fn longest_root_prefix_wins() {
        let mut settings = Settings::default();
        settings.roots = vec![
            RootConfig {
                path: PathBuf::from("/data"),
                investor_code: "outer".into(),
            },
            RootConfig {
                path: PathBuf::from("/data/nested"),
                investor_code: "inner".into(),
            },
        ];
        let hit = settings
            .investor_for_path(Path::new("/data/nested/fund/q1.pdf"))
            .unwrap();
        assert_eq!(hit.investor_code, "inner");
    }

    #[test]
    fn size_boundary_is_inclusive() {
        let settings = Settings::default();
        assert_eq!(settings.max_file_size_bytes(), 100 * 1024 * 1024);
    }
}
