use chrono::{DateTime, NaiveDate, Utc};

use crate::ids::FundId;

/// The four reconciliation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationType {
    Nav,
    Cashflow,
    Performance,
    Commitment,
}

impl ReconciliationType {
    pub const ALL: [ReconciliationType; 4] = [
        ReconciliationType::Nav,
        ReconciliationType::Cashflow,
        ReconciliationType::Performance,
        ReconciliationType::Commitment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReconciliationType::Nav => "nav",
            ReconciliationType::Cashflow => "cashflow",
            ReconciliationType::Performance => "performance",
            ReconciliationType::Commitment => "commitment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "nav" => Some(ReconciliationType::Nav),
            "cashflow" => Some(ReconciliationType::Cashflow),
            "performance" => Some(ReconciliationType::Performance),
            "commitment" => Some(ReconciliationType::Commitment),
            _ => None,
        }
    }
}

/// Severity ladder for findings. Ordered so `max` picks the worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Pass/warn/fail verdict of one check.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warning => "warning",
            CheckStatus::Fail => "fail",
        }
    }
}

/// One aggregated finding produced by a reconciliation run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReconciliationFinding {
    pub fund_ref: FundId,
    pub as_of_date: NaiveDate,
    pub reconciliation_type: ReconciliationType,
    pub severity: Severity,
    pub status: CheckStatus,
    pub details: serde_json::Value,
    pub recommendations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of one reconciliation pass over `(fund_ref, as_of_date)`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReconciliationRun {
    pub fund_ref: FundId,
    pub as_of_date: NaiveDate,
    pub findings: Vec<ReconciliationFinding>,
    /// Worst severity among findings, `Info` when the run is clean.
    pub overall_severity: Severity,
    /// Worst check status among findings.
    pub overall_status: CheckStatus,
    /// Critical/Fail findings request operator review.
    pub needs_review: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconciliationRun {
    /// Aggregate a set of findings into the run verdict.
    pub fn from_findings(
        fund_ref: FundId,
        as_of_date: NaiveDate,
        findings: Vec<ReconciliationFinding>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let overall_severity = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Info);
        let overall_status = findings
            .iter()
            .map(|f| f.status)
            .max()
            .unwrap_or(CheckStatus::Pass);
        let needs_review = overall_severity >= Severity::Critical
            || overall_status == CheckStatus::Fail;
        Self {
            fund_ref,
            as_of_date,
            findings,
            overall_severity,
            overall_status,
            needs_review,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity, status: CheckStatus) -> ReconciliationFinding {
        ReconciliationFinding {
            fund_ref: FundId::new(),
            as_of_date: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            reconciliation_type: ReconciliationType::Nav,
            severity,
            status,
            details: serde_json::json!({}),
            recommendations: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn run_status_is_worst_finding() {
        let run = ReconciliationRun::from_findings(
            FundId::new(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            vec![
                finding(Severity::Low, CheckStatus::Pass),
                finding(Severity::High, CheckStatus::Warning),
                finding(Severity::Medium, CheckStatus::Pass),
            ],
            Utc::now(),
        );
        assert_eq!(run.overall_severity, Severity::High);
        assert_eq!(run.overall_status, CheckStatus::Warning);
        assert!(!run.needs_review);
    }

    #[test]
    fn fail_findings_request_review() {
        let run = ReconciliationRun::from_findings(
            FundId::new(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            vec![finding(Severity::Medium, CheckStatus::Fail)],
            Utc::now(),
        );
        assert!(run.needs_review);
    }

    #[test]
    fn empty_run_is_clean() {
        let run = ReconciliationRun::from_findings(
            FundId::new(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            vec![],
            Utc::now(),
        );
        assert_eq!(run.overall_severity, Severity::Info);
        assert_eq!(run.overall_status, CheckStatus::Pass);
        assert!(!run.needs_review);
    }
}
