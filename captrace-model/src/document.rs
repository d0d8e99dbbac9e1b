use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};

use crate::ids::{DocId, FundId, InvestorId};

/// Classified document type.
///
/// Ordering of the variants matters for tie-breaking: more specific types
/// come first, so a deterministic classification tie resolves to the most
/// specific candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    CapitalAccountStatement,
    CapitalCallNotice,
    DistributionNotice,
    QuarterlyReport,
    AnnualReport,
    Subscription,
    Lpa,
    Ppm,
    Other,
}

impl DocType {
    pub const ALL: [DocType; 9] = [
        DocType::CapitalAccountStatement,
        DocType::CapitalCallNotice,
        DocType::DistributionNotice,
        DocType::QuarterlyReport,
        DocType::AnnualReport,
        DocType::Subscription,
        DocType::Lpa,
        DocType::Ppm,
        DocType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocType::CapitalAccountStatement => "capital_account_statement",
            DocType::CapitalCallNotice => "capital_call_notice",
            DocType::DistributionNotice => "distribution_notice",
            DocType::QuarterlyReport => "quarterly_report",
            DocType::AnnualReport => "annual_report",
            DocType::Subscription => "subscription",
            DocType::Lpa => "lpa",
            DocType::Ppm => "ppm",
            DocType::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        DocType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == raw)
    }

    /// Lower rank wins deterministic classification ties.
    pub fn specificity_rank(self) -> u8 {
        DocType::ALL
            .iter()
            .position(|ty| *ty == self)
            .unwrap_or(DocType::ALL.len()) as u8
    }

    /// Types whose facts are structured enough to synthesize a canonical
    /// retrieval chunk rather than splitting by page.
    pub fn has_structured_facts(self) -> bool {
        matches!(self, DocType::CapitalAccountStatement)
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of handing a document's chunks to the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Pending,
    Completed,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Completed => "completed",
            EmbeddingStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(EmbeddingStatus::Pending),
            "completed" => Some(EmbeddingStatus::Completed),
            "failed" => Some(EmbeddingStatus::Failed),
            _ => None,
        }
    }
}

/// A classified, persisted document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Document {
    pub doc_id: DocId,
    pub doc_type: DocType,
    pub classification_confidence: f64,
    pub source_path: PathBuf,
    pub content_hash: String,
    pub investor_ref: InvestorId,
    pub fund_ref: Option<FundId>,
    pub as_of_date: Option<NaiveDate>,
    pub overall_confidence: f64,
    pub embedding_status: EmbeddingStatus,
    pub chunk_count: i32,
    pub extraction_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_type_round_trips_through_strings() {
        for ty in DocType::ALL {
            assert_eq!(DocType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(DocType::parse("bogus"), None);
    }

    #[test]
    fn cas_is_more_specific_than_quarterly_report() {
        assert!(
            DocType::CapitalAccountStatement.specificity_rank()
                < DocType::QuarterlyReport.specificity_rank()
        );
    }
}
