use chrono::{DateTime, Utc};

use crate::ids::DocId;

/// Which extraction method produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorTag {
    Anchor,
    Table,
    Llm,
    Filename,
    Default,
}

impl ExtractorTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractorTag::Anchor => "anchor",
            ExtractorTag::Table => "table",
            ExtractorTag::Llm => "llm",
            ExtractorTag::Filename => "filename",
            ExtractorTag::Default => "default",
        }
    }
}

/// Validation outcome attached to an extracted field or a fact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Consistent,
    Inconsistent,
    Unchecked,
    Missing,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStatus::Consistent => "consistent",
            ValidationStatus::Inconsistent => "inconsistent",
            ValidationStatus::Unchecked => "unchecked",
            ValidationStatus::Missing => "missing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "consistent" => Some(ValidationStatus::Consistent),
            "inconsistent" => Some(ValidationStatus::Inconsistent),
            "unchecked" => Some(ValidationStatus::Unchecked),
            "missing" => Some(ValidationStatus::Missing),
            _ => None,
        }
    }
}

/// Severity attached to audit entries that flag data-quality concerns.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Low => "low",
            AuditSeverity::Medium => "medium",
            AuditSeverity::High => "high",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// Immutable record of one extractor's attempt to populate a single field.
/// Overrides append a new row; existing rows are never rewritten.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldAudit {
    pub doc_id: DocId,
    pub field_name: String,
    pub raw_value: Option<String>,
    pub normalized_value: Option<String>,
    pub extractor_tag: ExtractorTag,
    pub confidence: f64,
    pub validation_status: ValidationStatus,
    pub severity: AuditSeverity,
    pub note: Option<String>,
    pub is_override: bool,
    pub created_at: DateTime<Utc>,
}

impl FieldAudit {
    pub fn new(
        doc_id: DocId,
        field_name: impl Into<String>,
        extractor_tag: ExtractorTag,
        confidence: f64,
    ) -> Self {
        Self {
            doc_id,
            field_name: field_name.into(),
            raw_value: None,
            normalized_value: None,
            extractor_tag,
            confidence: confidence.clamp(0.0, 1.0),
            validation_status: ValidationStatus::Unchecked,
            severity: AuditSeverity::Info,
            note: None,
            is_override: false,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped_to_unit_interval() {
        let doc = DocId::from_trusted("aaaaaaaaaaaaaaaa");
        let audit = FieldAudit::new(doc.clone(), "ending_balance", ExtractorTag::Anchor, 1.7);
        assert_eq!(audit.confidence, 1.0);
        let audit = FieldAudit::new(doc, "ending_balance", ExtractorTag::Llm, -0.2);
        assert_eq!(audit.confidence, 0.0);
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(AuditSeverity::Critical > AuditSeverity::Medium);
        assert!(AuditSeverity::Low > AuditSeverity::Info);
    }
}
