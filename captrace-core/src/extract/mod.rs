//! Multi-method field extraction with per-field confidence and audit.
//!
//! For every catalog field the chain runs three extractors - anchors over
//! text, table alignment, and the LLM matcher. The highest-priority success
//! wins, but the others still serve as corroboration: two extractors
//! agreeing within tolerance lift the field to 0.95.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, warn};

use captrace_model::{
    AuditSeverity, DocId, DocType, ExtractorTag, FieldAudit, ValidationStatus,
};

use crate::llm::LlmClient;
use crate::metrics::Metrics;
use crate::parse::ParsedDoc;

pub mod anchors;
pub mod catalog;
pub mod dates;
pub mod llm_extract;
pub mod numeric;
pub mod table_extract;
pub mod validate;

use catalog::{catalog_for, FieldKind, FieldSpec};

/// Confidence for dates recovered from filename tokens.
const FILENAME_DATE_CONFIDENCE: f64 = 0.6;
/// Fields corroborated by a second extractor are lifted to at least this.
const CORROBORATED_FLOOR: f64 = 0.95;

/// A typed, normalized field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Money(f64),
    Date(NaiveDate),
    Percent(f64),
    Multiple(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_money(&self) -> Option<f64> {
        match self {
            FieldValue::Money(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_percent(&self) -> Option<f64> {
        match self {
            FieldValue::Percent(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_multiple(&self) -> Option<f64> {
        match self {
            FieldValue::Multiple(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical rendering for the audit trail.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Money(v) => format!("{v:.2}"),
            FieldValue::Date(d) => d.to_string(),
            FieldValue::Percent(v) => format!("{v:.6}"),
            FieldValue::Multiple(v) => format!("{v:.4}"),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

/// One extractor's proposal for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub field: &'static str,
    pub raw: String,
    pub value: FieldValue,
    pub tag: ExtractorTag,
    pub confidence: f64,
}

/// The winning value for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedField {
    pub value: FieldValue,
    pub raw: String,
    pub tag: ExtractorTag,
    pub confidence: f64,
    pub corroborated: bool,
}

/// Output of the chain for one document.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub doc_type: DocType,
    pub fields: BTreeMap<&'static str, ExtractedField>,
    pub audits: Vec<FieldAudit>,
    pub violations: Vec<validate::Violation>,
    pub validation_status: ValidationStatus,
    /// True when at least one required catalog field is missing.
    pub incomplete: bool,
    /// Weighted mean of field confidences (required fields weigh double).
    pub overall_confidence: f64,
}

impl Extraction {
    pub fn money(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|f| f.value.as_money())
    }

    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        self.fields.get(name).and_then(|f| f.value.as_date())
    }

    pub fn percent(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|f| f.value.as_percent())
    }

    pub fn multiple(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|f| f.value.as_multiple())
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|f| f.value.as_text())
    }
}

/// The extraction engine.
pub struct ExtractorChain {
    llm: Arc<dyn LlmClient>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for ExtractorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorChain").finish()
    }
}

impl ExtractorChain {
    pub fn new(llm: Arc<dyn LlmClient>, metrics: Arc<Metrics>) -> Self {
        Self { llm, metrics }
    }

    pub async fn run(
        &self,
        doc_id: &DocId,
        doc_type: DocType,
        parsed: &ParsedDoc,
        filename: &str,
    ) -> Extraction {
        let catalog = catalog_for(doc_type);
        let text = parsed.full_text();

        let anchor_candidates = anchors::extract(catalog, &text);
        let table_candidates = table_extract::extract(catalog, &parsed.tables);

        Metrics::incr(&self.metrics.llm_calls);
        let llm_candidates = match llm_extract::extract(
            self.llm.as_ref(),
            doc_type,
            catalog,
            parsed,
            filename,
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                // A dead provider degrades extraction, it does not fail the
                // document.
                warn!(error = %err, filename, "llm field matcher unavailable");
                Vec::new()
            }
        };

        let mut fields = merge_candidates(
            catalog,
            &[anchor_candidates, table_candidates, llm_candidates],
        );
        let mut audits: Vec<FieldAudit> = Vec::new();

        // Filename fallback for the reporting date.
        let has_date_field = catalog.iter().any(|s| s.name == "as_of_date");
        if has_date_field && !fields.contains_key("as_of_date") {
            if let Some((date, token)) = dates::date_from_filename(filename) {
                debug!(filename, %date, "as_of_date recovered from filename");
                fields.insert(
                    "as_of_date",
                    ExtractedField {
                        value: FieldValue::Date(date),
                        raw: token,
                        tag: ExtractorTag::Filename,
                        confidence: FILENAME_DATE_CONFIDENCE,
                        corroborated: false,
                    },
                );
            }
        }

        // Validation over the numeric view.
        let money_fields: validate::MoneyFields = fields
            .iter()
            .filter_map(|(name, field)| field.value.as_money().map(|v| (*name, v)))
            .collect();
        let mut violations = Vec::new();
        if doc_type == DocType::CapitalAccountStatement {
            violations.extend(validate::check_balance_identity(&money_fields));
            violations.extend(validate::check_commitment_identity(&money_fields));
        }
        violations.extend(validate::check_non_negativity(&money_fields));
        if let Some(date) = fields.get("as_of_date").and_then(|f| f.value.as_date()) {
            violations.extend(validate::check_date_sanity(date));
        }
        let validation_status = validate::overall_status(&violations);

        let inconsistent: std::collections::BTreeSet<&'static str> = violations
            .iter()
            .flat_map(|v| v.fields.iter().copied())
            .collect();

        // One audit row per extracted field.
        for (name, field) in &fields {
            let mut audit = FieldAudit::new(doc_id.clone(), *name, field.tag, field.confidence);
            audit.raw_value = Some(field.raw.clone());
            audit.normalized_value = Some(field.value.render());
            audit.validation_status = if inconsistent.contains(name) {
                ValidationStatus::Inconsistent
            } else {
                ValidationStatus::Consistent
            };
            audit.severity = if inconsistent.contains(name) {
                AuditSeverity::Medium
            } else {
                AuditSeverity::Info
            };
            if field.tag == ExtractorTag::Filename {
                audit.note = Some("recovered from filename".into());
            }
            audits.push(audit);
        }

        // Missing required fields: critical audits, never a hard failure.
        let mut incomplete = false;
        for spec in catalog.iter().filter(|s| s.required) {
            if !fields.contains_key(spec.name) {
                incomplete = true;
                let mut audit =
                    FieldAudit::new(doc_id.clone(), spec.name, ExtractorTag::Default, 0.0);
                audit.validation_status = ValidationStatus::Missing;
                audit.severity = AuditSeverity::Critical;
                audit.note = Some("required field not found by any extractor".into());
                audits.push(audit);
            }
        }

        for violation in &violations {
            debug!(rule = violation.rule, message = %violation.message, "validation violation");
        }
        Metrics::incr(&self.metrics.extracted);

        let overall_confidence = weighted_confidence(catalog, &fields);
        Extraction {
            doc_type,
            fields,
            audits,
            violations,
            validation_status,
            incomplete,
            overall_confidence,
        }
    }
}

/// Merge candidate lists by priority (the order of `rounds`): first success
/// wins, later rounds corroborate.
fn merge_candidates(
    catalog: &'static [FieldSpec],
    rounds: &[Vec<Candidate>],
) -> BTreeMap<&'static str, ExtractedField> {
    let mut out = BTreeMap::new();
    for spec in catalog {
        let proposals: Vec<&Candidate> = rounds
            .iter()
            .flat_map(|round| round.iter().filter(|c| c.field == spec.name))
            .collect();
        let Some(winner) = proposals.first() else {
            continue;
        };
        let corroborated = proposals
            .iter()
            .skip(1)
            .any(|other| values_agree(spec.kind, &winner.value, &other.value));
        let confidence = if corroborated {
            let best = proposals
                .iter()
                .map(|c| c.confidence)
                .fold(f64::MIN, f64::max);
            best.max(CORROBORATED_FLOOR)
        } else {
            winner.confidence
        };
        out.insert(
            spec.name,
            ExtractedField {
                value: winner.value.clone(),
                raw: winner.raw.clone(),
                tag: winner.tag,
                confidence: confidence.clamp(0.0, 1.0),
                corroborated,
            },
        );
    }
    out
}

/// Kind-aware agreement test for corroboration.
fn values_agree(kind: FieldKind, a: &FieldValue, b: &FieldValue) -> bool {
    match (kind, a, b) {
        (FieldKind::Money, FieldValue::Money(x), FieldValue::Money(y)) => {
            (x - y).abs() <= (0.001 * x.abs()).max(0.01)
        }
        (FieldKind::Percent, FieldValue::Percent(x), FieldValue::Percent(y)) => {
            (x - y).abs() <= 1e-3
        }
        (FieldKind::Multiple, FieldValue::Multiple(x), FieldValue::Multiple(y)) => {
            (x - y).abs() <= 1e-3
        }
        (FieldKind::Date, FieldValue::Date(x), FieldValue::Date(y)) => x == y,
        (FieldKind::Text, FieldValue::Text(x), FieldValue::Text(y)) => {
            x.eq_ignore_ascii_case(y)
        }
        _ => false,
    }
}

/// Weighted mean of field confidences; required fields weigh double.
fn weighted_confidence(
    catalog: &'static [FieldSpec],
    fields: &BTreeMap<&'static str, ExtractedField>,
) -> f64 {
    let mut weight_sum = 0.0;
    let mut acc = 0.0;
    for spec in catalog {
        if let Some(field) = fields.get(spec.name) {
            let weight = if spec.required { 2.0 } else { 1.0 };
            weight_sum += weight;
            acc += weight * field.confidence;
        }
    }
    if weight_sum == 0.0 {
        0.0
    } else {
        (acc / weight_sum).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::parse::{Page, Table};

    fn doc_id() -> DocId {
        DocId::from_trusted("aaaaaaaaaaaaaaaa")
    }

    fn sample_statement() -> ParsedDoc {
        let text = "\
Capital Account Statement
Fund: Alpha Growth Fund II
Investor: Brainweb Invest GmbH
As of Date: 2023-12-31
Currency: EUR
Beginning Balance: 35,000,000.00
Contributions: 5,000,000.00
Distributions: 4,000,000.00
Management Fees: 250,000.00
Partnership Expenses: 50,000.00
Realized Gain: 1,500,000.00
Unrealized Gain: 3,500,000.00
Ending Balance: 40,700,000.00
Total Commitment: 50,000,000.00
Drawn Commitment: 35,000,000.00
Unfunded Commitment: 15,000,000.00";
        ParsedDoc {
            pages: vec![Page { no: 1, text: text.into() }],
            tables: vec![Table {
                page: 1,
                headers: vec!["Item".into(), "Amount".into()],
                rows: vec![
                    vec!["Beginning Balance".into(), "35,000,000.00".into()],
                    vec!["Ending Balance".into(), "40,700,000.00".into()],
                ],
            }],
            metadata: Default::default(),
        }
    }

    fn chain_with_silent_llm() -> ExtractorChain {
        let mut llm = MockLlmClient::new();
        llm.expect_extract_fields()
            .returning(|_| Err(LlmError::Transient("offline".into())));
        ExtractorChain::new(Arc::new(llm), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn sample_statement_extracts_consistently() {
        let chain = chain_with_silent_llm();
        let extraction = chain
            .run(
                &doc_id(),
                DocType::CapitalAccountStatement,
                &sample_statement(),
                "cas_2023.pdf",
            )
            .await;

        assert_eq!(extraction.money("ending_balance"), Some(40_700_000.0));
        assert_eq!(extraction.money("beginning_balance"), Some(35_000_000.0));
        assert_eq!(extraction.money("contributions_period"), Some(5_000_000.0));
        assert_eq!(extraction.money("unfunded_commitment"), Some(15_000_000.0));
        assert_eq!(
            extraction.date("as_of_date"),
            NaiveDate::from_ymd_opt(2023, 12, 31)
        );
        assert_eq!(extraction.validation_status, ValidationStatus::Consistent);
        assert!(!extraction.incomplete);
        assert!(
            extraction.overall_confidence >= 0.85,
            "confidence was {}",
            extraction.overall_confidence
        );
    }

    #[tokio::test]
    async fn anchor_and_table_agreement_corroborates() {
        let chain = chain_with_silent_llm();
        let extraction = chain
            .run(
                &doc_id(),
                DocType::CapitalAccountStatement,
                &sample_statement(),
                "cas_2023.pdf",
            )
            .await;
        let ending = &extraction.fields["ending_balance"];
        assert!(ending.corroborated);
        assert!(ending.confidence >= 0.95);
        assert_eq!(ending.tag, ExtractorTag::Anchor);
    }

    #[tokio::test]
    async fn missing_date_recovers_from_filename() {
        let chain = chain_with_silent_llm();
        let doc = ParsedDoc {
            pages: vec![Page {
                no: 1,
                text: "Capital Account Statement\nEnding Balance: 1,000,000\nFund: Beta".into(),
            }],
            tables: vec![],
            metadata: Default::default(),
        };
        let extraction = chain
            .run(&doc_id(), DocType::CapitalAccountStatement, &doc, "Beta_Q2 2025.pdf")
            .await;

        assert_eq!(
            extraction.date("as_of_date"),
            NaiveDate::from_ymd_opt(2025, 6, 30)
        );
        let field = &extraction.fields["as_of_date"];
        assert_eq!(field.tag, ExtractorTag::Filename);
        assert!(field.confidence <= 0.7);
        let audit = extraction
            .audits
            .iter()
            .find(|a| a.field_name == "as_of_date")
            .unwrap();
        assert_eq!(audit.note.as_deref(), Some("recovered from filename"));
    }

    #[tokio::test]
    async fn missing_required_fields_mark_incomplete_with_critical_audit() {
        let chain = chain_with_silent_llm();
        let doc = ParsedDoc {
            pages: vec![Page {
                no: 1,
                text: "nothing that looks like a statement".into(),
            }],
            tables: vec![],
            metadata: Default::default(),
        };
        let extraction = chain
            .run(&doc_id(), DocType::CapitalAccountStatement, &doc, "blank.pdf")
            .await;

        assert!(extraction.incomplete);
        let critical: Vec<_> = extraction
            .audits
            .iter()
            .filter(|a| a.severity == AuditSeverity::Critical)
            .collect();
        assert!(critical.iter().any(|a| a.field_name == "ending_balance"));
        assert!(critical.iter().any(|a| a.field_name == "as_of_date"));
    }

    #[tokio::test]
    async fn identity_violation_is_persisted_not_fatal() {
        let chain = chain_with_silent_llm();
        let doc = ParsedDoc {
            pages: vec![Page {
                no: 1,
                text: "Capital Account Statement\nFund: Gamma\nAs of Date: 2023-12-31\n\
                       Beginning Balance: 10,000,000\nContributions: 1,000,000\n\
                       Ending Balance: 20,000,000"
                    .into(),
            }],
            tables: vec![],
            metadata: Default::default(),
        };
        let extraction = chain
            .run(&doc_id(), DocType::CapitalAccountStatement, &doc, "gamma.pdf")
            .await;

        assert_eq!(extraction.validation_status, ValidationStatus::Inconsistent);
        assert!(extraction
            .violations
            .iter()
            .any(|v| v.rule == "balance_identity"));
        // The value still extracted; persistence proceeds.
        assert_eq!(extraction.money("ending_balance"), Some(20_000_000.0));
        let ending_audit = extraction
            .audits
            .iter()
            .find(|a| a.field_name == "ending_balance")
            .unwrap();
        assert_eq!(ending_audit.validation_status, ValidationStatus::Inconsistent);
    }

    #[tokio::test]
    async fn llm_values_fill_gaps_with_capped_confidence() {
        let mut llm = MockLlmClient::new();
        llm.expect_extract_fields().returning(|_| {
            let mut map = serde_json::Map::new();
            map.insert("ending_balance".into(), serde_json::json!(9_999_000.0));
            map.insert("fund_name".into(), serde_json::json!("Delta Fund"));
            map.insert("as_of_date".into(), serde_json::json!("2024-03-31"));
            Ok(map)
        });
        let chain = ExtractorChain::new(Arc::new(llm), Arc::new(Metrics::new()));
        let doc = ParsedDoc {
            pages: vec![Page {
                no: 1,
                text: "an unlabeled scan with no anchors".into(),
            }],
            tables: vec![],
            metadata: Default::default(),
        };
        let extraction = chain
            .run(&doc_id(), DocType::CapitalAccountStatement, &doc, "scan.pdf")
            .await;

        assert_eq!(extraction.money("ending_balance"), Some(9_999_000.0));
        let ending = &extraction.fields["ending_balance"];
        assert_eq!(ending.tag, ExtractorTag::Llm);
        assert!(ending.confidence <= 0.8);
    }
}
