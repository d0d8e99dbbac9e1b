//! End-to-end extraction flow over real file bytes: parse, classify,
//! extract. No database or network; the LLM capability is stubbed.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use captrace_core::classify::{Classifier, ClassifyMethod};
use captrace_core::extract::ExtractorChain;
use captrace_core::llm::{
    Classification, FieldExtractionRequest, LlmClient, LlmError,
};
use captrace_core::metrics::Metrics;
use captrace_core::parse::parse_file;
use captrace_model::{DocId, DocType, ValidationStatus};

/// A provider that is never reachable; the deterministic layers must carry
/// the document on their own.
struct OfflineLlm;

#[async_trait]
impl LlmClient for OfflineLlm {
    async fn classify(
        &self,
        _text: &str,
        _filename: &str,
    ) -> Result<Classification, LlmError> {
        Err(LlmError::Transient("provider offline".into()))
    }

    async fn extract_fields(
        &self,
        _request: &FieldExtractionRequest,
    ) -> Result<serde_json::Map<String, serde_json::Value>, LlmError> {
        Err(LlmError::Transient("provider offline".into()))
    }
}

const STATEMENT_CSV: &[u8] = b"\
Capital Account Statement,
Fund,Alpha Growth Fund II
Investor,Brainweb Invest GmbH
As of Date,2023-12-31
Currency,EUR
Beginning Balance,\"35,000,000.00\"
Contributions,\"5,000,000.00\"
Distributions,\"4,000,000.00\"
Management Fees,\"250,000.00\"
Partnership Expenses,\"50,000.00\"
Realized Gain,\"1,500,000.00\"
Unrealized Gain,\"3,500,000.00\"
Ending Balance,\"40,700,000.00\"
Total Commitment,\"50,000,000.00\"
Drawn Commitment,\"35,000,000.00\"
Unfunded Commitment,\"15,000,000.00\"
";

fn doc_id() -> DocId {
    DocId::from_content_hash(
        "aaaabbbbccccdddd0000111122223333aaaabbbbccccdddd0000111122223333",
    )
    .unwrap()
}

#[tokio::test]
async fn capital_account_csv_extracts_without_the_llm() {
    let parsed = parse_file(Path::new("/inv/cas_2023-12-31.csv"), STATEMENT_CSV).unwrap();
    assert_eq!(parsed.tables.len(), 1);

    let metrics = Arc::new(Metrics::new());
    let llm: Arc<dyn LlmClient> = Arc::new(OfflineLlm);

    let classifier = Classifier::new(llm.clone(), metrics.clone());
    let classification = classifier
        .classify("cas_2023-12-31.csv", &parsed)
        .await;
    assert_eq!(classification.doc_type, DocType::CapitalAccountStatement);
    assert_eq!(classification.method, ClassifyMethod::Anchor);

    let chain = ExtractorChain::new(llm, metrics);
    let extraction = chain
        .run(
            &doc_id(),
            classification.doc_type,
            &parsed,
            "cas_2023-12-31.csv",
        )
        .await;

    assert_eq!(extraction.money("beginning_balance"), Some(35_000_000.0));
    assert_eq!(extraction.money("ending_balance"), Some(40_700_000.0));
    assert_eq!(extraction.money("contributions_period"), Some(5_000_000.0));
    assert_eq!(extraction.money("distributions_period"), Some(4_000_000.0));
    assert_eq!(extraction.money("management_fees_period"), Some(250_000.0));
    assert_eq!(extraction.money("total_commitment"), Some(50_000_000.0));
    assert_eq!(extraction.money("unfunded_commitment"), Some(15_000_000.0));
    assert_eq!(
        extraction.date("as_of_date"),
        NaiveDate::from_ymd_opt(2023, 12, 31)
    );
    assert_eq!(
        extraction.text("fund_name"),
        Some("Alpha Growth Fund II")
    );

    // The glossary balance identity holds, so the row is consistent.
    assert_eq!(extraction.validation_status, ValidationStatus::Consistent);
    assert!(!extraction.incomplete);
    assert!(extraction.overall_confidence >= 0.85);
    assert!(extraction.overall_confidence <= 1.0);

    // Every extracted field left an audit row.
    assert!(extraction.audits.len() >= extraction.fields.len());
}

#[tokio::test]
async fn quarter_token_in_filename_recovers_the_date() {
    let csv: &[u8] = b"\
Capital Account Statement,
Fund,Beta Ventures I
Ending Balance,\"1,000,000.00\"
";
    let parsed = parse_file(Path::new("/inv/Beta_Q2 2025.csv"), csv).unwrap();

    let metrics = Arc::new(Metrics::new());
    let llm: Arc<dyn LlmClient> = Arc::new(OfflineLlm);
    let chain = ExtractorChain::new(llm, metrics);
    let extraction = chain
        .run(
            &doc_id(),
            DocType::CapitalAccountStatement,
            &parsed,
            "Beta_Q2 2025.csv",
        )
        .await;

    assert_eq!(
        extraction.date("as_of_date"),
        NaiveDate::from_ymd_opt(2025, 6, 30)
    );
    let audit = extraction
        .audits
        .iter()
        .find(|a| a.field_name == "as_of_date")
        .expect("date audit present");
    assert!(audit.confidence <= 0.7);
    assert_eq!(audit.note.as_deref(), Some("recovered from filename"));
}

#[tokio::test]
async fn broken_bytes_fail_at_parsing_with_no_rows() {
    let err = parse_file(Path::new("/inv/report.pdf"), b"not a pdf").unwrap_err();
    assert_eq!(err.kind(), captrace_core::ErrorKind::ParseError);
    assert!(!err.is_retryable());
}
