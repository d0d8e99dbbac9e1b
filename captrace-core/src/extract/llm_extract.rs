//! LLM field matching: the last extractor in the chain.

use captrace_model::{DocType, ExtractorTag};
use serde_json::Value;
use tracing::{debug, warn};

use crate::extract::anchors::parse_value;
use crate::extract::catalog::{FieldKind, FieldSpec};
use crate::extract::{Candidate, FieldValue};
use crate::llm::{
    FieldExtractionRequest, FieldPrompt, LlmClient, LlmError, MAX_PROMPT_TABLES,
    MAX_PROMPT_TEXT,
};
use crate::parse::ParsedDoc;

/// LLM answers never score above this; deterministic extractors keep
/// precedence.
const LLM_CAP: f64 = 0.8;

/// Ask the provider for the catalog fields and re-validate every value
/// through the same normalization path the deterministic extractors use.
pub async fn extract(
    llm: &dyn LlmClient,
    doc_type: DocType,
    catalog: &'static [FieldSpec],
    parsed: &ParsedDoc,
    filename: &str,
) -> Result<Vec<Candidate>, LlmError> {
    let request = FieldExtractionRequest {
        doc_type,
        fields: catalog
            .iter()
            .map(|spec| FieldPrompt {
                name: spec.name.to_string(),
                hints: spec.aliases.iter().map(|a| a.to_string()).collect(),
            })
            .collect(),
        text_excerpt: {
            let text = parsed.full_text();
            crate::llm::truncate_chars(&text, MAX_PROMPT_TEXT).to_string()
        },
        tables: parsed.tables.iter().take(MAX_PROMPT_TABLES).cloned().collect(),
        filename: filename.to_string(),
    };

    let answer = llm.extract_fields(&request).await?;
    let mut out = Vec::new();
    for (name, value) in answer {
        let Some(spec) = catalog.iter().find(|spec| spec.name == name) else {
            debug!(field = %name, "provider returned a field outside the catalog");
            continue;
        };
        let Some((raw, parsed_value)) = coerce(spec.kind, &value) else {
            warn!(field = %name, value = %value, "provider value failed re-validation");
            continue;
        };
        out.push(Candidate {
            field: spec.name,
            raw,
            value: parsed_value,
            tag: ExtractorTag::Llm,
            confidence: LLM_CAP,
        });
    }
    Ok(out)
}

/// JSON value to typed field value, through the shared parsers.
fn coerce(kind: FieldKind, value: &Value) -> Option<(String, FieldValue)> {
    match value {
        Value::Null => None,
        Value::Number(n) => {
            let raw = n.to_string();
            let f = n.as_f64()?;
            let typed = match kind {
                FieldKind::Money => FieldValue::Money(f),
                FieldKind::Percent => FieldValue::Percent(if f.abs() > 1.0 {
                    f / 100.0
                } else {
                    f
                }),
                FieldKind::Multiple => FieldValue::Multiple(f),
                FieldKind::Date | FieldKind::Text => return None,
            };
            Some((raw, typed))
        }
        Value::String(s) => {
            let typed = parse_value(kind, s)?;
            Some((s.clone(), typed))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn numbers_coerce_by_kind() {
        let (_, v) = coerce(FieldKind::Money, &serde_json::json!(40700000.0)).unwrap();
        assert_eq!(v, FieldValue::Money(40_700_000.0));
        let (_, v) = coerce(FieldKind::Percent, &serde_json::json!(12.5)).unwrap();
        assert_eq!(v, FieldValue::Percent(0.125));
    }

    #[test]
    fn strings_go_through_the_shared_parsers() {
        let (_, v) = coerce(FieldKind::Money, &serde_json::json!("1.234,56")).unwrap();
        assert_eq!(v, FieldValue::Money(1234.56));
        let (_, v) = coerce(FieldKind::Date, &serde_json::json!("2023-12-31")).unwrap();
        assert_eq!(
            v,
            FieldValue::Date(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap())
        );
    }

    #[test]
    fn invalid_values_are_dropped() {
        assert!(coerce(FieldKind::Date, &serde_json::json!(20231231)).is_none());
        assert!(coerce(FieldKind::Money, &serde_json::json!("n/a")).is_none());
        assert!(coerce(FieldKind::Money, &Value::Null).is_none());
    }
}
