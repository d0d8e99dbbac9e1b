//! Anchor + regex extraction: labeled values in running text.

use captrace_model::ExtractorTag;
use regex::Regex;
use tracing::trace;

use crate::extract::catalog::{FieldKind, FieldSpec};
use crate::extract::numeric;
use crate::extract::{dates, Candidate, FieldValue};

/// Base confidence for an anchor hit.
const ANCHOR_BASE: f64 = 0.9;
/// Penalty when the normalized value is not found verbatim in the source.
const NOT_VERBATIM_PENALTY: f64 = 0.1;

const MONEY_CAPTURE: &str =
    r"[-(]?\s*(?:EUR|USD|GBP|CHF)?\s*[€$£]?\s*\d[\d.,'\u{a0} ]*\)?";
const DATE_CAPTURE: &str = r"\d{1,4}[./\-]\d{1,2}[./\-]\d{2,4}|\w+\s+\d{1,2},\s+\d{4}|\d{1,2}\s+\w+\s+\d{4}|\d{1,2}-\w{3}-\d{4}";
const PERCENT_CAPTURE: &str = r"[-(]?\s*[\d.,]+\s*%?\)?";
const MULTIPLE_CAPTURE: &str = r"[\d.,]+\s*[xX]?";
const TEXT_CAPTURE: &str = r"[^\r\n]+";

fn capture_for(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Money => MONEY_CAPTURE,
        FieldKind::Date => DATE_CAPTURE,
        FieldKind::Percent => PERCENT_CAPTURE,
        FieldKind::Multiple => MULTIPLE_CAPTURE,
        FieldKind::Text => TEXT_CAPTURE,
    }
}

/// Try every alias of every catalog field against the document text. The
/// earliest match in the text wins for each field.
pub fn extract(catalog: &'static [FieldSpec], text: &str) -> Vec<Candidate> {
    let mut out = Vec::new();
    for spec in catalog {
        let mut best: Option<(usize, Candidate)> = None;
        for alias in spec.aliases {
            // Label, separator (colon or the comma CSV rows use), optional
            // opening quote, then the kind-specific capture.
            let pattern = format!(
                r#"(?i)\b{}\b\s*[:,：]?\s*["']?({})"#,
                regex::escape(alias),
                capture_for(spec.kind)
            );
            let re = match Regex::new(&pattern) {
                Ok(re) => re,
                Err(_) => continue,
            };
            let Some(caps) = re.captures(text) else {
                continue;
            };
            let raw = caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
            let position = caps.get(0).map(|m| m.start()).unwrap_or(usize::MAX);
            let Some(value) = parse_value(spec.kind, &raw) else {
                continue;
            };
            let confidence = if value_verbatim(&value, text) {
                ANCHOR_BASE
            } else {
                ANCHOR_BASE - NOT_VERBATIM_PENALTY
            };
            let candidate = Candidate {
                field: spec.name,
                raw,
                value,
                tag: ExtractorTag::Anchor,
                confidence,
            };
            match &best {
                Some((at, _)) if *at <= position => {}
                _ => best = Some((position, candidate)),
            }
        }
        if let Some((_, candidate)) = best {
            trace!(field = candidate.field, raw = %candidate.raw, "anchor hit");
            out.push(candidate);
        }
    }
    out
}

pub(crate) fn parse_value(kind: FieldKind, raw: &str) -> Option<FieldValue> {
    match kind {
        FieldKind::Money => numeric::parse_amount(raw).map(FieldValue::Money),
        FieldKind::Date => dates::parse_date(raw).map(FieldValue::Date),
        FieldKind::Percent => numeric::parse_percent(raw).map(FieldValue::Percent),
        FieldKind::Multiple => numeric::parse_multiple(raw).map(FieldValue::Multiple),
        FieldKind::Text => {
            let cleaned = raw
                .trim()
                .trim_matches(|c: char| matches!(c, ':' | '-' | '|' | ',' | ';' | '"' | '\''))
                .trim();
            if cleaned.is_empty() {
                None
            } else {
                // Char-wise cap keeps multi-byte labels intact.
                let text: String = cleaned.chars().take(120).collect();
                Some(FieldValue::Text(text))
            }
        }
    }
}

/// Whether the canonical rendering of a normalized value still appears in
/// the source text. A miss is expected for separator-formatted numbers and
/// costs the anchor a tenth of confidence.
fn value_verbatim(value: &FieldValue, text: &str) -> bool {
    match value {
        FieldValue::Money(v) => {
            let canonical = if v.fract() == 0.0 {
                format!("{}", *v as i64)
            } else {
                format!("{v}")
            };
            text.contains(&canonical)
        }
        FieldValue::Date(d) => text.contains(&d.to_string()),
        FieldValue::Percent(_) | FieldValue::Multiple(_) => true,
        FieldValue::Text(s) => text.contains(s.as_str()),
    }
}
