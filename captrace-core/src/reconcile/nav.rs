//! NAV reconciliation across sources.

use serde_json::json;

use captrace_model::{CheckStatus, Severity};

use super::CheckOutcome;

/// One NAV value with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct NavSource {
    pub label: &'static str,
    pub value: f64,
    pub doc_ids: Vec<String>,
}

/// Relative deviation thresholds of the severity ladder.
const WARN_THRESHOLD: f64 = 0.001; // 0.1%
const FAIL_THRESHOLD: f64 = 0.01; // 1%

/// Compare NAV values from independent sources against their mean.
///
/// Severity ladder on the largest relative deviation: <= 0.1% pass,
/// under 1% warning, 1% and over fail. The absolute tolerance floor keeps
/// tiny funds from tripping percentage math on rounding cents.
pub fn check_nav(sources: &[NavSource], tolerance_abs: f64) -> CheckOutcome {
    if sources.len() < 2 {
        return CheckOutcome {
            status: CheckStatus::Pass,
            severity: Severity::Info,
            details: json!({
                "reason": "insufficient data",
                "sources_found": sources.len(),
                "sources": sources.iter().map(describe).collect::<Vec<_>>(),
            }),
            recommendations: vec![],
        };
    }

    let mean: f64 = sources.iter().map(|s| s.value).sum::<f64>() / sources.len() as f64;
    let mut max_rel: f64 = 0.0;
    let mut max_abs: f64 = 0.0;
    let mut deviations = Vec::new();
    for source in sources {
        let abs = (source.value - mean).abs();
        let rel = if mean.abs() > f64::EPSILON {
            abs / mean.abs()
        } else {
            0.0
        };
        max_rel = max_rel.max(rel);
        max_abs = max_abs.max(abs);
        deviations.push(json!({
            "source": source.label,
            "value": source.value,
            "deviation_abs": abs,
            "deviation_pct": rel * 100.0,
            "doc_ids": source.doc_ids,
        }));
    }

    let details = json!({
        "mean_nav": mean,
        "max_deviation_pct": max_rel * 100.0,
        "sources": deviations,
    });

    // Inside the absolute floor nothing else matters.
    if max_abs <= tolerance_abs || max_rel <= WARN_THRESHOLD {
        return CheckOutcome {
            status: CheckStatus::Pass,
            severity: Severity::Info,
            details,
            recommendations: vec![],
        };
    }
    if max_rel < FAIL_THRESHOLD {
        CheckOutcome {
            status: CheckStatus::Warning,
            severity: Severity::Medium,
            details,
            recommendations: vec![
                "NAV sources disagree beyond 0.1%; verify the newer document".into(),
            ],
        }
    } else {
        CheckOutcome {
            status: CheckStatus::Fail,
            severity: Severity::High,
            details,
            recommendations: vec![
                "NAV sources disagree beyond 1%; hold reporting until resolved".into(),
            ],
        }
    }
}

fn describe(source: &NavSource) -> serde_json::Value {
    json!({"source": source.label, "value": source.value, "doc_ids": source.doc_ids})
}
