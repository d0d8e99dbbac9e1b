//! Commitment reconciliation per investor.

use serde_json::json;

use captrace_model::{CheckStatus, Severity};

use super::CheckOutcome;
use crate::persist::repository::CapitalAccountRecord;

/// Check `unfunded = total - drawn` and `drawn <= total` for every investor
/// row at the as-of date.
pub fn check_commitments(
    rows: &[CapitalAccountRecord],
    tolerance_pct: f64,
    tolerance_abs: f64,
) -> CheckOutcome {
    let mut issues = Vec::new();
    let mut checked = 0;

    for row in rows {
        let (Some(total), Some(drawn)) = (row.total_commitment, row.drawn_commitment) else {
            continue;
        };
        checked += 1;

        if drawn > total {
            issues.push(json!({
                "issue": "drawn_exceeds_total",
                "investor_id": row.investor_id.to_string(),
                "total": total,
                "drawn": drawn,
            }));
        }
        if let Some(unfunded) = row.unfunded_commitment {
            let expected = total - drawn;
            let tolerance = (tolerance_pct * total.abs()).max(tolerance_abs);
            let gap = (unfunded - expected).abs();
            if gap > tolerance {
                issues.push(json!({
                    "issue": "unfunded_mismatch",
                    "investor_id": row.investor_id.to_string(),
                    "unfunded": unfunded,
                    "expected": expected,
                    "gap": gap,
                    "tolerance": tolerance,
                }));
            }
        }
    }

    if issues.is_empty() {
        CheckOutcome {
            status: CheckStatus::Pass,
            severity: Severity::Info,
            details: json!({"investors_checked": checked}),
            recommendations: vec![],
        }
    } else {
        CheckOutcome {
            status: CheckStatus::Fail,
            severity: Severity::High,
            details: json!({"investors_checked": checked, "issues": issues}),
            recommendations: vec![
                "commitment arithmetic is inconsistent; re-extract the statement".into(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn row(total: Option<f64>, drawn: Option<f64>, unfunded: Option<f64>) -> CapitalAccountRecord {
        CapitalAccountRecord {
            fund_id: Uuid::nil(),
            investor_id: Uuid::now_v7(),
            as_of_date: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            reporting_currency: Some("EUR".into()),
            beginning_balance: None,
            ending_balance: None,
            contributions_period: None,
            distributions_period: None,
            management_fees_period: None,
            partnership_expenses_period: None,
            realized_gain_loss_period: None,
            unrealized_gain_loss_period: None,
            total_commitment: total,
            drawn_commitment: drawn,
            unfunded_commitment: unfunded,
            validation_status: "consistent".into(),
            source_doc_id: None,
        }
    }

    #[test]
    fn consistent_commitments_pass() {
        let rows = vec![row(
            Some(50_000_000.0),
            Some(35_000_000.0),
            Some(15_000_000.0),
        )];
        assert_eq!(
            check_commitments(&rows, 0.001, 1.0).status,
            CheckStatus::Pass
        );
    }

    #[test]
    fn unfunded_mismatch_fails() {
        let rows = vec![row(
            Some(50_000_000.0),
            Some(35_000_000.0),
            Some(10_000_000.0),
        )];
        let outcome = check_commitments(&rows, 0.001, 1.0);
        assert_eq!(outcome.status, CheckStatus::Fail);
        assert_eq!(outcome.severity, Severity::High);
    }

    #[test]
    fn overdrawn_commitment_fails() {
        let rows = vec![row(Some(50_000_000.0), Some(55_000_000.0), None)];
        assert_eq!(
            check_commitments(&rows, 0.001, 1.0).status,
            CheckStatus::Fail
        );
    }

    #[test]
    fn rows_without_commitments_are_skipped() {
        let rows = vec![row(None, None, None)];
        let outcome = check_commitments(&rows, 0.001, 1.0);
        assert_eq!(outcome.status, CheckStatus::Pass);
        assert_eq!(outcome.details["investors_checked"], 0);
    }
}
