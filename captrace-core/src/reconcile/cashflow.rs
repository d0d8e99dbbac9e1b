//! Cashflow reconciliation over the recent capital-account periods.

use chrono::Datelike;
use serde_json::json;

use captrace_model::{CheckStatus, Severity};

use super::CheckOutcome;
use crate::persist::repository::CapitalAccountRecord;

/// Periods inspected by the check.
const LOOKBACK_PERIODS: usize = 4;
/// Management-fee rate against contributions that triggers a warning,
/// per period.
const FEE_RATE_THRESHOLD: f64 = 0.025;
/// Consecutive reporting dates further apart than this many days imply a
/// skipped period (quarterly cadence plus slack).
const PERIOD_GAP_DAYS: i64 = 100;

/// Inspect the last four periods for sign errors, outsized fees, and gaps
/// in the reporting sequence.
pub fn check_cashflows(history: &[CapitalAccountRecord]) -> CheckOutcome {
    if history.is_empty() {
        return CheckOutcome {
            status: CheckStatus::Pass,
            severity: Severity::Info,
            details: json!({"reason": "no capital account history"}),
            recommendations: vec![],
        };
    }

    // Oldest-first tail of the history.
    let tail: Vec<&CapitalAccountRecord> = history
        .iter()
        .rev()
        .take(LOOKBACK_PERIODS)
        .rev()
        .collect();

    let mut issues = Vec::new();
    let mut status = CheckStatus::Pass;
    let mut severity = Severity::Info;
    let mut recommendations = Vec::new();

    let raise = |status_ref: &mut CheckStatus, severity_ref: &mut Severity,
                     new_status: CheckStatus,
                     new_severity: Severity| {
        *status_ref = (*status_ref).max(new_status);
        *severity_ref = (*severity_ref).max(new_severity);
    };

    let mut contributions_sum = 0.0;
    let mut distributions_sum = 0.0;
    let mut fees_sum = 0.0;

    for row in &tail {
        let contributions = row.contributions_period.unwrap_or(0.0);
        let fees = row.management_fees_period.unwrap_or(0.0);
        contributions_sum += contributions;
        distributions_sum += row.distributions_period.unwrap_or(0.0);
        fees_sum += fees;

        if contributions < 0.0 {
            issues.push(json!({
                "issue": "negative_contributions",
                "as_of_date": row.as_of_date.to_string(),
                "value": contributions,
            }));
            recommendations.push(format!(
                "contributions on {} are negative; the flow direction is wrong",
                row.as_of_date
            ));
            raise(&mut status, &mut severity, CheckStatus::Fail, Severity::High);
        }
        if contributions > 0.0 && fees / contributions > FEE_RATE_THRESHOLD {
            issues.push(json!({
                "issue": "fee_rate",
                "as_of_date": row.as_of_date.to_string(),
                "fees": fees,
                "contributions": contributions,
                "rate": fees / contributions,
            }));
            recommendations.push(format!(
                "management fees on {} exceed 2.5% of contributions",
                row.as_of_date
            ));
            raise(
                &mut status,
                &mut severity,
                CheckStatus::Warning,
                Severity::Medium,
            );
        }
    }

    for pair in tail.windows(2) {
        let gap = (pair[1].as_of_date - pair[0].as_of_date).num_days();
        if gap > PERIOD_GAP_DAYS {
            issues.push(json!({
                "issue": "missing_period",
                "from": pair[0].as_of_date.to_string(),
                "to": pair[1].as_of_date.to_string(),
                "gap_days": gap,
            }));
            recommendations.push(format!(
                "no statement between {} and {}; a period appears to be missing",
                pair[0].as_of_date, pair[1].as_of_date
            ));
            raise(
                &mut status,
                &mut severity,
                CheckStatus::Warning,
                Severity::Medium,
            );
        }
    }

    CheckOutcome {
        status,
        severity,
        details: json!({
            "periods_inspected": tail.len(),
            "window": {
                "from": tail.first().map(|r| r.as_of_date.to_string()),
                "to": tail.last().map(|r| r.as_of_date.to_string()),
                "from_year": tail.first().map(|r| r.as_of_date.year()),
            },
            "contributions_sum": contributions_sum,
            "distributions_sum": distributions_sum,
            "fees_sum": fees_sum,
            "issues": issues,
        }),
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn row(
        as_of: (i32, u32, u32),
        contributions: f64,
        fees: f64,
    ) -> CapitalAccountRecord {
        CapitalAccountRecord {
            fund_id: Uuid::nil(),
            investor_id: Uuid::nil(),
            as_of_date: NaiveDate::from_ymd_opt(as_of.0, as_of.1, as_of.2).unwrap(),
            reporting_currency: Some("EUR".into()),
            beginning_balance: None,
            ending_balance: Some(1_000_000.0),
            contributions_period: Some(contributions),
            distributions_period: Some(0.0),
            management_fees_period: Some(fees),
            partnership_expenses_period: None,
            realized_gain_loss_period: None,
            unrealized_gain_loss_period: None,
            total_commitment: None,
            drawn_commitment: None,
            unfunded_commitment: None,
            validation_status: "consistent".into(),
            source_doc_id: None,
        }
    }

    #[test]
    fn clean_quarterly_sequence_passes() {
        let history = vec![
            row((2023, 3, 31), 1_000_000.0, 10_000.0),
            row((2023, 6, 30), 500_000.0, 10_000.0),
            row((2023, 9, 30), 0.0, 0.0),
            row((2023, 12, 31), 250_000.0, 5_000.0),
        ];
        let outcome = check_cashflows(&history);
        assert_eq!(outcome.status, CheckStatus::Pass);
    }

    #[test]
    fn negative_contributions_fail() {
        let history = vec![row((2023, 12, 31), -50_000.0, 0.0)];
        let outcome = check_cashflows(&history);
        assert_eq!(outcome.status, CheckStatus::Fail);
        assert_eq!(outcome.severity, Severity::High);
    }

    #[test]
    fn high_fee_rate_warns() {
        let history = vec![row((2023, 12, 31), 1_000_000.0, 50_000.0)];
        let outcome = check_cashflows(&history);
        assert_eq!(outcome.status, CheckStatus::Warning);
    }

    #[test]
    fn skipped_quarter_warns() {
        let history = vec![
            row((2023, 3, 31), 100_000.0, 1_000.0),
            // Q2 missing.
            row((2023, 9, 30), 100_000.0, 1_000.0),
        ];
        let outcome = check_cashflows(&history);
        assert_eq!(outcome.status, CheckStatus::Warning);
        let issues = outcome.details["issues"].as_array().unwrap();
        assert!(issues.iter().any(|i| i["issue"] == "missing_period"));
    }

    #[test]
    fn empty_history_is_informational() {
        let outcome = check_cashflows(&[]);
        assert_eq!(outcome.status, CheckStatus::Pass);
        assert_eq!(outcome.severity, Severity::Info);
    }
}
