//! Validation of extracted figures: identities, sign rules, date sanity.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};

use captrace_model::ValidationStatus;

/// One validation verdict, attributed to the fields it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub rule: &'static str,
    pub fields: Vec<&'static str>,
    pub message: String,
}

/// Numeric view of the extraction used by the validators.
pub type MoneyFields = BTreeMap<&'static str, f64>;

fn money(fields: &MoneyFields, name: &str) -> Option<f64> {
    fields.get(name).copied()
}

/// Balance identity:
/// `ending = beginning + contributions - distributions - fees - expenses
/// + realized + unrealized`, within max(0.5% of |ending|, 100 units).
/// Only checked when both balances are present; missing flow terms count
/// as zero.
pub fn check_balance_identity(fields: &MoneyFields) -> Option<Violation> {
    let beginning = money(fields, "beginning_balance")?;
    let ending = money(fields, "ending_balance")?;

    let contributions = money(fields, "contributions_period").unwrap_or(0.0);
    let distributions = money(fields, "distributions_period").unwrap_or(0.0);
    let fees = money(fields, "management_fees_period").unwrap_or(0.0);
    let expenses = money(fields, "partnership_expenses_period").unwrap_or(0.0);
    let realized = money(fields, "realized_gain_loss_period").unwrap_or(0.0);
    let unrealized = money(fields, "unrealized_gain_loss_period").unwrap_or(0.0);

    let expected =
        beginning + contributions - distributions - fees - expenses + realized + unrealized;
    let tolerance = (0.005 * ending.abs()).max(100.0);
    let gap = (ending - expected).abs();
    if gap <= tolerance {
        return None;
    }
    Some(Violation {
        rule: "balance_identity",
        fields: vec![
            "beginning_balance",
            "ending_balance",
            "contributions_period",
            "distributions_period",
            "management_fees_period",
            "partnership_expenses_period",
            "realized_gain_loss_period",
            "unrealized_gain_loss_period",
        ],
        message: format!(
            "ending balance {ending:.2} differs from computed {expected:.2} by {gap:.2} (tolerance {tolerance:.2})"
        ),
    })
}

/// Commitment identity: `unfunded = total - drawn` within
/// max(0.1% of total, 1 unit).
pub fn check_commitment_identity(fields: &MoneyFields) -> Option<Violation> {
    let total = money(fields, "total_commitment")?;
    let drawn = money(fields, "drawn_commitment")?;
    let unfunded = money(fields, "unfunded_commitment")?;

    let expected = total - drawn;
    let tolerance = (0.001 * total.abs()).max(1.0);
    let gap = (unfunded - expected).abs();
    if gap <= tolerance {
        return None;
    }
    Some(Violation {
        rule: "commitment_identity",
        fields: vec!["total_commitment", "drawn_commitment", "unfunded_commitment"],
        message: format!(
            "unfunded {unfunded:.2} differs from total-drawn {expected:.2} by {gap:.2} (tolerance {tolerance:.2})"
        ),
    })
}

const NON_NEGATIVE_FIELDS: &[&str] = &[
    "contributions_period",
    "distributions_period",
    "distributions_roc",
    "distributions_gain",
    "distributions_income",
    "management_fees_period",
    "total_commitment",
    "drawn_commitment",
    "unfunded_commitment",
    "call_amount",
    "distribution_amount",
];

/// Contributions, distributions, fees, and commitments must be >= 0.
pub fn check_non_negativity(fields: &MoneyFields) -> Vec<Violation> {
    NON_NEGATIVE_FIELDS
        .iter()
        .filter_map(|name| {
            let value = money(fields, name)?;
            if value < 0.0 {
                Some(Violation {
                    rule: "non_negativity",
                    fields: vec![*name],
                    message: format!("{name} is negative: {value:.2}"),
                })
            } else {
                None
            }
        })
        .collect()
}

/// `as_of_date <= today` and year >= 1990.
pub fn check_date_sanity(as_of_date: NaiveDate) -> Option<Violation> {
    use chrono::Datelike;
    let today = Utc::now().date_naive();
    if as_of_date > today {
        return Some(Violation {
            rule: "date_sanity",
            fields: vec!["as_of_date"],
            message: format!("as_of_date {as_of_date} is in the future"),
        });
    }
    if as_of_date.year() < 1990 {
        return Some(Violation {
            rule: "date_sanity",
            fields: vec!["as_of_date"],
            message: format!("as_of_date {as_of_date} predates 1990"),
        });
    }
    None
}

/// Overall status: any violation makes the extraction inconsistent; rows are
/// still written and the audit trail carries the details.
pub fn overall_status(violations: &[Violation]) -> ValidationStatus {
    if violations.is_empty() {
        ValidationStatus::Consistent
    } else {
        ValidationStatus::Inconsistent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement_fields() -> MoneyFields {
        // The glossary sample: identity holds exactly.
        // 35,000,000 + 5,000,000 - 4,000,000 - 250,000 - 50,000
        //   + 1,500,000 + 3,500,000 = 40,700,000
        BTreeMap::from([
            ("beginning_balance", 35_000_000.0),
            ("ending_balance", 40_700_000.0),
            ("contributions_period", 5_000_000.0),
            ("distributions_period", 4_000_000.0),
            ("management_fees_period", 250_000.0),
            ("partnership_expenses_period", 50_000.0),
            ("realized_gain_loss_period", 1_500_000.0),
            ("unrealized_gain_loss_period", 3_500_000.0),
        ])
    }

    #[test]
    fn balance_identity_accepts_the_sample_statement() {
        assert!(check_balance_identity(&statement_fields()).is_none());
    }

    #[test]
    fn balance_identity_flags_large_gaps() {
        let mut fields = statement_fields();
        fields.insert("ending_balance", 42_000_000.0);
        let violation = check_balance_identity(&fields).unwrap();
        assert_eq!(violation.rule, "balance_identity");
    }

    #[test]
    fn balance_identity_tolerates_rounding() {
        let mut fields = statement_fields();
        // Within max(0.5% of ending, 100): 0.5% of 40.7m is 203,500.
        fields.insert("ending_balance", 40_700_000.0 + 200_000.0);
        assert!(check_balance_identity(&fields).is_none());
    }

    #[test]
    fn commitment_identity_checks_within_tolerance() {
        let fields = BTreeMap::from([
            ("total_commitment", 50_000_000.0),
            ("drawn_commitment", 35_000_000.0),
            ("unfunded_commitment", 15_000_000.0),
        ]);
        assert!(check_commitment_identity(&fields).is_none());

        let fields = BTreeMap::from([
            ("total_commitment", 50_000_000.0),
            ("drawn_commitment", 35_000_000.0),
            ("unfunded_commitment", 14_000_000.0),
        ]);
        assert!(check_commitment_identity(&fields).is_some());
    }

    #[test]
    fn negative_contributions_are_flagged() {
        let fields = BTreeMap::from([("contributions_period", -5_000.0)]);
        let violations = check_non_negativity(&fields);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].fields, vec!["contributions_period"]);
    }

    #[test]
    fn date_sanity_bounds() {
        assert!(check_date_sanity(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()).is_none());
        assert!(check_date_sanity(NaiveDate::from_ymd_opt(1989, 12, 31).unwrap()).is_some());
        let future = Utc::now().date_naive() + chrono::Duration::days(30);
        assert!(check_date_sanity(future).is_some());
    }
}
