use chrono::{DateTime, NaiveDate, Utc};

use crate::audit::ValidationStatus;
use crate::ids::{DocId, FundId, InvestorId};

/// Per-investor periodic statement of balances, flows, and commitment state.
///
/// Keyed by `(fund_ref, investor_ref, as_of_date)`. The balance identity
/// `ending = beginning + contributions - distributions - fees - expenses
/// + realized + unrealized` is checked at extraction time; violations are
/// recorded on `validation_status`, not rejected.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CapitalAccountRow {
    pub fund_ref: FundId,
    pub investor_ref: InvestorId,
    pub as_of_date: NaiveDate,
    pub reporting_currency: String,
    pub beginning_balance: Option<f64>,
    pub ending_balance: Option<f64>,
    pub contributions_period: Option<f64>,
    pub distributions_period: Option<f64>,
    /// Distribution split by sub-kind where the source document breaks it out.
    pub distributions_roc: Option<f64>,
    pub distributions_gain: Option<f64>,
    pub distributions_income: Option<f64>,
    pub management_fees_period: Option<f64>,
    pub partnership_expenses_period: Option<f64>,
    pub realized_gain_loss_period: Option<f64>,
    pub unrealized_gain_loss_period: Option<f64>,
    pub total_commitment: Option<f64>,
    pub drawn_commitment: Option<f64>,
    pub unfunded_commitment: Option<f64>,
    pub validation_status: ValidationStatus,
    pub source_doc_id: DocId,
}

/// Whether a NAV observation covers the whole fund or one investor's share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavScope {
    Fund,
    Investor,
}

impl NavScope {
    pub fn as_str(self) -> &'static str {
        match self {
            NavScope::Fund => "fund",
            NavScope::Investor => "investor",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fund" => Some(NavScope::Fund),
            "investor" => Some(NavScope::Investor),
            _ => None,
        }
    }
}

/// One NAV value as reported by one source document. Append-only; several
/// observations for the same key feed reconciliation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NavObservation {
    pub fund_ref: FundId,
    pub scope: NavScope,
    pub as_of_date: NaiveDate,
    pub value: f64,
    pub currency: String,
    pub source_doc_id: DocId,
}

/// Direction-encoding cashflow kind; amounts are always non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Call,
    Distribution,
    Fee,
    Tax,
    Other,
}

impl FlowType {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowType::Call => "call",
            FlowType::Distribution => "distribution",
            FlowType::Fee => "fee",
            FlowType::Tax => "tax",
            FlowType::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "call" => Some(FlowType::Call),
            "distribution" => Some(FlowType::Distribution),
            "fee" => Some(FlowType::Fee),
            "tax" => Some(FlowType::Tax),
            "other" => Some(FlowType::Other),
            _ => None,
        }
    }

    /// Sign applied when the flow enters money-weighted return math:
    /// investor outflows (calls) are negative, inflows positive.
    pub fn sign(self) -> f64 {
        match self {
            FlowType::Call | FlowType::Fee | FlowType::Tax => -1.0,
            FlowType::Distribution => 1.0,
            FlowType::Other => 1.0,
        }
    }
}

/// A dated cashflow attributed to a source document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Cashflow {
    pub fund_ref: FundId,
    pub investor_ref: Option<InvestorId>,
    pub flow_type: FlowType,
    pub flow_date: NaiveDate,
    pub amount: f64,
    pub currency: String,
    pub source_doc_id: DocId,
}

/// Reported fund-level performance for one as-of date.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PerformanceMetrics {
    pub fund_ref: FundId,
    pub as_of_date: NaiveDate,
    pub irr_net: Option<f64>,
    pub moic: Option<f64>,
    pub tvpi: Option<f64>,
    pub dpi: Option<f64>,
    pub rvpi: Option<f64>,
    pub called_pct: Option<f64>,
    pub distributed_pct: Option<f64>,
    pub source_doc_id: DocId,
}

/// Month-end reporting period derived from an as-of date.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Period {
    pub month_end: NaiveDate,
    /// e.g. "Q3 2024"
    pub quarter_label: String,
    pub period_type: PeriodType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Monthly,
    Quarterly,
    Annual,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Monthly => "monthly",
            PeriodType::Quarterly => "quarterly",
            PeriodType::Annual => "annual",
        }
    }
}

impl Period {
    /// Snap a reporting date to its month-end boundary and label it.
    pub fn from_as_of(date: NaiveDate) -> Self {
        use chrono::Datelike;
        let month_end = last_day_of_month(date.year(), date.month());
        let quarter = (date.month() - 1) / 3 + 1;
        let period_type = if date.month() == 12 && month_end.day() == 31 {
            // December month-end doubles as the annual boundary.
            PeriodType::Annual
        } else if date.month() % 3 == 0 {
            PeriodType::Quarterly
        } else {
            PeriodType::Monthly
        };
        Period {
            month_end,
            quarter_label: format!("Q{} {}", quarter, date.year()),
            period_type,
        }
    }
}

/// Last calendar day of the given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .expect("first of month is always valid")
        .pred_opt()
        .expect("month start has a predecessor")
}

/// Timestamp alias used on persisted rows.
pub type Timestamp = DateTime<Utc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_end_boundaries() {
        assert_eq!(
            last_day_of_month(2024, 2),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            last_day_of_month(2023, 2),
            NaiveDate::from_ymd_opt(2023, 2, 28).unwrap()
        );
        assert_eq!(
            last_day_of_month(2025, 12),
            NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
        );
    }

    #[test]
    fn period_labels_quarters() {
        let p = Period::from_as_of(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap());
        assert_eq!(p.quarter_label, "Q1 2024");
        assert_eq!(p.period_type, PeriodType::Quarterly);

        let p = Period::from_as_of(NaiveDate::from_ymd_opt(2024, 5, 15).unwrap());
        assert_eq!(p.month_end, NaiveDate::from_ymd_opt(2024, 5, 31).unwrap());
        assert_eq!(p.period_type, PeriodType::Monthly);

        let p = Period::from_as_of(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
        assert_eq!(p.period_type, PeriodType::Annual);
    }

    #[test]
    fn flow_sign_encodes_direction() {
        assert_eq!(FlowType::Call.sign(), -1.0);
        assert_eq!(FlowType::Distribution.sign(), 1.0);
    }
}
