//! Performance recomputation: money-weighted IRR and multiples from the
//! cashflow history, compared against reported values.

use chrono::NaiveDate;
use serde_json::json;

use captrace_model::{CheckStatus, Severity};

use super::CheckOutcome;
use crate::persist::repository::{CapitalAccountRecord, PerformanceRecord};

/// Newton iterations before falling back to bisection.
const NEWTON_MAX_ITER: usize = 60;
const NEWTON_EPS: f64 = 1e-9;
const BISECT_LO: f64 = -0.9999;
const BISECT_HI: f64 = 10.0;
const BISECT_MAX_ITER: usize = 200;

fn npv(rate: f64, flows: &[(NaiveDate, f64)], t0: NaiveDate) -> f64 {
    flows
        .iter()
        .map(|(date, amount)| {
            let years = (*date - t0).num_days() as f64 / 365.25;
            amount / (1.0 + rate).powf(years)
        })
        .sum()
}

fn npv_derivative(rate: f64, flows: &[(NaiveDate, f64)], t0: NaiveDate) -> f64 {
    flows
        .iter()
        .map(|(date, amount)| {
            let years = (*date - t0).num_days() as f64 / 365.25;
            -years * amount / (1.0 + rate).powf(years + 1.0)
        })
        .sum()
}

/// Annualized money-weighted return (XIRR) over dated flows: negative for
/// investor outflows, positive for inflows, terminal NAV as a final inflow.
///
/// Newton from a 10% seed, bisection when Newton diverges. Returns `None`
/// when the flows cannot produce a sign change (no root to find).
pub fn xirr(flows: &[(NaiveDate, f64)]) -> Option<f64> {
    if flows.len() < 2 {
        return None;
    }
    let has_negative = flows.iter().any(|(_, v)| *v < 0.0);
    let has_positive = flows.iter().any(|(_, v)| *v > 0.0);
    if !has_negative || !has_positive {
        return None;
    }
    let t0 = flows.iter().map(|(d, _)| *d).min()?;

    // Newton-Raphson.
    let mut rate = 0.1_f64;
    for _ in 0..NEWTON_MAX_ITER {
        let value = npv(rate, flows, t0);
        if value.abs() < NEWTON_EPS {
            return Some(rate);
        }
        let slope = npv_derivative(rate, flows, t0);
        if slope.abs() < f64::EPSILON {
            break;
        }
        let next = rate - value / slope;
        if !next.is_finite() || next <= -1.0 {
            break;
        }
        if (next - rate).abs() < NEWTON_EPS {
            return Some(next);
        }
        rate = next;
    }

    // Bisection fallback over a wide bracket.
    let mut lo = BISECT_LO;
    let mut hi = BISECT_HI;
    let mut f_lo = npv(lo, flows, t0);
    let f_hi = npv(hi, flows, t0);
    if f_lo * f_hi > 0.0 {
        return None;
    }
    for _ in 0..BISECT_MAX_ITER {
        let mid = (lo + hi) / 2.0;
        let f_mid = npv(mid, flows, t0);
        if f_mid.abs() < NEWTON_EPS || (hi - lo) / 2.0 < NEWTON_EPS {
            return Some(mid);
        }
        if f_lo * f_mid < 0.0 {
            hi = mid;
        } else {
            lo = mid;
            f_lo = f_mid;
        }
    }
    Some((lo + hi) / 2.0)
}

/// Metrics recomputed from the account history.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculatedMetrics {
    pub irr: Option<f64>,
    pub moic: Option<f64>,
    pub tvpi: Option<f64>,
    pub dpi: Option<f64>,
    pub rvpi: Option<f64>,
    pub contributions: f64,
    pub distributions: f64,
    pub nav: f64,
}

/// Rebuild dated flows and multiples from the capital-account history.
/// Terminal NAV (the latest ending balance, summed across investors) enters
/// the IRR as an inflow at `as_of_date`.
pub fn calculate_metrics(
    history: &[CapitalAccountRecord],
    as_of_date: NaiveDate,
) -> Option<CalculatedMetrics> {
    if history.is_empty() {
        return None;
    }

    let mut flows: Vec<(NaiveDate, f64)> = Vec::new();
    let mut contributions = 0.0;
    let mut distributions = 0.0;
    for row in history {
        if let Some(c) = row.contributions_period {
            if c > 0.0 {
                contributions += c;
                flows.push((row.as_of_date, -c));
            }
        }
        if let Some(d) = row.distributions_period {
            if d > 0.0 {
                distributions += d;
                flows.push((row.as_of_date, d));
            }
        }
    }

    let last_date = history.iter().map(|r| r.as_of_date).max()?;
    let nav: f64 = history
        .iter()
        .filter(|r| r.as_of_date == last_date)
        .filter_map(|r| r.ending_balance)
        .sum();
    if nav > 0.0 {
        flows.push((as_of_date, nav));
    }

    let irr = xirr(&flows);
    let (moic, tvpi, dpi, rvpi) = if contributions > 0.0 {
        let dpi = distributions / contributions;
        let rvpi = nav / contributions;
        (
            Some((distributions + nav) / contributions),
            Some(dpi + rvpi),
            Some(dpi),
            Some(rvpi),
        )
    } else {
        (None, None, None, None)
    };

    Some(CalculatedMetrics {
        irr,
        moic,
        tvpi,
        dpi,
        rvpi,
        contributions,
        distributions,
        nav,
    })
}

/// Compare reported metrics against the recomputation.
pub fn check_performance(
    reported: Option<&PerformanceRecord>,
    calculated: Option<&CalculatedMetrics>,
    irr_tolerance: f64,
    multiple_tolerance: f64,
    tvpi_identity_tolerance: f64,
) -> CheckOutcome {
    let Some(calc) = calculated else {
        return CheckOutcome {
            status: CheckStatus::Pass,
            severity: Severity::Info,
            details: json!({"reason": "no cashflow history to recompute from"}),
            recommendations: vec![],
        };
    };

    let mut discrepancies = Vec::new();
    let mut recommendations = Vec::new();

    if let Some(rep) = reported {
        let mut compare = |name: &str, reported: Option<f64>, calculated: Option<f64>, tol: f64| {
            if let (Some(r), Some(c)) = (reported, calculated) {
                let gap = (r - c).abs();
                if gap > tol {
                    discrepancies.push(json!({
                        "metric": name,
                        "reported": r,
                        "calculated": c,
                        "gap": gap,
                        "tolerance": tol,
                    }));
                }
            }
        };
        compare("irr_net", rep.irr_net, calc.irr, irr_tolerance);
        compare("moic", rep.moic, calc.moic, multiple_tolerance);
        compare("tvpi", rep.tvpi, calc.tvpi, multiple_tolerance);
        compare("dpi", rep.dpi, calc.dpi, multiple_tolerance);
        compare("rvpi", rep.rvpi, calc.rvpi, multiple_tolerance);

        // TVPI = DPI + RVPI must hold on the reported numbers themselves.
        if let (Some(tvpi), Some(dpi), Some(rvpi)) = (rep.tvpi, rep.dpi, rep.rvpi) {
            let gap = (tvpi - (dpi + rvpi)).abs();
            if gap > tvpi_identity_tolerance {
                discrepancies.push(json!({
                    "metric": "tvpi_identity",
                    "reported_tvpi": tvpi,
                    "dpi_plus_rvpi": dpi + rvpi,
                    "gap": gap,
                }));
                recommendations
                    .push("reported TVPI does not equal DPI + RVPI; check the source report".into());
            }
        }
    }

    if discrepancies.is_empty() {
        CheckOutcome {
            status: CheckStatus::Pass,
            severity: Severity::Info,
            details: json!({
                "calculated": {
                    "irr": calc.irr,
                    "moic": calc.moic,
                    "tvpi": calc.tvpi,
                    "dpi": calc.dpi,
                    "rvpi": calc.rvpi,
                },
            }),
            recommendations,
        }
    } else {
        recommendations.push("re-extract the source report or review the cashflow history".into());
        CheckOutcome {
            status: CheckStatus::Warning,
            severity: Severity::Medium,
            details: json!({
                "discrepancies": discrepancies,
                "calculated_nav": calc.nav,
                "contributions": calc.contributions,
                "distributions": calc.distributions,
            }),
            recommendations,
        }
    }
}
