//! Cross-source reconciliation for a `(fund, as_of_date)` pair.
//!
//! Advisory by design: findings are recorded for operator review and never
//! roll back persistence. One run per key is outstanding at a time;
//! duplicate triggers coalesce into the running pass.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use captrace_config::Tolerances;
use captrace_model::{
    CheckStatus, FundId, ReconciliationFinding, ReconciliationRun, ReconciliationType,
    Severity,
};

use crate::error::Result;
use crate::metrics::Metrics;
use crate::persist::Repository;

pub mod cashflow;
pub mod commitment;
pub mod nav;
pub mod performance;

pub use performance::xirr;

/// Verdict of one check before it becomes a stored finding.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub severity: Severity,
    pub details: serde_json::Value,
    pub recommendations: Vec<String>,
}

/// The reconciliation engine.
pub struct ReconciliationEngine {
    repository: Repository,
    tolerances: Tolerances,
    metrics: Arc<Metrics>,
    in_flight: DashMap<(Uuid, NaiveDate), ()>,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl ReconciliationEngine {
    pub fn new(repository: Repository, tolerances: Tolerances, metrics: Arc<Metrics>) -> Self {
        Self {
            repository,
            tolerances,
            metrics,
            in_flight: DashMap::new(),
        }
    }

    /// Run the requested checks. Returns `None` when another run for the
    /// same key is already in flight (the trigger coalesces).
    pub async fn reconcile(
        &self,
        fund_ref: FundId,
        as_of_date: NaiveDate,
        scope: &[ReconciliationType],
    ) -> Result<Option<ReconciliationRun>> {
        let key = (fund_ref.to_uuid(), as_of_date);
        if self.in_flight.insert(key, ()).is_some() {
            debug!(fund = %fund_ref, %as_of_date, "reconciliation already running; coalesced");
            return Ok(None);
        }
        let result = self.run_checks(fund_ref, as_of_date, scope).await;
        self.in_flight.remove(&key);
        result.map(Some)
    }

    async fn run_checks(
        &self,
        fund_ref: FundId,
        as_of_date: NaiveDate,
        scope: &[ReconciliationType],
    ) -> Result<ReconciliationRun> {
        let started_at = Utc::now();
        let fund_id = fund_ref.to_uuid();
        let scope: Vec<ReconciliationType> = if scope.is_empty() {
            ReconciliationType::ALL.to_vec()
        } else {
            scope.to_vec()
        };

        let accounts = self.repository.capital_accounts_at(fund_id, as_of_date).await?;
        let history = self
            .repository
            .capital_account_history(fund_id, as_of_date)
            .await?;

        let mut findings = Vec::new();
        for check in scope {
            let outcome = match check {
                ReconciliationType::Nav => {
                    let sources = self.gather_nav_sources(fund_id, as_of_date, &accounts).await?;
                    nav::check_nav(&sources, self.tolerances.nav_abs)
                }
                ReconciliationType::Cashflow => cashflow::check_cashflows(&history),
                ReconciliationType::Performance => {
                    let reported = self
                        .repository
                        .latest_performance(fund_id, as_of_date)
                        .await?;
                    let calculated = performance::calculate_metrics(&history, as_of_date);
                    performance::check_performance(
                        reported.as_ref(),
                        calculated.as_ref(),
                        self.tolerances.irr_pp,
                        self.tolerances.multiple_abs,
                        self.tolerances.tvpi_identity,
                    )
                }
                ReconciliationType::Commitment => commitment::check_commitments(
                    &accounts,
                    self.tolerances.commitment_pct,
                    self.tolerances.commitment_abs,
                ),
            };
            findings.push(ReconciliationFinding {
                fund_ref,
                as_of_date,
                reconciliation_type: check,
                severity: outcome.severity,
                status: outcome.status,
                details: outcome.details,
                recommendations: outcome.recommendations,
                created_at: Utc::now(),
            });
        }

        if let Err(err) = self.repository.insert_findings(&findings).await {
            // Advisory path: a findings-store failure is logged, not fatal.
            warn!(error = %err, fund = %fund_ref, "failed to store findings");
        }
        Metrics::incr(&self.metrics.reconciliation_runs);

        let run =
            ReconciliationRun::from_findings(fund_ref, as_of_date, findings, started_at);
        info!(
            fund = %fund_ref,
            %as_of_date,
            status = run.overall_status.as_str(),
            severity = run.overall_severity.as_str(),
            findings = run.findings.len(),
            "reconciliation finished"
        );
        Ok(run)
    }

    /// Collect NAV values: the capital-account sum, fund-scope
    /// observations, and the performance-implied NAV (the account sum,
    /// when a metrics row corroborates the date).
    async fn gather_nav_sources(
        &self,
        fund_id: Uuid,
        as_of_date: NaiveDate,
        accounts: &[crate::persist::repository::CapitalAccountRecord],
    ) -> Result<Vec<nav::NavSource>> {
        let mut sources = Vec::new();

        let cas_docs: Vec<String> = accounts
            .iter()
            .filter_map(|r| r.source_doc_id.clone())
            .collect();
        let cas_sum: f64 = accounts.iter().filter_map(|r| r.ending_balance).sum();
        if !accounts.is_empty() && cas_sum != 0.0 {
            sources.push(nav::NavSource {
                label: "capital_account",
                value: cas_sum,
                doc_ids: cas_docs.clone(),
            });
        }

        let observations = self.repository.nav_observations(fund_id, as_of_date).await?;
        if let Some(fund_obs) = observations.iter().rev().find(|o| o.scope == "fund") {
            sources.push(nav::NavSource {
                label: "quarterly_report",
                value: fund_obs.value,
                doc_ids: vec![fund_obs.source_doc_id.clone()],
            });
        }

        if !accounts.is_empty() && cas_sum != 0.0 {
            if let Some(perf) = self
                .repository
                .latest_performance(fund_id, as_of_date)
                .await?
            {
                sources.push(nav::NavSource {
                    label: "performance_metrics",
                    value: cas_sum,
                    doc_ids: vec![perf.source_doc_id],
                });
            }
        }
        Ok(sources)
    }
}
