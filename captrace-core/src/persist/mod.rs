//! Transactional persistence of one document's outcome.
//!
//! The writer commits identities, the document row, fact rows, audits, and
//! observations in a single transaction; if any step fails, none of it is
//! visible. Writes for the same `(fund, investor, as_of_date)` key are
//! serialized through a keyed mutex so concurrent upserts cannot race on
//! ON-CONFLICT semantics.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use captrace_model::{
    AuditSeverity, DocId, DocType, ExtractorTag, FieldAudit, FlowType, FundId,
    InvestorId, NavScope, Period, ValidationStatus,
};

use crate::error::{PipelineError, Result};
use crate::extract::Extraction;
use crate::metrics::Metrics;
use crate::resolve::{self, FundMatch};

pub mod repository;

pub use repository::Repository;

/// Everything the pipeline hands over for one document.
#[derive(Debug, Clone)]
pub struct DocumentBundle {
    pub doc_id: DocId,
    pub content_hash: String,
    pub source_path: PathBuf,
    pub doc_type: DocType,
    pub classification_confidence: f64,
    pub extraction: Extraction,
    /// Leading text stored on the document row for inspection and
    /// embedding retries.
    pub raw_excerpt: String,
    /// From the discovery root that owns the file.
    pub investor_code: String,
}

/// What the transaction committed.
#[derive(Debug, Clone)]
pub struct PersistReport {
    pub doc_id: DocId,
    pub investor_id: InvestorId,
    pub fund_id: Option<FundId>,
    pub as_of_date: Option<NaiveDate>,
    pub currency: String,
    pub wrote_capital_account: bool,
    /// Set when fact rows landed for a reconcilable key.
    pub reconcile_key: Option<(FundId, NaiveDate)>,
}

type FactKey = (Uuid, Uuid, Option<NaiveDate>);

/// The single write path into the relational store.
pub struct PersistenceWriter {
    pool: PgPool,
    repository: Repository,
    metrics: Arc<Metrics>,
    reporting_currency: String,
    fact_locks: DashMap<FactKey, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter")
            .field("pool_size", &self.pool.size())
            .field("held_keys", &self.fact_locks.len())
            .finish()
    }
}

impl PersistenceWriter {
    pub fn new(pool: PgPool, metrics: Arc<Metrics>, reporting_currency: String) -> Self {
        Self {
            repository: Repository::new(pool.clone()),
            pool,
            metrics,
            reporting_currency,
            fact_locks: DashMap::new(),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    fn lock_for(&self, key: FactKey) -> Arc<Mutex<()>> {
        self.fact_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Commit one document. `force` turns a doc-id conflict into an update
    /// instead of a skip; audits append either way.
    pub async fn persist(
        &self,
        bundle: &DocumentBundle,
        force: bool,
    ) -> Result<PersistReport> {
        let extraction = &bundle.extraction;

        // Currency and extra data-quality audits are decided before the
        // transaction so the audit set is complete.
        let (currency, currency_known) = resolve::normalize_currency(
            extraction.text("reporting_currency"),
            &self.reporting_currency,
        );
        let mut audits = extraction.audits.clone();
        if !currency_known {
            let mut audit = FieldAudit::new(
                bundle.doc_id.clone(),
                "reporting_currency",
                ExtractorTag::Default,
                0.0,
            );
            audit.raw_value = extraction.text("reporting_currency").map(str::to_string);
            audit.normalized_value = Some(currency.clone());
            audit.validation_status = ValidationStatus::Unchecked;
            audit.severity = AuditSeverity::Medium;
            audit.note = Some("unknown currency; defaulted to reporting currency".into());
            audits.push(audit);
        }

        // Identity resolution happens against the current store, outside
        // the transaction; the fund upsert below is conflict-safe anyway.
        let (investor_id, investor_name) = self.ensure_investor(&bundle.investor_code).await?;
        if resolve::investor_name_conflicts(extraction.text("investor_name"), &investor_name)
        {
            let mut audit = FieldAudit::new(
                bundle.doc_id.clone(),
                "investor_name",
                ExtractorTag::Default,
                0.0,
            );
            audit.raw_value = extraction.text("investor_name").map(str::to_string);
            audit.normalized_value = Some(investor_name.clone());
            audit.severity = AuditSeverity::Low;
            audit.note = Some("extracted investor differs from folder identity".into());
            audits.push(audit);
        }

        let fund_match = match extraction.text("fund_name") {
            Some(name) => {
                let existing = self
                    .repository
                    .funds_for_investor(investor_id.to_uuid())
                    .await?;
                Some(resolve::resolve_fund(name, &existing))
            }
            None => None,
        };
        let as_of_date = extraction.date("as_of_date");

        // Serialize fact writes per key. The nil fund slot covers documents
        // whose fund resolves inside the transaction.
        let lock_key: FactKey = (
            match &fund_match {
                Some(FundMatch::Existing { id, .. }) => id.to_uuid(),
                _ => Uuid::nil(),
            },
            investor_id.to_uuid(),
            as_of_date,
        );
        let lock = self.lock_for(lock_key);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let fund_id = match &fund_match {
            Some(FundMatch::Existing { id, .. }) => Some(*id),
            Some(FundMatch::New { name, code }) => Some(
                self.upsert_fund(&mut tx, investor_id, name, code, &currency)
                    .await?,
            ),
            None => None,
        };

        let inserted = self
            .insert_document(&mut tx, bundle, investor_id, fund_id, as_of_date, force)
            .await?;
        if !inserted {
            tx.rollback().await?;
            debug!(doc_id = %bundle.doc_id, "document already persisted");
            return Err(PipelineError::DuplicateDocument {
                doc_id: bundle.doc_id.to_string(),
            });
        }

        let mut wrote_capital_account = false;
        let mut reconcile_key = None;
        if let Some(fund_id) = fund_id {
            reconcile_key = self
                .write_facts(
                    &mut tx,
                    bundle,
                    fund_id,
                    investor_id,
                    as_of_date,
                    &currency,
                    &mut wrote_capital_account,
                )
                .await?;
        }

        for audit in &audits {
            self.append_audit(&mut tx, audit).await?;
        }

        tx.commit().await?;
        Metrics::incr(&self.metrics.persisted);
        info!(
            doc_id = %bundle.doc_id,
            doc_type = %bundle.doc_type,
            fund = ?fund_id,
            as_of = ?as_of_date,
            "document persisted"
        );

        Ok(PersistReport {
            doc_id: bundle.doc_id.clone(),
            investor_id,
            fund_id,
            as_of_date,
            currency,
            wrote_capital_account,
            reconcile_key,
        })
    }

    /// Upsert the investor identified by a root's code. The code is the
    /// identity; the display name never downgrades an existing row.
    async fn ensure_investor(&self, code: &str) -> Result<(InvestorId, String)> {
        let row: (Uuid, String) = sqlx::query_as(
            r#"
            INSERT INTO pe_investor (investor_id, investor_code, investor_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (investor_code)
                DO UPDATE SET updated_at = NOW()
            RETURNING investor_id, investor_name
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(code)
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        Ok((InvestorId(row.0), row.1))
    }

    async fn upsert_fund(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        investor_id: InvestorId,
        name: &str,
        code: &str,
        currency: &str,
    ) -> Result<FundId> {
        let (fund_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO pe_fund_master (fund_id, investor_id, fund_code, fund_name, currency)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (investor_id, fund_code)
                DO UPDATE SET fund_name = EXCLUDED.fund_name, updated_at = NOW()
            RETURNING fund_id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(investor_id.to_uuid())
        .bind(code)
        .bind(name)
        .bind(currency)
        .fetch_one(&mut **tx)
        .await?;
        Ok(FundId(fund_id))
    }

    /// Insert the document row. Returns false on a doc-id conflict without
    /// `force`; with `force` the row is updated in place.
    async fn insert_document(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        bundle: &DocumentBundle,
        investor_id: InvestorId,
        fund_id: Option<FundId>,
        as_of_date: Option<NaiveDate>,
        force: bool,
    ) -> Result<bool> {
        let extraction_error = if bundle.extraction.incomplete {
            Some("required fields missing")
        } else {
            None
        };
        let query = if force {
            r#"
            INSERT INTO pe_document
                (doc_id, content_hash, doc_type, classification_confidence,
                 overall_confidence, source_path, investor_id, fund_id,
                 as_of_date, embedding_status, chunk_count, extraction_error,
                 raw_excerpt)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, $10, $11)
            ON CONFLICT (doc_id) DO UPDATE SET
                doc_type = EXCLUDED.doc_type,
                classification_confidence = EXCLUDED.classification_confidence,
                overall_confidence = EXCLUDED.overall_confidence,
                source_path = EXCLUDED.source_path,
                fund_id = EXCLUDED.fund_id,
                as_of_date = EXCLUDED.as_of_date,
                embedding_status = 'pending',
                extraction_error = EXCLUDED.extraction_error,
                raw_excerpt = EXCLUDED.raw_excerpt,
                updated_at = NOW()
            "#
        } else {
            r#"
            INSERT INTO pe_document
                (doc_id, content_hash, doc_type, classification_confidence,
                 overall_confidence, source_path, investor_id, fund_id,
                 as_of_date, embedding_status, chunk_count, extraction_error,
                 raw_excerpt)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, $10, $11)
            ON CONFLICT (doc_id) DO NOTHING
            "#
        };
        let result = sqlx::query(query)
            .bind(bundle.doc_id.as_str())
            .bind(&bundle.content_hash)
            .bind(bundle.doc_type.as_str())
            .bind(bundle.classification_confidence)
            .bind(bundle.extraction.overall_confidence)
            .bind(bundle.source_path.display().to_string())
            .bind(investor_id.to_uuid())
            .bind(fund_id.map(|f| f.to_uuid()))
            .bind(as_of_date)
            .bind(extraction_error)
            .bind(&bundle.raw_excerpt)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Doc-type-specific fact rows. Append-only tables are keyed by
    /// `source_doc_id`: re-persisting a document replaces its own rows and
    /// never touches other sources.
    #[allow(clippy::too_many_arguments)]
    async fn write_facts(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        bundle: &DocumentBundle,
        fund_id: FundId,
        investor_id: InvestorId,
        as_of_date: Option<NaiveDate>,
        currency: &str,
        wrote_capital_account: &mut bool,
    ) -> Result<Option<(FundId, NaiveDate)>> {
        let extraction = &bundle.extraction;
        self.clear_source_rows(tx, &bundle.doc_id).await?;

        let mut reconcile_key = None;
        match bundle.doc_type {
            DocType::CapitalAccountStatement => {
                let Some(as_of) = as_of_date else {
                    warn!(doc_id = %bundle.doc_id, "capital account without as_of_date; facts skipped");
                    return Ok(None);
                };
                self.upsert_capital_account(
                    tx, bundle, fund_id, investor_id, as_of, currency,
                )
                .await?;
                *wrote_capital_account = true;

                if let Some(ending) = extraction.money("ending_balance") {
                    self.insert_nav_observation(
                        tx,
                        fund_id,
                        NavScope::Investor,
                        as_of,
                        ending,
                        currency,
                        &bundle.doc_id,
                    )
                    .await?;
                }
                for (field, flow_type) in [
                    ("contributions_period", FlowType::Call),
                    ("distributions_period", FlowType::Distribution),
                    ("management_fees_period", FlowType::Fee),
                ] {
                    if let Some(amount) = extraction.money(field) {
                        if amount > 0.0 {
                            self.insert_cashflow(
                                tx,
                                fund_id,
                                Some(investor_id),
                                flow_type,
                                as_of,
                                amount,
                                currency,
                                &bundle.doc_id,
                            )
                            .await?;
                        }
                    }
                }
                reconcile_key = Some((fund_id, as_of));
            }
            DocType::QuarterlyReport | DocType::AnnualReport => {
                let Some(as_of) = as_of_date else {
                    warn!(doc_id = %bundle.doc_id, "report without as_of_date; facts skipped");
                    return Ok(None);
                };
                if let Some(nav) = extraction.money("fund_nav") {
                    self.insert_nav_observation(
                        tx,
                        fund_id,
                        NavScope::Fund,
                        as_of,
                        nav,
                        currency,
                        &bundle.doc_id,
                    )
                    .await?;
                }
                self.insert_performance(tx, bundle, fund_id, as_of).await?;
                reconcile_key = Some((fund_id, as_of));
            }
            DocType::CapitalCallNotice => {
                let flow_date = extraction.date("due_date").or(as_of_date);
                match (extraction.money("call_amount"), flow_date) {
                    (Some(amount), Some(date)) if amount > 0.0 => {
                        self.insert_cashflow(
                            tx,
                            fund_id,
                            None,
                            FlowType::Call,
                            date,
                            amount,
                            currency,
                            &bundle.doc_id,
                        )
                        .await?;
                        reconcile_key = Some((fund_id, date));
                    }
                    _ => {
                        warn!(doc_id = %bundle.doc_id, "capital call without amount or date");
                    }
                }
            }
            DocType::DistributionNotice => {
                let flow_date = extraction.date("payment_date").or(as_of_date);
                match (extraction.money("distribution_amount"), flow_date) {
                    (Some(amount), Some(date)) if amount > 0.0 => {
                        self.insert_cashflow(
                            tx,
                            fund_id,
                            None,
                            FlowType::Distribution,
                            date,
                            amount,
                            currency,
                            &bundle.doc_id,
                        )
                        .await?;
                        reconcile_key = Some((fund_id, date));
                    }
                    _ => {
                        warn!(doc_id = %bundle.doc_id, "distribution without amount or date");
                    }
                }
            }
            DocType::Subscription | DocType::Lpa | DocType::Ppm | DocType::Other => {}
        }
        Ok(reconcile_key)
    }

    /// Remove this document's own append-only rows (idempotent re-persist).
    async fn clear_source_rows(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        doc_id: &DocId,
    ) -> Result<()> {
        for table in [
            "pe_nav_observation",
            "pe_cashflow",
            "pe_performance_metrics",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE source_doc_id = $1"))
                .bind(doc_id.as_str())
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert_capital_account(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        bundle: &DocumentBundle,
        fund_id: FundId,
        investor_id: InvestorId,
        as_of: NaiveDate,
        currency: &str,
    ) -> Result<()> {
        let e = &bundle.extraction;
        let period = Period::from_as_of(as_of);
        sqlx::query(
            r#"
            INSERT INTO pe_capital_account
                (account_id, fund_id, investor_id, as_of_date, period_type,
                 reporting_currency, beginning_balance, ending_balance,
                 contributions_period, distributions_period, distributions_roc,
                 distributions_gain, distributions_income,
                 management_fees_period, partnership_expenses_period,
                 realized_gain_loss_period, unrealized_gain_loss_period,
                 total_commitment, drawn_commitment, unfunded_commitment,
                 validation_status, source_doc_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (fund_id, investor_id, as_of_date) DO UPDATE SET
                period_type = EXCLUDED.period_type,
                reporting_currency = EXCLUDED.reporting_currency,
                beginning_balance = EXCLUDED.beginning_balance,
                ending_balance = EXCLUDED.ending_balance,
                contributions_period = EXCLUDED.contributions_period,
                distributions_period = EXCLUDED.distributions_period,
                distributions_roc = EXCLUDED.distributions_roc,
                distributions_gain = EXCLUDED.distributions_gain,
                distributions_income = EXCLUDED.distributions_income,
                management_fees_period = EXCLUDED.management_fees_period,
                partnership_expenses_period = EXCLUDED.partnership_expenses_period,
                realized_gain_loss_period = EXCLUDED.realized_gain_loss_period,
                unrealized_gain_loss_period = EXCLUDED.unrealized_gain_loss_period,
                total_commitment = EXCLUDED.total_commitment,
                drawn_commitment = EXCLUDED.drawn_commitment,
                unfunded_commitment = EXCLUDED.unfunded_commitment,
                validation_status = EXCLUDED.validation_status,
                source_doc_id = EXCLUDED.source_doc_id,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(fund_id.to_uuid())
        .bind(investor_id.to_uuid())
        .bind(as_of)
        .bind(period.period_type.as_str())
        .bind(currency)
        .bind(e.money("beginning_balance"))
        .bind(e.money("ending_balance"))
        .bind(e.money("contributions_period"))
        .bind(e.money("distributions_period"))
        .bind(e.money("distributions_roc"))
        .bind(e.money("distributions_gain"))
        .bind(e.money("distributions_income"))
        .bind(e.money("management_fees_period"))
        .bind(e.money("partnership_expenses_period"))
        .bind(e.money("realized_gain_loss_period"))
        .bind(e.money("unrealized_gain_loss_period"))
        .bind(e.money("total_commitment"))
        .bind(e.money("drawn_commitment"))
        .bind(e.money("unfunded_commitment"))
        .bind(e.validation_status.as_str())
        .bind(bundle.doc_id.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_nav_observation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        fund_id: FundId,
        scope: NavScope,
        as_of: NaiveDate,
        value: f64,
        currency: &str,
        doc_id: &DocId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pe_nav_observation
                (id, fund_id, scope, as_of_date, value, currency, source_doc_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(fund_id.to_uuid())
        .bind(scope.as_str())
        .bind(as_of)
        .bind(value)
        .bind(currency)
        .bind(doc_id.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_cashflow(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        fund_id: FundId,
        investor_id: Option<InvestorId>,
        flow_type: FlowType,
        flow_date: NaiveDate,
        amount: f64,
        currency: &str,
        doc_id: &DocId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pe_cashflow
                (id, fund_id, investor_id, flow_type, flow_date, amount,
                 currency, source_doc_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(fund_id.to_uuid())
        .bind(investor_id.map(|i| i.to_uuid()))
        .bind(flow_type.as_str())
        .bind(flow_date)
        .bind(amount)
        .bind(currency)
        .bind(doc_id.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_performance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        bundle: &DocumentBundle,
        fund_id: FundId,
        as_of: NaiveDate,
    ) -> Result<()> {
        let e = &bundle.extraction;
        let has_any = e.percent("irr_net").is_some()
            || e.multiple("moic").is_some()
            || e.multiple("tvpi").is_some()
            || e.multiple("dpi").is_some()
            || e.multiple("rvpi").is_some();
        if !has_any {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO pe_performance_metrics
                (id, fund_id, as_of_date, irr_net, moic, tvpi, dpi, rvpi,
                 called_pct, distributed_pct, source_doc_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(fund_id.to_uuid())
        .bind(as_of)
        .bind(e.percent("irr_net"))
        .bind(e.multiple("moic"))
        .bind(e.multiple("tvpi"))
        .bind(e.multiple("dpi"))
        .bind(e.multiple("rvpi"))
        .bind(e.percent("called_pct"))
        .bind(e.percent("distributed_pct"))
        .bind(bundle.doc_id.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn append_audit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        audit: &FieldAudit,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pe_field_audit
                (id, doc_id, field_name, raw_value, normalized_value,
                 extractor_tag, confidence, validation_status, severity,
                 note, is_override, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(audit.doc_id.as_str())
        .bind(&audit.field_name)
        .bind(&audit.raw_value)
        .bind(&audit.normalized_value)
        .bind(audit.extractor_tag.as_str())
        .bind(audit.confidence)
        .bind(audit.validation_status.as_str())
        .bind(audit.severity.as_str())
        .bind(&audit.note)
        .bind(audit.is_override)
        .bind(audit.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
