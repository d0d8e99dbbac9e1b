//! Read-side repository over the relational schema. The reconciliation
//! engine and status reporting consume these; all writes stay with the
//! [`PersistenceWriter`](super::PersistenceWriter).

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use captrace_model::{FundId, ReconciliationFinding};

use crate::error::Result;
use crate::resolve::FundCandidate;

#[derive(Debug, Clone, FromRow)]
pub struct CapitalAccountRecord {
    pub fund_id: Uuid,
    pub investor_id: Uuid,
    pub as_of_date: NaiveDate,
    pub reporting_currency: Option<String>,
    pub beginning_balance: Option<f64>,
    pub ending_balance: Option<f64>,
    pub contributions_period: Option<f64>,
    pub distributions_period: Option<f64>,
    pub management_fees_period: Option<f64>,
    pub partnership_expenses_period: Option<f64>,
    pub realized_gain_loss_period: Option<f64>,
    pub unrealized_gain_loss_period: Option<f64>,
    pub total_commitment: Option<f64>,
    pub drawn_commitment: Option<f64>,
    pub unfunded_commitment: Option<f64>,
    pub validation_status: String,
    pub source_doc_id: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct NavObservationRecord {
    pub fund_id: Uuid,
    pub scope: String,
    pub as_of_date: NaiveDate,
    pub value: f64,
    pub currency: String,
    pub source_doc_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PerformanceRecord {
    pub fund_id: Uuid,
    pub as_of_date: NaiveDate,
    pub irr_net: Option<f64>,
    pub moic: Option<f64>,
    pub tvpi: Option<f64>,
    pub dpi: Option<f64>,
    pub rvpi: Option<f64>,
    pub source_doc_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct CashflowRecord {
    pub fund_id: Uuid,
    pub investor_id: Option<Uuid>,
    pub flow_type: String,
    pub flow_date: NaiveDate,
    pub amount: f64,
    pub currency: String,
    pub source_doc_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub content_hash: String,
    pub doc_type: String,
    pub classification_confidence: f64,
    pub overall_confidence: f64,
    pub source_path: String,
    pub investor_id: Uuid,
    pub fund_id: Option<Uuid>,
    pub as_of_date: Option<NaiveDate>,
    pub embedding_status: String,
    pub chunk_count: i32,
    pub extraction_error: Option<String>,
    pub raw_excerpt: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Read queries over the schema.
#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn funds_for_investor(&self, investor_id: Uuid) -> Result<Vec<FundCandidate>> {
        let rows = sqlx::query_as::<_, (Uuid, String, String)>(
            "SELECT fund_id, fund_name, fund_code FROM pe_fund_master WHERE investor_id = $1",
        )
        .bind(investor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, code)| FundCandidate {
                id: FundId(id),
                name,
                code,
            })
            .collect())
    }

    pub async fn capital_accounts_at(
        &self,
        fund_id: Uuid,
        as_of_date: NaiveDate,
    ) -> Result<Vec<CapitalAccountRecord>> {
        Ok(sqlx::query_as::<_, CapitalAccountRecord>(
            r#"
            SELECT fund_id, investor_id, as_of_date, reporting_currency,
                   beginning_balance, ending_balance, contributions_period,
                   distributions_period, management_fees_period,
                   partnership_expenses_period, realized_gain_loss_period,
                   unrealized_gain_loss_period, total_commitment,
                   drawn_commitment, unfunded_commitment, validation_status,
                   source_doc_id
            FROM pe_capital_account
            WHERE fund_id = $1 AND as_of_date = $2
            "#,
        )
        .bind(fund_id)
        .bind(as_of_date)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Full account history up to and including `through`, oldest first.
    pub async fn capital_account_history(
        &self,
        fund_id: Uuid,
        through: NaiveDate,
    ) -> Result<Vec<CapitalAccountRecord>> {
        Ok(sqlx::query_as::<_, CapitalAccountRecord>(
            r#"
            SELECT fund_id, investor_id, as_of_date, reporting_currency,
                   beginning_balance, ending_balance, contributions_period,
                   distributions_period, management_fees_period,
                   partnership_expenses_period, realized_gain_loss_period,
                   unrealized_gain_loss_period, total_commitment,
                   drawn_commitment, unfunded_commitment, validation_status,
                   source_doc_id
            FROM pe_capital_account
            WHERE fund_id = $1 AND as_of_date <= $2
            ORDER BY as_of_date
            "#,
        )
        .bind(fund_id)
        .bind(through)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn nav_observations(
        &self,
        fund_id: Uuid,
        as_of_date: NaiveDate,
    ) -> Result<Vec<NavObservationRecord>> {
        Ok(sqlx::query_as::<_, NavObservationRecord>(
            r#"
            SELECT fund_id, scope, as_of_date, value, currency, source_doc_id
            FROM pe_nav_observation
            WHERE fund_id = $1 AND as_of_date = $2
            ORDER BY created_at
            "#,
        )
        .bind(fund_id)
        .bind(as_of_date)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn latest_performance(
        &self,
        fund_id: Uuid,
        as_of_date: NaiveDate,
    ) -> Result<Option<PerformanceRecord>> {
        Ok(sqlx::query_as::<_, PerformanceRecord>(
            r#"
            SELECT fund_id, as_of_date, irr_net, moic, tvpi, dpi, rvpi,
                   source_doc_id
            FROM pe_performance_metrics
            WHERE fund_id = $1 AND as_of_date = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(fund_id)
        .bind(as_of_date)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn cashflows_through(
        &self,
        fund_id: Uuid,
        through: NaiveDate,
    ) -> Result<Vec<CashflowRecord>> {
        Ok(sqlx::query_as::<_, CashflowRecord>(
            r#"
            SELECT fund_id, investor_id, flow_type, flow_date, amount,
                   currency, source_doc_id
            FROM pe_cashflow
            WHERE fund_id = $1 AND flow_date <= $2
            ORDER BY flow_date
            "#,
        )
        .bind(fund_id)
        .bind(through)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn insert_findings(&self, findings: &[ReconciliationFinding]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for finding in findings {
            sqlx::query(
                r#"
                INSERT INTO pe_reconciliation_finding
                    (id, fund_id, as_of_date, reconciliation_type, severity,
                     status, details, recommendations, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(finding.fund_ref.to_uuid())
            .bind(finding.as_of_date)
            .bind(finding.reconciliation_type.as_str())
            .bind(finding.severity.as_str())
            .bind(finding.status.as_str())
            .bind(&finding.details)
            .bind(serde_json::json!(finding.recommendations))
            .bind(finding.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fund/date pairs with document activity since `since`, for the
    /// nightly reconciliation sweep.
    pub async fn funds_with_recent_activity(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, NaiveDate)>> {
        Ok(sqlx::query_as::<_, (Uuid, NaiveDate)>(
            r#"
            SELECT DISTINCT fund_id, as_of_date
            FROM pe_document
            WHERE fund_id IS NOT NULL
              AND as_of_date IS NOT NULL
              AND updated_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn update_embedding_status(
        &self,
        doc_id: &str,
        status: &str,
        chunk_count: i32,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pe_document
            SET embedding_status = $2, chunk_count = $3,
                extraction_error = COALESCE($4, extraction_error),
                updated_at = NOW()
            WHERE doc_id = $1
            "#,
        )
        .bind(doc_id)
        .bind(status)
        .bind(chunk_count)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn document(&self, doc_id: &str) -> Result<Option<DocumentRecord>> {
        Ok(sqlx::query_as::<_, DocumentRecord>(
            r#"
            SELECT doc_id, content_hash, doc_type, classification_confidence,
                   overall_confidence, source_path, investor_id, fund_id,
                   as_of_date, embedding_status, chunk_count,
                   extraction_error, raw_excerpt, created_at
            FROM pe_document
            WHERE doc_id = $1
            "#,
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Documents whose chunks never made it into the vector index.
    pub async fn failed_embedding_documents(
        &self,
        limit: i64,
    ) -> Result<Vec<DocumentRecord>> {
        Ok(sqlx::query_as::<_, DocumentRecord>(
            r#"
            SELECT doc_id, content_hash, doc_type, classification_confidence,
                   overall_confidence, source_path, investor_id, fund_id,
                   as_of_date, embedding_status, chunk_count,
                   extraction_error, raw_excerpt, created_at
            FROM pe_document
            WHERE embedding_status = 'failed'
            ORDER BY updated_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn findings_for(
        &self,
        fund_id: Uuid,
        as_of_date: NaiveDate,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pe_reconciliation_finding WHERE fund_id = $1 AND as_of_date = $2",
        )
        .bind(fund_id)
        .bind(as_of_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Document counts and mean confidence per classified type.
    pub async fn documents_by_type(&self) -> Result<Vec<DocTypeCount>> {
        Ok(sqlx::query_as::<_, DocTypeCount>(
            r#"
            SELECT doc_type, COUNT(*) AS count,
                   AVG(overall_confidence) AS avg_confidence
            FROM pe_document
            GROUP BY doc_type
            ORDER BY count DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Document totals per investor root.
    pub async fn documents_per_investor(&self) -> Result<Vec<InvestorDocCount>> {
        Ok(sqlx::query_as::<_, InvestorDocCount>(
            r#"
            SELECT i.investor_code, COUNT(d.doc_id) AS count
            FROM pe_investor i
            LEFT JOIN pe_document d ON d.investor_id = i.investor_id
            GROUP BY i.investor_code
            ORDER BY i.investor_code
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Most recently ingested documents, newest first.
    pub async fn recent_documents(&self, limit: i64) -> Result<Vec<DocumentRecord>> {
        Ok(sqlx::query_as::<_, DocumentRecord>(
            r#"
            SELECT doc_id, content_hash, doc_type, classification_confidence,
                   overall_confidence, source_path, investor_id, fund_id,
                   as_of_date, embedding_status, chunk_count,
                   extraction_error, raw_excerpt, created_at
            FROM pe_document
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Audit rows for one document, oldest first (overrides append, so the
    /// last row per field is authoritative).
    pub async fn field_audits(&self, doc_id: &str) -> Result<Vec<FieldAuditRecord>> {
        Ok(sqlx::query_as::<_, FieldAuditRecord>(
            r#"
            SELECT doc_id, field_name, raw_value, normalized_value,
                   extractor_tag, confidence, validation_status, severity,
                   note, is_override, created_at
            FROM pe_field_audit
            WHERE doc_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DocTypeCount {
    pub doc_type: String,
    pub count: i64,
    pub avg_confidence: Option<f64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct InvestorDocCount {
    pub investor_code: String,
    pub count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct FieldAuditRecord {
    pub doc_id: String,
    pub field_name: String,
    pub raw_value: Option<String>,
    pub normalized_value: Option<String>,
    pub extractor_tag: String,
    pub confidence: f64,
    pub validation_status: String,
    pub severity: String,
    pub note: Option<String>,
    pub is_override: bool,
    pub created_at: DateTime<Utc>,
}
