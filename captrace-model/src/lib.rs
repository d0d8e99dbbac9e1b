//! Core data model definitions shared across captrace crates.
#![allow(missing_docs)]

pub mod audit;
pub mod document;
pub mod error;
pub mod facts;
pub mod file_record;
pub mod finding;
pub mod ids;
pub mod prelude;

// Intentionally curated re-exports for downstream consumers.
pub use audit::{AuditSeverity, ExtractorTag, FieldAudit, ValidationStatus};
pub use document::{DocType, Document, EmbeddingStatus};
pub use error::{ModelError, Result as ModelResult};
pub use facts::{
    CapitalAccountRow, Cashflow, FlowType, NavObservation, NavScope,
    PerformanceMetrics, Period, PeriodType,
};
pub use file_record::{FileRecord, FileState, TransitionError};
pub use finding::{
    CheckStatus, ReconciliationFinding, ReconciliationRun, ReconciliationType,
    Severity,
};
pub use ids::{DocId, FundId, InvestorId, PeriodId};
