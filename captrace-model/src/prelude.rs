//! Convenience imports for consumers that want the whole model surface.

pub use crate::audit::{AuditSeverity, ExtractorTag, FieldAudit, ValidationStatus};
pub use crate::document::{DocType, Document, EmbeddingStatus};
pub use crate::error::{ModelError, Result as ModelResult};
pub use crate::facts::{
    last_day_of_month, CapitalAccountRow, Cashflow, FlowType, NavObservation,
    NavScope, PerformanceMetrics, Period, PeriodType,
};
pub use crate::file_record::{FileRecord, FileState, TransitionError};
pub use crate::finding::{
    CheckStatus, ReconciliationFinding, ReconciliationRun, ReconciliationType,
    Severity,
};
pub use crate::ids::{DocId, FundId, InvestorId, PeriodId};
