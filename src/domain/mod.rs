//! Domain types for the procurement pipeline.
//!
//! This module contains the core data structures:
//! - Procurement: Typed registry envelope and its immutable versions
//! - Analysis: Analysis records, status history, budget ledger
//! - Candidate: Files flowing through extraction, normalization and selection

pub mod analysis;
pub mod candidate;
pub mod procurement;

// Re-export commonly used types
pub use analysis::{
    AnalysisRecord, AnalysisStatus, BudgetLedgerEntry, CostBreakdown, LedgerEntryType,
    StatusHistoryEntry, TokenUsage,
};
pub use candidate::{
    Disposition, ExclusionReason, FileCandidate, Modality, NormalizedPart, PrioritizationLogic,
};
pub use procurement::{
    order_documents, Procurement, ProcurementVersion, RankingScores, RawDocumentMeta,
    SourceDocument,
};
