//! Core pipeline logic.
//!
//! This module contains:
//! - Extractor / Normalizer: archive expansion and format conversion
//! - Hasher: procurement identity and document-set digests
//! - Selector / Prompt: token-bounded file selection and prompt assembly
//! - Pricing / Ranking / Scheduler: cost estimation, scoring and budget allocation
//! - Retry: backoff and retry planning
//! - Orchestrator: the analysis state machine and its batch drivers

pub mod error;
pub mod extractor;
pub mod hasher;
pub mod limits;
pub mod normalizer;
pub mod orchestrator;
pub mod pricing;
pub mod prompt;
pub mod ranking;
pub mod retry;
pub mod scheduler;
pub mod selector;

// Re-export commonly used types
pub use error::PipelineError;
pub use extractor::{ExtractedFile, Extractor};
pub use limits::{ExtractionLimits, LimitViolation};
pub use normalizer::Normalizer;
pub use orchestrator::{
    BatchReport, BudgetSource, Orchestrator, OverallStatus, PrepareOutcome, ProcessOutcome, RankedRun,
    TriggerOutcome,
};
pub use pricing::PricingConfig;
pub use ranking::RankingConfig;
pub use retry::{RetryAction, RetryPolicy};
pub use scheduler::{allocate, auto_budget, Allocation, BudgetPeriod, BudgetPlan, RankedCandidate};
pub use selector::{select, Selection};
