//! tenderwatch - Procurement document analysis pipeline
//!
//! Watches the public procurement registry, turns each procurement's
//! attachments into a bounded set of AI-readable files, and schedules
//! paid AI analyses under a donation-funded budget.
//!
//! # Architecture
//!
//! Every analysis attempt is a record moving through a persisted state
//! machine:
//! - `PENDING_TOKEN_CALCULATION`: documents extracted and uploaded
//! - `PENDING_ANALYSIS`: files selected, cost estimated, waiting for budget
//! - `ANALYSIS_IN_PROGRESS`: handed to a queue worker
//! - `ANALYSIS_SUCCESSFUL` / `ANALYSIS_FAILED`
//!
//! Transitions are compare-and-set writes, so concurrent workers and retry
//! passes never double-process a version.
//!
//! # Modules
//!
//! - `adapters`: Registry, completion engine, blob store, work queue, converter
//! - `core`: Extraction, normalization, selection, scoring, orchestration
//! - `domain`: Procurements, analysis records, file candidates
//! - `store`: SQLite persistence
//! - `worker`: Queue consumer
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Prepare yesterday's registry updates
//! tenderwatch prepare --start-date 2025-03-01 --end-date 2025-03-01
//!
//! # Spend today's share of donations on the best-ranked procurements
//! tenderwatch rank --auto-budget --budget-period daily
//!
//! # Run the analyses
//! tenderwatch worker --until-idle
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;
pub mod worker;

// Re-export main types at crate root for convenience
pub use config::Settings;
pub use core::{Orchestrator, PipelineError};
pub use domain::{AnalysisRecord, AnalysisStatus, FileCandidate, Procurement};
pub use store::Store;
