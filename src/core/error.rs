//! Pipeline error taxonomy.
//!
//! Stage-local failures (extraction, conversion) never escape their stage;
//! they turn into typed exclusions on the affected file. The variants here
//! are what reaches the orchestrator and its batch drivers.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::AnalysisStatus;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or storage hiccup, recovered by the Retry transition
    #[error("Transient I/O failure: {0}")]
    Transient(String),

    /// Malformed upstream record, the item is skipped
    #[error("Invalid upstream record: {0}")]
    Validation(String),

    /// Archive could not be opened (only surfaces in logs; the blob degrades to a leaf)
    #[error("Extraction failed for '{path}': {reason}")]
    Extraction { path: String, reason: String },

    /// Every conversion route failed for a file
    #[error("Conversion failed for '{path}': {reason}")]
    Conversion { path: String, reason: String },

    /// Completion engine returned a blocked, empty or unparsable answer
    #[error("Completion engine error: {0}")]
    Completion(String),

    /// A compare-and-set transition lost the race or started from the wrong state
    #[error("Transition rejected for analysis {analysis_id}: expected {expected}, found {found}")]
    TransitionRejected {
        analysis_id: Uuid,
        expected: AnalysisStatus,
        found: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl PipelineError {
    /// Whether the Retry transition may pick the failed record up again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Completion(_))
    }

    /// Wrap any error as transient, keeping its full context chain
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::Transient("timeout".into()).is_retryable());
        assert!(PipelineError::Completion("empty".into()).is_retryable());
        assert!(!PipelineError::Validation("bad".into()).is_retryable());
        assert!(!PipelineError::NotFound {
            entity: "analysis",
            id: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_rejection_message_names_states() {
        let err = PipelineError::TransitionRejected {
            analysis_id: Uuid::nil(),
            expected: AnalysisStatus::PendingAnalysis,
            found: "ANALYSIS_IN_PROGRESS".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("PENDING_ANALYSIS"));
        assert!(msg.contains("ANALYSIS_IN_PROGRESS"));
    }
}
