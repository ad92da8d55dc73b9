//! Analysis records, their status history and the budget ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an analysis record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    /// Record created, documents uploaded, cost not yet estimated
    PendingTokenCalculation,

    /// Cost estimated, waiting for the scheduler
    PendingAnalysis,

    /// Handed to a worker
    AnalysisInProgress,

    /// Result persisted
    AnalysisSuccessful,

    /// Terminal failure of this attempt
    AnalysisFailed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingTokenCalculation => "PENDING_TOKEN_CALCULATION",
            Self::PendingAnalysis => "PENDING_ANALYSIS",
            Self::AnalysisInProgress => "ANALYSIS_IN_PROGRESS",
            Self::AnalysisSuccessful => "ANALYSIS_SUCCESSFUL",
            Self::AnalysisFailed => "ANALYSIS_FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AnalysisSuccessful | Self::AnalysisFailed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: AnalysisStatus) -> bool {
        use AnalysisStatus::*;
        matches!(
            (self, next),
            (PendingTokenCalculation, PendingAnalysis)
                | (PendingTokenCalculation, PendingTokenCalculation)
                | (PendingAnalysis, AnalysisInProgress)
                | (AnalysisInProgress, AnalysisSuccessful)
                | (AnalysisInProgress, AnalysisFailed)
        )
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_TOKEN_CALCULATION" => Ok(Self::PendingTokenCalculation),
            "PENDING_ANALYSIS" => Ok(Self::PendingAnalysis),
            "ANALYSIS_IN_PROGRESS" => Ok(Self::AnalysisInProgress),
            "ANALYSIS_SUCCESSFUL" => Ok(Self::AnalysisSuccessful),
            "ANALYSIS_FAILED" => Ok(Self::AnalysisFailed),
            other => Err(format!("unknown analysis status: {}", other)),
        }
    }
}

/// Monetary breakdown of one analysis, in the configured currency
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub thinking_cost: f64,
    pub search_cost: f64,
    pub total_cost: f64,
}

/// Token counts of one analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
}

/// One analysis attempt for a procurement version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: Uuid,

    pub control_number: String,

    pub version_number: i64,

    pub status: AnalysisStatus,

    /// 0 for the first attempt, incremented by each retry
    pub retry_count: u32,

    /// Hash of the included, normalized document set
    pub document_hash: Option<String>,

    pub tokens: TokenUsage,

    pub costs: CostBreakdown,

    /// Structured result returned by the completion engine
    pub result: Option<serde_json::Value>,

    /// Prompt sent (or to be sent) to the completion engine
    pub prompt: Option<String>,

    /// Warnings attached to the prompt (dropped files and the like)
    #[serde(default)]
    pub warnings: Vec<String>,

    /// Successor record created by a retry
    pub superseded_by: Option<Uuid>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// Fresh record at the start of Prepare
    pub fn new(control_number: impl Into<String>, version_number: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            control_number: control_number.into(),
            version_number,
            status: AnalysisStatus::PendingTokenCalculation,
            retry_count: 0,
            document_hash: None,
            tokens: TokenUsage::default(),
            costs: CostBreakdown::default(),
            result: None,
            prompt: None,
            warnings: Vec::new(),
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Successor attempt: same version, same documents, retry_count + 1
    pub fn successor(&self) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            control_number: self.control_number.clone(),
            version_number: self.version_number,
            status: AnalysisStatus::PendingAnalysis,
            retry_count: self.retry_count + 1,
            document_hash: self.document_hash.clone(),
            tokens: self.tokens,
            costs: self.costs,
            result: None,
            prompt: self.prompt.clone(),
            warnings: self.warnings.clone(),
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only record of a status transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub status: AnalysisStatus,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusHistoryEntry {
    pub fn new(analysis_id: Uuid, status: AnalysisStatus, details: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            analysis_id,
            status,
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Ledger entry direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    Donation,
    Expense,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Donation => "DONATION",
            Self::Expense => "EXPENSE",
        }
    }
}

impl FromStr for LedgerEntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DONATION" => Ok(Self::Donation),
            "EXPENSE" => Ok(Self::Expense),
            other => Err(format!("unknown ledger entry type: {}", other)),
        }
    }
}

/// Append-only financial record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedgerEntry {
    pub id: Uuid,
    pub entry_type: LedgerEntryType,
    pub amount: f64,
    /// Analysis the expense paid for
    pub analysis_id: Option<Uuid>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl BudgetLedgerEntry {
    pub fn expense(analysis_id: Uuid, amount: f64, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry_type: LedgerEntryType::Expense,
            amount,
            analysis_id: Some(analysis_id),
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    pub fn donation(amount: f64, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry_type: LedgerEntryType::Donation,
            amount,
            analysis_id: None,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use AnalysisStatus::*;

        assert!(PendingTokenCalculation.can_transition_to(PendingAnalysis));
        assert!(PendingAnalysis.can_transition_to(AnalysisInProgress));
        assert!(AnalysisInProgress.can_transition_to(AnalysisSuccessful));
        assert!(AnalysisInProgress.can_transition_to(AnalysisFailed));

        assert!(!PendingAnalysis.can_transition_to(AnalysisSuccessful));
        assert!(!AnalysisFailed.can_transition_to(AnalysisInProgress));
        assert!(!AnalysisSuccessful.can_transition_to(AnalysisFailed));
    }

    #[test]
    fn test_successor_carries_documents_forward() {
        let mut record = AnalysisRecord::new("CN-1", 3);
        record.document_hash = Some("abc".to_string());
        record.tokens.input_tokens = 1200;
        record.status = AnalysisStatus::AnalysisFailed;

        let next = record.successor();
        assert_ne!(next.id, record.id);
        assert_eq!(next.retry_count, 1);
        assert_eq!(next.version_number, 3);
        assert_eq!(next.status, AnalysisStatus::PendingAnalysis);
        assert_eq!(next.document_hash.as_deref(), Some("abc"));
        assert_eq!(next.tokens.input_tokens, 1200);
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&AnalysisStatus::PendingTokenCalculation).unwrap();
        assert_eq!(json, "\"PENDING_TOKEN_CALCULATION\"");
        assert_eq!(
            "ANALYSIS_IN_PROGRESS".parse::<AnalysisStatus>().unwrap(),
            AnalysisStatus::AnalysisInProgress
        );
    }
}
