//! Retry policy for analysis records.
//!
//! A record can be picked up again when it failed, when it has sat in
//! progress or in token calculation longer than the timeout, and only
//! after an exponential backoff of `initial_backoff_hours * 2^retry_count`
//! since its last update. Records that reached `max_retries` stay put.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AnalysisRecord, AnalysisStatus};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff before the first retry, doubled after each one
    #[serde(default = "default_initial_backoff_hours")]
    pub initial_backoff_hours: i64,

    /// Retries allowed per version (attempts = max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Hours without an update before an in-flight record counts as stuck
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: i64,
}

fn default_initial_backoff_hours() -> i64 {
    6
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_hours() -> i64 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_hours: default_initial_backoff_hours(),
            max_retries: default_max_retries(),
            timeout_hours: default_timeout_hours(),
        }
    }
}

/// What a retry pass does with an eligible record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Stuck before cost estimation: finish Prepare on the same record
    ResumeInPlace,

    /// Failed: create a successor and trigger it
    Successor,

    /// Stuck in progress: fail it first, then create a successor
    FailStaleThenSuccessor,
}

impl RetryPolicy {
    /// Backoff owed after `retry_count` retries
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2i64.checked_pow(retry_count).unwrap_or(i64::MAX);
        Duration::hours(self.initial_backoff_hours.saturating_mul(factor).min(24 * 365 * 100))
    }

    pub fn next_attempt_at(&self, record: &AnalysisRecord) -> DateTime<Utc> {
        record.updated_at + self.backoff(record.retry_count)
    }

    fn is_stale(&self, record: &AnalysisRecord, now: DateTime<Utc>) -> bool {
        now - record.updated_at > Duration::hours(self.timeout_hours)
    }

    /// Records in flight and last updated before this instant are stuck
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(self.timeout_hours)
    }

    /// Decide whether and how `record` is retried at `now`
    pub fn plan(&self, record: &AnalysisRecord, now: DateTime<Utc>) -> Option<RetryAction> {
        if record.retry_count >= self.max_retries || record.superseded_by.is_some() {
            return None;
        }

        let action = match record.status {
            AnalysisStatus::AnalysisFailed => RetryAction::Successor,
            AnalysisStatus::AnalysisInProgress if self.is_stale(record, now) => {
                RetryAction::FailStaleThenSuccessor
            }
            AnalysisStatus::PendingTokenCalculation if self.is_stale(record, now) => {
                RetryAction::ResumeInPlace
            }
            _ => return None,
        };

        if now < self.next_attempt_at(record) {
            return None;
        }
        Some(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: AnalysisStatus, retry_count: u32, hours_ago: i64, now: DateTime<Utc>) -> AnalysisRecord {
        let mut record = AnalysisRecord::new("CN", 1);
        record.status = status;
        record.retry_count = retry_count;
        record.updated_at = now - Duration::hours(hours_ago);
        record
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            initial_backoff_hours: 2,
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::hours(2));
        assert_eq!(policy.backoff(1), Duration::hours(4));
        assert_eq!(policy.backoff(3), Duration::hours(16));
        // huge retry counts saturate instead of overflowing
        assert!(policy.backoff(80) > Duration::hours(16));
    }

    #[test]
    fn test_failed_record_waits_for_backoff() {
        let now = Utc::now();
        let policy = RetryPolicy {
            initial_backoff_hours: 2,
            max_retries: 3,
            timeout_hours: 1,
        };

        // retry_count 1 -> 4 hours
        assert_eq!(policy.plan(&record(AnalysisStatus::AnalysisFailed, 1, 3, now), now), None);
        assert_eq!(
            policy.plan(&record(AnalysisStatus::AnalysisFailed, 1, 5, now), now),
            Some(RetryAction::Successor)
        );
    }

    #[test]
    fn test_max_retries_is_final() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        let exhausted = record(AnalysisStatus::AnalysisFailed, 3, 10_000, now);
        assert_eq!(policy.plan(&exhausted, now), None);
    }

    #[test]
    fn test_stuck_records() {
        let now = Utc::now();
        let policy = RetryPolicy {
            initial_backoff_hours: 1,
            max_retries: 3,
            timeout_hours: 2,
        };

        assert_eq!(policy.plan(&record(AnalysisStatus::AnalysisInProgress, 0, 1, now), now), None);
        assert_eq!(
            policy.plan(&record(AnalysisStatus::AnalysisInProgress, 0, 3, now), now),
            Some(RetryAction::FailStaleThenSuccessor)
        );
        assert_eq!(
            policy.plan(&record(AnalysisStatus::PendingTokenCalculation, 0, 3, now), now),
            Some(RetryAction::ResumeInPlace)
        );
        assert_eq!(policy.plan(&record(AnalysisStatus::PendingAnalysis, 0, 100, now), now), None);
        assert_eq!(policy.plan(&record(AnalysisStatus::AnalysisSuccessful, 0, 100, now), now), None);
    }

    #[test]
    fn test_superseded_record_is_skipped() {
        let now = Utc::now();
        let mut failed = record(AnalysisStatus::AnalysisFailed, 0, 100, now);
        failed.superseded_by = Some(uuid::Uuid::new_v4());
        assert_eq!(RetryPolicy::default().plan(&failed, now), None);
    }
}
