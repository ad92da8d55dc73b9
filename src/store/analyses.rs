//! Analysis records and their compare-and-set transitions.
//!
//! Every status change is a single `UPDATE ... WHERE id = ? AND status = ?`
//! inside a transaction that also appends the history row. A return value
//! of `false` means another writer got there first.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    AnalysisRecord, AnalysisStatus, BudgetLedgerEntry, CostBreakdown, StatusHistoryEntry, TokenUsage,
};

use super::{files, history, ledger, parse_enum, parse_json, parse_ts, parse_uuid, ts, Store};

const ANALYSIS_COLUMNS: &str = "id, control_number, version_number, status, retry_count, document_hash, \
     input_tokens, output_tokens, thinking_tokens, input_cost, output_cost, thinking_cost, search_cost, \
     total_cost, result, prompt, warnings, superseded_by, created_at, updated_at";

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisRecord> {
    let result = match row.get::<_, Option<String>>(14)? {
        Some(text) => Some(parse_json::<Value>(&text)?),
        None => None,
    };
    let superseded_by = match row.get::<_, Option<String>>(17)? {
        Some(id) => Some(parse_uuid(&id)?),
        None => None,
    };

    Ok(AnalysisRecord {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        control_number: row.get(1)?,
        version_number: row.get(2)?,
        status: parse_enum(&row.get::<_, String>(3)?)?,
        retry_count: row.get(4)?,
        document_hash: row.get(5)?,
        tokens: TokenUsage {
            input_tokens: row.get::<_, i64>(6)?.max(0) as u64,
            output_tokens: row.get::<_, i64>(7)?.max(0) as u64,
            thinking_tokens: row.get::<_, i64>(8)?.max(0) as u64,
        },
        costs: CostBreakdown {
            input_cost: row.get(9)?,
            output_cost: row.get(10)?,
            thinking_cost: row.get(11)?,
            search_cost: row.get(12)?,
            total_cost: row.get(13)?,
        },
        result,
        prompt: row.get(15)?,
        warnings: parse_json(&row.get::<_, String>(16)?)?,
        superseded_by,
        created_at: parse_ts(&row.get::<_, String>(18)?)?,
        updated_at: parse_ts(&row.get::<_, String>(19)?)?,
    })
}

fn insert_record(conn: &Connection, record: &AnalysisRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO analyses ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            ANALYSIS_COLUMNS
        ),
        params![
            record.id.to_string(),
            record.control_number,
            record.version_number,
            record.status.as_str(),
            record.retry_count,
            record.document_hash,
            record.tokens.input_tokens as i64,
            record.tokens.output_tokens as i64,
            record.tokens.thinking_tokens as i64,
            record.costs.input_cost,
            record.costs.output_cost,
            record.costs.thinking_cost,
            record.costs.search_cost,
            record.costs.total_cost,
            record.result.as_ref().map(Value::to_string),
            record.prompt,
            serde_json::to_string(&record.warnings)?,
            record.superseded_by.map(|id| id.to_string()),
            ts(record.created_at),
            ts(record.updated_at),
        ],
    )
    .with_context(|| format!("Failed to insert analysis {}", record.id))?;
    Ok(())
}

/// The partial unique index on in-progress analyses fired
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// A pending analysis joined with what the ranked run needs from its version
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAnalysis {
    pub analysis_id: Uuid,
    pub control_number: String,
    pub version_number: i64,
    pub region: String,
    pub votes: i64,
    pub priority_score: i64,
    pub estimated_cost: f64,
    pub last_update_date: DateTime<Utc>,
}

impl Store {
    /// Insert a new record together with its first history entry
    pub fn insert_analysis(&self, record: &AnalysisRecord, details: Option<String>) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        insert_record(&tx, record)?;
        history::append(&tx, &StatusHistoryEntry::new(record.id, record.status, details))?;
        tx.commit().context("Failed to commit new analysis")
    }

    pub fn get_analysis(&self, id: Uuid) -> Result<Option<AnalysisRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM analyses WHERE id = ?1", ANALYSIS_COLUMNS),
            params![id.to_string()],
            analysis_from_row,
        )
        .optional()
        .with_context(|| format!("Failed to load analysis {}", id))
    }

    /// Every record of a procurement, oldest first
    pub fn analyses_for(&self, control_number: &str) -> Result<Vec<AnalysisRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM analyses WHERE control_number = ?1 ORDER BY created_at, rowid",
            ANALYSIS_COLUMNS
        ))?;
        let rows = stmt.query_map(params![control_number], analysis_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to list analyses of {}", control_number))
    }

    /// Compare-and-set status change.
    ///
    /// Returns `false` when the record is not in `from`, or when entering
    /// ANALYSIS_IN_PROGRESS would give the version a second in-flight record.
    pub fn transition(
        &self,
        id: Uuid,
        from: AnalysisStatus,
        to: AnalysisStatus,
        details: Option<String>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE analyses SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
            params![id.to_string(), from.as_str(), to.as_str(), ts(Utc::now())],
        );

        match updated {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                debug!(analysis_id = %id, "Another record of this version is already in progress");
                return Ok(false);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to move {} to {}", id, to)),
        }

        history::append(&tx, &StatusHistoryEntry::new(id, to, details))?;
        tx.commit().context("Failed to commit transition")?;
        Ok(true)
    }

    /// Fail an in-progress record only if it is still older than `stale_before`
    pub fn fail_stale(&self, id: Uuid, stale_before: DateTime<Utc>, details: String) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let updated = tx
            .execute(
                "UPDATE analyses SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'ANALYSIS_IN_PROGRESS' AND updated_at < ?4",
                params![
                    id.to_string(),
                    AnalysisStatus::AnalysisFailed.as_str(),
                    ts(Utc::now()),
                    ts(stale_before)
                ],
            )
            .context("Failed to fail stale analysis")?;
        if updated == 0 {
            return Ok(false);
        }
        history::append(
            &tx,
            &StatusHistoryEntry::new(id, AnalysisStatus::AnalysisFailed, Some(details)),
        )?;
        tx.commit().context("Failed to commit stale failure")?;
        Ok(true)
    }

    /// Claim a record stuck in token calculation for an in-place resume.
    ///
    /// Guarded on the `updated_at` the caller observed, so only one retry
    /// pass wins; the winner bumps `retry_count`.
    pub fn claim_for_resume(&self, id: Uuid, observed_updated_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let updated = tx
            .execute(
                "UPDATE analyses SET retry_count = retry_count + 1, updated_at = ?2
                 WHERE id = ?1 AND status = 'PENDING_TOKEN_CALCULATION' AND updated_at = ?3",
                params![id.to_string(), ts(Utc::now()), ts(observed_updated_at)],
            )
            .context("Failed to claim analysis for resume")?;
        if updated == 0 {
            return Ok(false);
        }
        history::append(
            &tx,
            &StatusHistoryEntry::new(
                id,
                AnalysisStatus::PendingTokenCalculation,
                Some("Resuming token calculation".to_string()),
            ),
        )?;
        tx.commit().context("Failed to commit resume claim")?;
        Ok(true)
    }

    /// Store the preparation outcome and move PENDING_TOKEN_CALCULATION to PENDING_ANALYSIS
    pub fn finish_preparation(
        &self,
        id: Uuid,
        document_hash: &str,
        tokens: TokenUsage,
        costs: CostBreakdown,
        prompt: &str,
        warnings: &[String],
    ) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let updated = tx
            .execute(
                "UPDATE analyses SET status = ?2, document_hash = ?3, input_tokens = ?4,
                     input_cost = ?5, output_cost = ?6, thinking_cost = ?7, search_cost = ?8,
                     total_cost = ?9, prompt = ?10, warnings = ?11, updated_at = ?12
                 WHERE id = ?1 AND status = 'PENDING_TOKEN_CALCULATION'",
                params![
                    id.to_string(),
                    AnalysisStatus::PendingAnalysis.as_str(),
                    document_hash,
                    tokens.input_tokens as i64,
                    costs.input_cost,
                    costs.output_cost,
                    costs.thinking_cost,
                    costs.search_cost,
                    costs.total_cost,
                    prompt,
                    serde_json::to_string(warnings)?,
                    ts(Utc::now()),
                ],
            )
            .context("Failed to finish preparation")?;
        if updated == 0 {
            return Ok(false);
        }
        history::append(
            &tx,
            &StatusHistoryEntry::new(
                id,
                AnalysisStatus::PendingAnalysis,
                Some(format!("Estimated cost {:.4}", costs.total_cost)),
            ),
        )?;
        tx.commit().context("Failed to commit preparation")?;
        Ok(true)
    }

    /// Persist a result and move ANALYSIS_IN_PROGRESS to ANALYSIS_SUCCESSFUL,
    /// recording the expense in the same transaction when given
    pub fn save_result(
        &self,
        id: Uuid,
        result: &Value,
        tokens: TokenUsage,
        costs: CostBreakdown,
        expense: Option<&BudgetLedgerEntry>,
        details: Option<String>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let updated = tx
            .execute(
                "UPDATE analyses SET status = ?2, result = ?3, input_tokens = ?4, output_tokens = ?5,
                     thinking_tokens = ?6, input_cost = ?7, output_cost = ?8, thinking_cost = ?9,
                     search_cost = ?10, total_cost = ?11, updated_at = ?12
                 WHERE id = ?1 AND status = 'ANALYSIS_IN_PROGRESS'",
                params![
                    id.to_string(),
                    AnalysisStatus::AnalysisSuccessful.as_str(),
                    result.to_string(),
                    tokens.input_tokens as i64,
                    tokens.output_tokens as i64,
                    tokens.thinking_tokens as i64,
                    costs.input_cost,
                    costs.output_cost,
                    costs.thinking_cost,
                    costs.search_cost,
                    costs.total_cost,
                    ts(Utc::now()),
                ],
            )
            .context("Failed to save analysis result")?;
        if updated == 0 {
            return Ok(false);
        }
        if let Some(entry) = expense {
            ledger::insert(&tx, entry).context("Failed to record expense")?;
        }
        history::append(
            &tx,
            &StatusHistoryEntry::new(id, AnalysisStatus::AnalysisSuccessful, details),
        )?;
        tx.commit().context("Failed to commit analysis result")?;
        Ok(true)
    }

    /// A successful record of the same procurement that analyzed the same documents
    pub fn find_successful_by_document_hash(
        &self,
        control_number: &str,
        document_hash: &str,
        exclude: Uuid,
    ) -> Result<Option<AnalysisRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM analyses
                 WHERE control_number = ?1 AND document_hash = ?2 AND id != ?3
                   AND status = 'ANALYSIS_SUCCESSFUL' AND result IS NOT NULL
                 ORDER BY updated_at DESC LIMIT 1",
                ANALYSIS_COLUMNS
            ),
            params![control_number, document_hash, exclude.to_string()],
            analysis_from_row,
        )
        .optional()
        .context("Failed to look up analysis by document hash")
    }

    /// Records a retry pass should look at: failed ones and in-flight ones
    /// not updated since `stale_before`
    pub fn retry_candidates(&self, max_retries: u32, stale_before: DateTime<Utc>) -> Result<Vec<AnalysisRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM analyses
             WHERE retry_count < ?1 AND superseded_by IS NULL
               AND (status = 'ANALYSIS_FAILED'
                    OR (status IN ('ANALYSIS_IN_PROGRESS', 'PENDING_TOKEN_CALCULATION') AND updated_at < ?2))
             ORDER BY updated_at, id",
            ANALYSIS_COLUMNS
        ))?;
        let rows = stmt.query_map(params![max_retries, ts(stale_before)], analysis_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list retry candidates")
    }

    /// Link `previous` to `successor`, insert the successor and copy the
    /// previous attempt's documents and file records onto it.
    ///
    /// Returns `false` when `previous` is no longer failed or was already
    /// superseded.
    pub fn create_successor(&self, previous: Uuid, successor: &AnalysisRecord) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let claimed = tx
            .execute(
                "UPDATE analyses SET superseded_by = ?2
                 WHERE id = ?1 AND status = 'ANALYSIS_FAILED' AND superseded_by IS NULL",
                params![previous.to_string(), successor.id.to_string()],
            )
            .context("Failed to claim failed analysis")?;
        if claimed == 0 {
            return Ok(false);
        }

        insert_record(&tx, successor)?;
        history::append(
            &tx,
            &StatusHistoryEntry::new(
                successor.id,
                successor.status,
                Some(format!("Retry {} of analysis {}", successor.retry_count, previous)),
            ),
        )?;
        files::copy_files(&tx, previous, successor.id)?;
        tx.commit().context("Failed to commit successor")?;
        Ok(true)
    }

    /// Pending analyses with the scores of their versions
    pub fn pending_for_ranking(&self) -> Result<Vec<PendingAnalysis>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.control_number, a.version_number, p.region, p.votes_count,
                    COALESCE(p.priority_score, 0), a.total_cost, p.last_update_date
             FROM analyses a
             JOIN procurements p
               ON p.control_number = a.control_number AND p.version_number = a.version_number
             WHERE a.status = 'PENDING_ANALYSIS'
             ORDER BY a.control_number, a.version_number, a.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingAnalysis {
                analysis_id: parse_uuid(&row.get::<_, String>(0)?)?,
                control_number: row.get(1)?,
                version_number: row.get(2)?,
                region: row.get(3)?,
                votes: row.get(4)?,
                priority_score: row.get(5)?,
                estimated_cost: row.get(6)?,
                last_update_date: parse_ts(&row.get::<_, String>(7)?)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list pending analyses")
    }

    /// Number of records per status
    pub fn status_counts(&self) -> Result<Vec<(AnalysisStatus, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM analyses GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_enum(&row.get::<_, String>(0)?)?, row.get(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to count analyses")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Procurement;
    use chrono::Duration;
    use serde_json::json;

    fn store_with_version() -> Store {
        let store = Store::open_in_memory().unwrap();
        let procurement = Procurement::from_raw(json!({
            "numeroControlePNCP": "CN-1",
            "orgaoEntidade": {"cnpj": "1"},
            "anoCompra": 2025,
            "sequencialCompra": 1,
            "dataAtualizacao": "2025-01-01T00:00:00"
        }))
        .unwrap();
        store.insert_version(&procurement, "h1").unwrap();
        store
    }

    fn pending(store: &Store) -> AnalysisRecord {
        let record = AnalysisRecord::new("CN-1", 1);
        store.insert_analysis(&record, None).unwrap();
        assert!(store
            .finish_preparation(record.id, "doc-hash", TokenUsage::default(), CostBreakdown::default(), "p", &[])
            .unwrap());
        record
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let store = store_with_version();
        let record = pending(&store);

        assert!(store
            .transition(record.id, AnalysisStatus::PendingAnalysis, AnalysisStatus::AnalysisInProgress, None)
            .unwrap());
        // second caller loses
        assert!(!store
            .transition(record.id, AnalysisStatus::PendingAnalysis, AnalysisStatus::AnalysisInProgress, None)
            .unwrap());

        let statuses: Vec<AnalysisStatus> = store.history(record.id).unwrap().iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![
                AnalysisStatus::PendingTokenCalculation,
                AnalysisStatus::PendingAnalysis,
                AnalysisStatus::AnalysisInProgress
            ]
        );
    }

    #[test]
    fn test_single_in_progress_per_version() {
        let store = store_with_version();
        let first = pending(&store);
        let second = pending(&store);

        assert!(store
            .transition(first.id, AnalysisStatus::PendingAnalysis, AnalysisStatus::AnalysisInProgress, None)
            .unwrap());
        assert!(!store
            .transition(second.id, AnalysisStatus::PendingAnalysis, AnalysisStatus::AnalysisInProgress, None)
            .unwrap());

        let reloaded = store.get_analysis(second.id).unwrap().unwrap();
        assert_eq!(reloaded.status, AnalysisStatus::PendingAnalysis);
    }

    #[test]
    fn test_result_and_expense_commit_together() {
        let store = store_with_version();
        let record = pending(&store);
        store
            .transition(record.id, AnalysisStatus::PendingAnalysis, AnalysisStatus::AnalysisInProgress, None)
            .unwrap();

        let costs = CostBreakdown {
            total_cost: 1.5,
            ..Default::default()
        };
        let expense = BudgetLedgerEntry::expense(record.id, 1.5, "analysis");
        assert!(store
            .save_result(record.id, &json!({"risk": "low"}), TokenUsage::default(), costs, Some(&expense), None)
            .unwrap());

        let saved = store.get_analysis(record.id).unwrap().unwrap();
        assert_eq!(saved.status, AnalysisStatus::AnalysisSuccessful);
        assert_eq!(saved.result, Some(json!({"risk": "low"})));
        assert_eq!(store.ledger_entries().unwrap().len(), 1);

        let reused = store
            .find_successful_by_document_hash("CN-1", "doc-hash", Uuid::new_v4())
            .unwrap();
        assert_eq!(reused.map(|r| r.id), Some(record.id));
    }

    #[test]
    fn test_successor_claims_failed_record_once() {
        let store = store_with_version();
        let record = pending(&store);
        store
            .transition(record.id, AnalysisStatus::PendingAnalysis, AnalysisStatus::AnalysisInProgress, None)
            .unwrap();
        store
            .transition(record.id, AnalysisStatus::AnalysisInProgress, AnalysisStatus::AnalysisFailed, Some("boom".into()))
            .unwrap();

        let failed = store.get_analysis(record.id).unwrap().unwrap();
        let candidates = store.retry_candidates(3, Utc::now()).unwrap();
        assert_eq!(candidates.len(), 1);

        let successor = failed.successor();
        assert!(store.create_successor(failed.id, &successor).unwrap());
        assert!(!store.create_successor(failed.id, &failed.successor()).unwrap());

        assert_eq!(store.get_analysis(failed.id).unwrap().unwrap().superseded_by, Some(successor.id));
        assert!(store.retry_candidates(3, Utc::now()).unwrap().is_empty());
        assert_eq!(store.analyses_for("CN-1").unwrap().len(), 2);
    }

    #[test]
    fn test_stale_failure_respects_threshold() {
        let store = store_with_version();
        let record = pending(&store);
        store
            .transition(record.id, AnalysisStatus::PendingAnalysis, AnalysisStatus::AnalysisInProgress, None)
            .unwrap();

        assert!(!store
            .fail_stale(record.id, Utc::now() - Duration::hours(1), "stale".into())
            .unwrap());
        assert!(store
            .fail_stale(record.id, Utc::now() + Duration::seconds(1), "stale".into())
            .unwrap());
    }
}
