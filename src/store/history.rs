//! Append-only status history.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::domain::StatusHistoryEntry;

use super::{parse_enum, parse_ts, parse_uuid, ts, Store};

/// Append one entry using an open connection or transaction
pub(crate) fn append(conn: &Connection, entry: &StatusHistoryEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO status_history (id, analysis_id, status, details, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.id.to_string(),
            entry.analysis_id.to_string(),
            entry.status.as_str(),
            entry.details,
            ts(entry.timestamp),
        ],
    )?;
    Ok(())
}

impl Store {
    /// Full history of an analysis, oldest first
    pub fn history(&self, analysis_id: Uuid) -> Result<Vec<StatusHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, analysis_id, status, details, timestamp FROM status_history
             WHERE analysis_id = ?1 ORDER BY timestamp, rowid",
        )?;
        let rows = stmt.query_map(params![analysis_id.to_string()], |row| {
            Ok(StatusHistoryEntry {
                id: parse_uuid(&row.get::<_, String>(0)?)?,
                analysis_id: parse_uuid(&row.get::<_, String>(1)?)?,
                status: parse_enum(&row.get::<_, String>(2)?)?,
                details: row.get(3)?,
                timestamp: parse_ts(&row.get::<_, String>(4)?)?,
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read history of {}", analysis_id))
    }

    /// Record a note against an analysis without changing its status
    pub fn note(&self, entry: &StatusHistoryEntry) -> Result<()> {
        let conn = self.conn()?;
        append(&conn, entry).context("Failed to append status history")
    }
}
