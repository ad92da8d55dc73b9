//! SQLite persistence.
//!
//! One [`Store`] owns a single connection behind a mutex; all methods are
//! short synchronous statements. Status changes go through compare-and-set
//! updates (`... WHERE id = ? AND status = ?`) and the schema carries a
//! partial unique index so at most one analysis per procurement version
//! can be in progress, whatever the callers do.
//!
//! Table groups live in submodules:
//! - `procurements`: immutable procurement versions and their scores
//! - `analyses`: analysis records and their transitions
//! - `files`: source documents and per-file records
//! - `history`: status history
//! - `ledger`: donations and expenses

mod analyses;
mod files;
mod history;
mod ledger;
mod procurements;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

pub use analyses::PendingAnalysis;
pub use files::{FileRecord, StoredPart};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS procurements (
    id TEXT PRIMARY KEY,
    control_number TEXT NOT NULL,
    version_number INTEGER NOT NULL,
    content_hash TEXT NOT NULL UNIQUE,
    raw_data TEXT NOT NULL,
    region TEXT NOT NULL,
    last_update_date TEXT NOT NULL,
    votes_count INTEGER NOT NULL DEFAULT 0,
    quality_score INTEGER,
    potential_impact_score INTEGER,
    temporal_score INTEGER,
    estimated_cost REAL,
    priority_score INTEGER,
    is_stable INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE (control_number, version_number)
);

CREATE TABLE IF NOT EXISTS analyses (
    id TEXT PRIMARY KEY,
    control_number TEXT NOT NULL,
    version_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    document_hash TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    thinking_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    thinking_cost REAL NOT NULL DEFAULT 0,
    search_cost REAL NOT NULL DEFAULT 0,
    total_cost REAL NOT NULL DEFAULT 0,
    result TEXT,
    prompt TEXT,
    warnings TEXT NOT NULL DEFAULT '[]',
    superseded_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (control_number, version_number)
        REFERENCES procurements (control_number, version_number)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_analyses_single_in_progress
    ON analyses (control_number, version_number)
    WHERE status = 'ANALYSIS_IN_PROGRESS';
CREATE INDEX IF NOT EXISTS idx_analyses_status ON analyses (status, updated_at);
CREATE INDEX IF NOT EXISTS idx_analyses_document_hash ON analyses (control_number, document_hash);

CREATE TABLE IF NOT EXISTS source_documents (
    id TEXT PRIMARY KEY,
    analysis_id TEXT NOT NULL REFERENCES analyses (id),
    synthetic_id TEXT NOT NULL,
    title TEXT NOT NULL,
    document_type_name TEXT NOT NULL,
    publication_date TEXT,
    url TEXT,
    raw_metadata TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_records (
    id TEXT PRIMARY KEY,
    analysis_id TEXT NOT NULL REFERENCES analyses (id),
    source_document_id TEXT NOT NULL REFERENCES source_documents (id),
    original_path TEXT NOT NULL,
    original_uri TEXT,
    ai_path TEXT NOT NULL,
    ai_parts TEXT NOT NULL DEFAULT '[]',
    included INTEGER NOT NULL DEFAULT 0,
    exclusion_reason TEXT,
    prioritization_logic TEXT NOT NULL,
    priority INTEGER,
    size_bytes INTEGER NOT NULL,
    nesting_level INTEGER NOT NULL,
    extraction_failed INTEGER NOT NULL DEFAULT 0,
    inferred_extension TEXT,
    used_fallback_conversion INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_file_records_analysis ON file_records (analysis_id);

CREATE TABLE IF NOT EXISTS status_history (
    id TEXT PRIMARY KEY,
    analysis_id TEXT NOT NULL REFERENCES analyses (id),
    status TEXT NOT NULL,
    details TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_status_history_analysis ON status_history (analysis_id, timestamp);

CREATE TABLE IF NOT EXISTS budget_ledger (
    id TEXT PRIMARY KEY,
    entry_type TEXT NOT NULL CHECK (entry_type IN ('DONATION', 'EXPENSE')),
    amount REAL NOT NULL,
    analysis_id TEXT REFERENCES analyses (id),
    description TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Handle to the pipeline database
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a database file and ensure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
            .context("Failed to configure database")?;
        conn.execute_batch(SCHEMA).context("Failed to create schema")?;
        debug!("Database schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("Database connection lock poisoned"))
    }
}

/// Fixed-width UTC timestamp; text order equals time order
pub(crate) fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conversion_error)
}

pub(crate) fn parse_uuid(value: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value).map_err(conversion_error)
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value).map_err(conversion_error)
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(|e| conversion_error(StoreValueError(e)))
}

fn conversion_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct StoreValueError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema_idempotently() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db").join("tenderwatch.db");

        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();

        let conn = store.conn().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = ts(Utc::now());
        let later = ts(Utc::now() + chrono::Duration::seconds(1));
        assert!(earlier < later);
        assert!(parse_ts(&earlier).is_ok());
    }
}
