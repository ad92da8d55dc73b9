//! Budget ledger: donations in, analysis expenses out.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::domain::{BudgetLedgerEntry, LedgerEntryType};

use super::{parse_enum, parse_ts, parse_uuid, ts, Store};

pub(crate) fn insert(conn: &Connection, entry: &BudgetLedgerEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO budget_ledger (id, entry_type, amount, analysis_id, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.id.to_string(),
            entry.entry_type.as_str(),
            entry.amount,
            entry.analysis_id.map(|id| id.to_string()),
            entry.description,
            ts(entry.created_at),
        ],
    )?;
    Ok(())
}

impl Store {
    pub fn insert_ledger(&self, entry: &BudgetLedgerEntry) -> Result<()> {
        let conn = self.conn()?;
        insert(&conn, entry).context("Failed to insert ledger entry")
    }

    pub fn total_donations(&self) -> Result<f64> {
        self.sum_ledger(LedgerEntryType::Donation, None)
    }

    /// Expenses recorded at or after `since`
    pub fn total_expenses_since(&self, since: DateTime<Utc>) -> Result<f64> {
        self.sum_ledger(LedgerEntryType::Expense, Some(since))
    }

    fn sum_ledger(&self, entry_type: LedgerEntryType, since: Option<DateTime<Utc>>) -> Result<f64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM budget_ledger
             WHERE entry_type = ?1 AND (?2 IS NULL OR created_at >= ?2)",
            params![entry_type.as_str(), since.map(ts)],
            |row| row.get(0),
        )
        .context("Failed to sum ledger")
    }

    /// All entries, oldest first
    pub fn ledger_entries(&self) -> Result<Vec<BudgetLedgerEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entry_type, amount, analysis_id, description, created_at
             FROM budget_ledger ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            let analysis_id = match row.get::<_, Option<String>>(3)? {
                Some(id) => Some(parse_uuid(&id)?),
                None => None,
            };
            Ok(BudgetLedgerEntry {
                id: parse_uuid(&row.get::<_, String>(0)?)?,
                entry_type: parse_enum(&row.get::<_, String>(1)?)?,
                amount: row.get(2)?,
                analysis_id,
                description: row.get(4)?,
                created_at: parse_ts(&row.get::<_, String>(5)?)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read ledger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_sums_by_type_and_period() {
        let store = Store::open_in_memory().unwrap();
        store.insert_ledger(&BudgetLedgerEntry::donation(50.0, "first")).unwrap();
        store.insert_ledger(&BudgetLedgerEntry::donation(25.5, "second")).unwrap();

        assert!((store.total_donations().unwrap() - 75.5).abs() < 1e-9);
        assert_eq!(store.total_expenses_since(Utc::now() - Duration::days(1)).unwrap(), 0.0);

        let entries = store.ledger_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_type, LedgerEntryType::Donation);
        assert_eq!(entries[0].description, "first");
    }
}
