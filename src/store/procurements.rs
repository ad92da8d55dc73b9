//! Procurement versions.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{Procurement, ProcurementVersion, RankingScores};

use super::{parse_json, parse_ts, parse_uuid, ts, Store};

const VERSION_COLUMNS: &str = "id, version_number, content_hash, votes_count, raw_data, created_at, \
     quality_score, potential_impact_score, temporal_score, estimated_cost, priority_score, is_stable";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<ProcurementVersion> {
    let raw: serde_json::Value = parse_json(&row.get::<_, String>(4)?)?;
    let procurement = Procurement::from_raw(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let scores = match row.get::<_, Option<i64>>(10)? {
        Some(priority_score) => Some(RankingScores {
            quality_score: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
            potential_impact_score: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
            temporal_score: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
            estimated_cost: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
            priority_score,
            is_stable: row.get::<_, Option<bool>>(11)?.unwrap_or(false),
        }),
        None => None,
    };

    Ok(ProcurementVersion {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        version_number: row.get(1)?,
        content_hash: row.get(2)?,
        votes_count: row.get(3)?,
        scores,
        procurement,
        created_at: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

impl Store {
    /// Version whose content hash matches, if any
    pub fn find_version_by_hash(&self, content_hash: &str) -> Result<Option<ProcurementVersion>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM procurements WHERE content_hash = ?1", VERSION_COLUMNS),
            params![content_hash],
            version_from_row,
        )
        .optional()
        .context("Failed to look up procurement by content hash")
    }

    /// Highest version number for a control number (0 when none)
    pub fn latest_version_number(&self, control_number: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version_number), 0) FROM procurements WHERE control_number = ?1",
            params![control_number],
            |row| row.get(0),
        )
        .context("Failed to read latest version number")
    }

    pub fn get_version(&self, control_number: &str, version_number: i64) -> Result<Option<ProcurementVersion>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM procurements WHERE control_number = ?1 AND version_number = ?2",
                VERSION_COLUMNS
            ),
            params![control_number, version_number],
            version_from_row,
        )
        .optional()
        .context("Failed to load procurement version")
    }

    pub fn latest_version(&self, control_number: &str) -> Result<Option<ProcurementVersion>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM procurements WHERE control_number = ?1 \
                 ORDER BY version_number DESC LIMIT 1",
                VERSION_COLUMNS
            ),
            params![control_number],
            version_from_row,
        )
        .optional()
        .context("Failed to load latest procurement version")
    }

    /// Insert the next version of a procurement.
    ///
    /// Returns `None` when another writer already stored the same content
    /// hash. The version number is allocated inside the insert, so two
    /// writers with different content never collide on it.
    pub fn insert_version(&self, procurement: &Procurement, content_hash: &str) -> Result<Option<ProcurementVersion>> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let raw = serde_json::to_string(&procurement.raw).context("Failed to serialize procurement")?;

        let inserted = conn
            .execute(
                "INSERT INTO procurements
                     (id, control_number, version_number, content_hash, raw_data, region,
                      last_update_date, created_at)
                 SELECT ?1, ?2, COALESCE(MAX(version_number), 0) + 1, ?3, ?4, ?5, ?6, ?7
                 FROM procurements WHERE control_number = ?2
                 ON CONFLICT (content_hash) DO NOTHING",
                params![
                    id.to_string(),
                    procurement.control_number,
                    content_hash,
                    raw,
                    procurement.region(),
                    ts(procurement.last_update_date),
                    ts(created_at),
                ],
            )
            .with_context(|| format!("Failed to insert version of {}", procurement.control_number))?;

        if inserted == 0 {
            return Ok(None);
        }

        let version_number: i64 = conn
            .query_row(
                "SELECT version_number FROM procurements WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to read inserted version")?;

        Ok(Some(ProcurementVersion {
            id,
            version_number,
            content_hash: content_hash.to_string(),
            votes_count: 0,
            scores: None,
            procurement: procurement.clone(),
            created_at,
        }))
    }

    pub fn update_scores(&self, control_number: &str, version_number: i64, scores: &RankingScores) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE procurements SET quality_score = ?3, potential_impact_score = ?4, temporal_score = ?5,
                 estimated_cost = ?6, priority_score = ?7, is_stable = ?8
             WHERE control_number = ?1 AND version_number = ?2",
            params![
                control_number,
                version_number,
                scores.quality_score,
                scores.potential_impact_score,
                scores.temporal_score,
                scores.estimated_cost,
                scores.priority_score,
                scores.is_stable,
            ],
        )
        .context("Failed to update ranking scores")?;
        Ok(())
    }

    /// Set the public vote count of every version of a procurement
    pub fn set_votes(&self, control_number: &str, votes: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE procurements SET votes_count = ?2 WHERE control_number = ?1",
            params![control_number, votes],
        )
        .context("Failed to update votes")?;
        Ok(())
    }

    pub fn count_versions(&self, control_number: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM procurements WHERE control_number = ?1",
            params![control_number],
            |row| row.get(0),
        )
        .context("Failed to count versions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn procurement(object: &str) -> Procurement {
        Procurement::from_raw(json!({
            "numeroControlePNCP": "CN-1",
            "orgaoEntidade": {"cnpj": "1"},
            "anoCompra": 2025,
            "sequencialCompra": 1,
            "objetoCompra": object,
            "dataAtualizacao": "2025-01-01T00:00:00"
        }))
        .unwrap()
    }

    #[test]
    fn test_versions_increment_and_dedupe_by_hash() {
        let store = Store::open_in_memory().unwrap();

        let v1 = store.insert_version(&procurement("a"), "hash-a").unwrap().unwrap();
        let v2 = store.insert_version(&procurement("b"), "hash-b").unwrap().unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);

        assert!(store.insert_version(&procurement("a"), "hash-a").unwrap().is_none());
        assert_eq!(store.count_versions("CN-1").unwrap(), 2);
        assert_eq!(store.latest_version_number("CN-1").unwrap(), 2);
        assert_eq!(store.latest_version_number("CN-unknown").unwrap(), 0);

        let found = store.find_version_by_hash("hash-b").unwrap().unwrap();
        assert_eq!(found.procurement.object_description, "b");
    }

    #[test]
    fn test_scores_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.insert_version(&procurement("a"), "h").unwrap();

        let scores = RankingScores {
            quality_score: 80,
            potential_impact_score: 45,
            temporal_score: 15,
            estimated_cost: 1.25,
            priority_score: 152,
            is_stable: true,
        };
        store.update_scores("CN-1", 1, &scores).unwrap();
        store.set_votes("CN-1", 7).unwrap();

        let version = store.get_version("CN-1", 1).unwrap().unwrap();
        assert_eq!(version.scores, Some(scores));
        assert_eq!(version.votes_count, 7);
    }
}
