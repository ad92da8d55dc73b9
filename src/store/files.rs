//! Source documents and per-file records of an analysis.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Disposition, ExclusionReason, FileCandidate, NormalizedPart, PrioritizationLogic, SourceDocument,
};

use super::{parse_enum, parse_json, parse_uuid, Store};

/// A normalized part as uploaded to the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPart {
    pub path: String,
    pub uri: String,
    pub content_type: String,
}

/// Persisted outcome of one candidate file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,

    pub analysis_id: Uuid,

    /// Row id of the source document
    pub source_document_id: Uuid,

    pub original_path: String,

    /// Blob URI of the original bytes, when uploaded
    pub original_uri: Option<String>,

    pub ai_path: String,

    pub ai_parts: Vec<StoredPart>,

    pub included: bool,

    pub exclusion_reason: Option<ExclusionReason>,

    pub prioritization: PrioritizationLogic,

    pub priority: Option<i64>,

    pub size_bytes: i64,

    pub nesting_level: u32,

    pub extraction_failed: bool,

    pub inferred_extension: Option<String>,

    pub used_fallback_conversion: bool,
}

impl FileRecord {
    /// Snapshot a candidate after selection
    pub fn from_candidate(
        analysis_id: Uuid,
        source_document_id: Uuid,
        candidate: &FileCandidate,
        original_uri: Option<String>,
    ) -> Self {
        let ai_parts = candidate
            .parts
            .iter()
            .zip(candidate.ai_uris.iter())
            .map(|(part, uri)| StoredPart {
                path: part.path.clone(),
                uri: uri.clone(),
                content_type: part.content_type.clone(),
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            analysis_id,
            source_document_id,
            original_path: candidate.original_path.clone(),
            original_uri,
            ai_path: candidate.ai_path.clone(),
            ai_parts,
            included: candidate.is_included(),
            exclusion_reason: candidate.exclusion_reason(),
            prioritization: candidate.prioritization.clone(),
            priority: i64::try_from(candidate.priority).ok(),
            size_bytes: candidate.original_content.len() as i64,
            nesting_level: candidate.nesting_level,
            extraction_failed: candidate.extraction_failed,
            inferred_extension: candidate.inferred_extension.clone(),
            used_fallback_conversion: candidate.used_fallback_conversion,
        }
    }

    /// Rebuild a candidate from the record and its re-fetched part contents.
    ///
    /// Files excluded before the token ceiling keep their reason; the rest
    /// go back to pending so selection can run again.
    pub fn to_candidate(&self, synthetic_id: &str, contents: Vec<Vec<u8>>) -> FileCandidate {
        let mut candidate = FileCandidate::new(synthetic_id, self.original_path.clone(), Vec::new(), self.nesting_level);
        candidate.ai_path = self.ai_path.clone();
        candidate.extraction_failed = self.extraction_failed;
        candidate.inferred_extension = self.inferred_extension.clone();
        candidate.used_fallback_conversion = self.used_fallback_conversion;
        candidate.prioritization = self.prioritization.clone();
        candidate.priority = self.priority.and_then(|p| usize::try_from(p).ok()).unwrap_or(usize::MAX);
        candidate.parts = self
            .ai_parts
            .iter()
            .zip(contents)
            .map(|(part, content)| NormalizedPart {
                path: part.path.clone(),
                content,
                content_type: part.content_type.clone(),
            })
            .collect();
        candidate.ai_uris = self.ai_parts.iter().map(|p| p.uri.clone()).collect();
        candidate.disposition = match self.exclusion_reason {
            Some(ExclusionReason::TokenLimitExceeded) | None => Disposition::Pending,
            Some(reason) => Disposition::Excluded(reason),
        };
        candidate
    }
}

const FILE_COLUMNS: &str = "id, analysis_id, source_document_id, original_path, original_uri, ai_path, \
     ai_parts, included, exclusion_reason, prioritization_logic, priority, size_bytes, nesting_level, \
     extraction_failed, inferred_extension, used_fallback_conversion";

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let exclusion_reason = match row.get::<_, Option<String>>(8)? {
        Some(reason) => Some(parse_enum(&reason)?),
        None => None,
    };
    Ok(FileRecord {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        analysis_id: parse_uuid(&row.get::<_, String>(1)?)?,
        source_document_id: parse_uuid(&row.get::<_, String>(2)?)?,
        original_path: row.get(3)?,
        original_uri: row.get(4)?,
        ai_path: row.get(5)?,
        ai_parts: parse_json(&row.get::<_, String>(6)?)?,
        included: row.get(7)?,
        exclusion_reason,
        prioritization: parse_json(&row.get::<_, String>(9)?)?,
        priority: row.get(10)?,
        size_bytes: row.get(11)?,
        nesting_level: row.get(12)?,
        extraction_failed: row.get(13)?,
        inferred_extension: row.get(14)?,
        used_fallback_conversion: row.get(15)?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<SourceDocument> {
    Ok(SourceDocument {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        analysis_id: parse_uuid(&row.get::<_, String>(1)?)?,
        synthetic_id: row.get(2)?,
        title: row.get(3)?,
        document_type_name: row.get(4)?,
        publication_date: row.get(5)?,
        url: row.get(6)?,
        raw_metadata: parse_json(&row.get::<_, String>(7)?)?,
    })
}

pub(crate) fn insert_source(conn: &Connection, doc: &SourceDocument) -> Result<()> {
    conn.execute(
        "INSERT INTO source_documents
             (id, analysis_id, synthetic_id, title, document_type_name, publication_date, url, raw_metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            doc.id.to_string(),
            doc.analysis_id.to_string(),
            doc.synthetic_id,
            doc.title,
            doc.document_type_name,
            doc.publication_date,
            doc.url,
            serde_json::to_string(&doc.raw_metadata)?,
        ],
    )
    .with_context(|| format!("Failed to insert source document {}", doc.synthetic_id))?;
    Ok(())
}

pub(crate) fn upsert_file(conn: &Connection, record: &FileRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO file_records
             (id, analysis_id, source_document_id, original_path, original_uri, ai_path, ai_parts,
              included, exclusion_reason, prioritization_logic, priority, size_bytes, nesting_level,
              extraction_failed, inferred_extension, used_fallback_conversion)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT (id) DO UPDATE SET
             ai_path = excluded.ai_path,
             ai_parts = excluded.ai_parts,
             included = excluded.included,
             exclusion_reason = excluded.exclusion_reason,
             prioritization_logic = excluded.prioritization_logic,
             priority = excluded.priority",
        params![
            record.id.to_string(),
            record.analysis_id.to_string(),
            record.source_document_id.to_string(),
            record.original_path,
            record.original_uri,
            record.ai_path,
            serde_json::to_string(&record.ai_parts)?,
            record.included,
            record.exclusion_reason.map(|r| r.as_str()),
            serde_json::to_string(&record.prioritization)?,
            record.priority,
            record.size_bytes,
            record.nesting_level,
            record.extraction_failed,
            record.inferred_extension,
            record.used_fallback_conversion,
        ],
    )
    .with_context(|| format!("Failed to save file record {}", record.original_path))?;
    Ok(())
}

/// Copy documents and file records of one analysis onto another
pub(crate) fn copy_files(conn: &Connection, from: Uuid, to: Uuid) -> Result<()> {
    let sources = {
        let mut stmt = conn.prepare(
            "SELECT id, analysis_id, synthetic_id, title, document_type_name, publication_date, url, raw_metadata
             FROM source_documents WHERE analysis_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![from.to_string()], source_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut remapped: HashMap<Uuid, Uuid> = HashMap::new();
    for mut doc in sources {
        let new_id = Uuid::new_v4();
        remapped.insert(doc.id, new_id);
        doc.id = new_id;
        doc.analysis_id = to;
        insert_source(conn, &doc)?;
    }

    let files = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_records WHERE analysis_id = ?1 ORDER BY rowid",
            FILE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![from.to_string()], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for mut record in files {
        record.id = Uuid::new_v4();
        record.analysis_id = to;
        if let Some(new_doc) = remapped.get(&record.source_document_id) {
            record.source_document_id = *new_doc;
        }
        upsert_file(conn, &record)?;
    }
    Ok(())
}

impl Store {
    pub fn insert_source_document(&self, doc: &SourceDocument) -> Result<()> {
        let conn = self.conn()?;
        insert_source(&conn, doc)
    }

    pub fn source_documents(&self, analysis_id: Uuid) -> Result<Vec<SourceDocument>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, analysis_id, synthetic_id, title, document_type_name, publication_date, url, raw_metadata
             FROM source_documents WHERE analysis_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![analysis_id.to_string()], source_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read source documents")
    }

    /// Insert or update file records in one transaction
    pub fn save_file_records(&self, records: &[FileRecord]) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for record in records {
            upsert_file(&tx, record)?;
        }
        tx.commit().context("Failed to commit file records")
    }

    pub fn file_records(&self, analysis_id: Uuid) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_records WHERE analysis_id = ?1 ORDER BY rowid",
            FILE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![analysis_id.to_string()], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read file records")
    }
}
