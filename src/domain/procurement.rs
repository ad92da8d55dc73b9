//! Procurement records as delivered by the registry.
//!
//! The registry payload is large and loosely specified. [`Procurement`]
//! keeps the handful of fields the pipeline reads as typed values and
//! carries the untouched JSON alongside for audit and prompt building.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Registry document type id of the bid notice ("Edital")
pub const BID_NOTICE_DOCUMENT_TYPE: i64 = 2;

/// Fields of the registry procurement payload the pipeline depends on
#[derive(Debug, Clone, Deserialize)]
struct ProcurementFields {
    #[serde(rename = "numeroControlePNCP")]
    control_number: String,

    #[serde(rename = "orgaoEntidade")]
    government_entity: GovernmentEntity,

    #[serde(rename = "anoCompra")]
    year: i32,

    #[serde(rename = "sequencialCompra")]
    sequence: i64,

    #[serde(rename = "objetoCompra", default)]
    object_description: String,

    #[serde(rename = "valorTotalEstimado", default)]
    total_estimated_value: Option<f64>,

    #[serde(
        rename = "dataEncerramentoProposta",
        default,
        deserialize_with = "deserialize_registry_datetime_opt"
    )]
    proposal_closing_date: Option<DateTime<Utc>>,

    #[serde(
        rename = "dataAtualizacao",
        deserialize_with = "deserialize_registry_datetime"
    )]
    last_update_date: DateTime<Utc>,

    #[serde(rename = "unidadeOrgao", default)]
    entity_unit: Option<EntityUnit>,
}

#[derive(Debug, Clone, Deserialize)]
struct GovernmentEntity {
    cnpj: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EntityUnit {
    #[serde(rename = "codigoIbge", default)]
    ibge_code: Option<String>,
}

/// Typed envelope around a raw registry procurement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Procurement {
    /// Registry control number, stable across versions
    pub control_number: String,

    /// Tax id of the purchasing entity
    pub cnpj: String,

    /// Procurement year
    pub year: i32,

    /// Sequence within (cnpj, year)
    pub sequence: i64,

    /// Free-text description of what is being bought
    pub object_description: String,

    /// Estimated total value, when published
    pub total_estimated_value: Option<f64>,

    /// Proposal submission deadline
    pub proposal_closing_date: Option<DateTime<Utc>>,

    /// Last time the registry reported a change
    pub last_update_date: DateTime<Utc>,

    /// IBGE municipality code of the purchasing unit (the scheduling region)
    pub ibge_code: Option<String>,

    /// Untouched registry payload
    pub raw: serde_json::Value,
}

impl Procurement {
    /// Build the envelope from a raw registry payload
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, serde_json::Error> {
        let fields: ProcurementFields = serde_json::from_value(raw.clone())?;

        Ok(Self {
            control_number: fields.control_number,
            cnpj: fields.government_entity.cnpj,
            year: fields.year,
            sequence: fields.sequence,
            object_description: fields.object_description,
            total_estimated_value: fields.total_estimated_value,
            proposal_closing_date: fields.proposal_closing_date,
            last_update_date: fields.last_update_date,
            ibge_code: fields.entity_unit.and_then(|u| u.ibge_code),
            raw,
        })
    }

    /// Region key used by the scheduler's proportional allocation
    pub fn region(&self) -> &str {
        self.ibge_code.as_deref().unwrap_or("unknown")
    }
}

/// An immutable snapshot of a procurement at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcurementVersion {
    /// Row id
    pub id: Uuid,

    /// Monotonic per control number, starting at 1
    pub version_number: i64,

    /// Identity hash of metadata plus documents
    pub content_hash: String,

    /// Community votes, feeds the scheduler's vote adjustment
    pub votes_count: i64,

    /// Ranking scores, filled once Prepare has scored the version
    pub scores: Option<RankingScores>,

    /// The snapshot itself
    pub procurement: Procurement,

    /// When this version was recorded
    pub created_at: DateTime<Utc>,
}

/// Per-version scores computed by the ranking stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingScores {
    pub quality_score: i64,
    pub potential_impact_score: i64,
    pub temporal_score: i64,
    pub estimated_cost: f64,
    pub priority_score: i64,
    pub is_stable: bool,
}

/// Metadata for one document attached to a procurement in the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawDocumentMeta {
    /// Download URL
    #[serde(default)]
    pub url: Option<String>,

    #[serde(rename = "sequencialDocumento")]
    pub document_sequence: i64,

    #[serde(default)]
    pub cnpj: String,

    #[serde(rename = "anoCompra")]
    pub procurement_year: i32,

    #[serde(rename = "sequencialCompra")]
    pub procurement_sequence: i64,

    #[serde(rename = "statusAtivo", default = "default_active")]
    pub is_active: bool,

    #[serde(rename = "titulo", default)]
    pub title: String,

    #[serde(rename = "tipoDocumentoId", default)]
    pub document_type_id: i64,

    #[serde(rename = "tipoDocumentoNome", default)]
    pub document_type_name: String,

    #[serde(rename = "dataPublicacaoPncp", default)]
    pub publication_date: Option<String>,

    /// Untouched registry payload
    #[serde(skip)]
    pub raw: serde_json::Value,
}

fn default_active() -> bool {
    true
}

impl RawDocumentMeta {
    /// Parse document metadata, keeping the raw payload
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut meta: Self = serde_json::from_value(raw.clone())?;
        meta.raw = raw;
        Ok(meta)
    }

    /// Synthetic id: `{cnpj}-{year}-{procurement_sequence}-{document_sequence}`
    pub fn synthetic_id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.cnpj, self.procurement_year, self.procurement_sequence, self.document_sequence
        )
    }

    pub fn is_bid_notice(&self) -> bool {
        self.document_type_id == BID_NOTICE_DOCUMENT_TYPE
    }
}

/// Keep active documents only, bid notice first, otherwise in registry order
pub fn order_documents(docs: Vec<RawDocumentMeta>) -> Vec<RawDocumentMeta> {
    let mut active: Vec<RawDocumentMeta> = docs.into_iter().filter(|d| d.is_active).collect();
    // Stable sort keeps registry order among equals
    active.sort_by_key(|d| !d.is_bid_notice());
    active
}

/// A document as persisted for one analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub synthetic_id: String,
    pub title: String,
    pub document_type_name: String,
    pub publication_date: Option<String>,
    pub url: Option<String>,
    pub raw_metadata: serde_json::Value,
}

/// Parse the registry's timestamp forms: RFC 3339, naive datetime, or date
pub fn parse_registry_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn deserialize_registry_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_registry_datetime(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid datetime: {}", value)))
}

fn deserialize_registry_datetime_opt<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_registry_datetime(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid datetime: {}", s))),
    }
}
