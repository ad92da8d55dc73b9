//! Content digests.
//!
//! Two SHA-256 digests drive idempotency:
//! - the procurement identity hash, over the registry payload, the
//!   document metadata and every extracted file, which gates the creation
//!   of a new procurement version;
//! - the document-set hash, over the normalized files included in an
//!   analysis, which lets a new version reuse an earlier result.
//!
//! Both sort their inputs before hashing, so neither depends on the order
//! in which the registry returned documents or archives listed members.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::FileCandidate;

/// Identity of a procurement snapshot.
///
/// `documents` holds each source document's raw metadata, `files` every
/// extracted leaf as (composite path, bytes).
pub fn procurement_content_hash(raw: &Value, documents: &[Value], files: &[(String, Vec<u8>)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(raw).as_bytes());

    let mut metadata: Vec<String> = documents.iter().map(canonical_json).collect();
    metadata.sort();
    for entry in &metadata {
        update_framed(&mut hasher, entry.as_bytes());
    }

    let mut sorted: Vec<&(String, Vec<u8>)> = files.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    for (path, content) in sorted {
        update_framed(&mut hasher, path.as_bytes());
        update_framed(&mut hasher, content);
    }

    hex::encode(hasher.finalize())
}

/// Hash of the included, normalized document set
pub fn document_hash(candidates: &[FileCandidate]) -> String {
    let mut parts: Vec<(&str, &[u8])> = candidates
        .iter()
        .filter(|c| c.is_included())
        .flat_map(|c| c.parts.iter().map(|p| (p.path.as_str(), p.content.as_slice())))
        .collect();
    parts.sort();

    let mut hasher = Sha256::new();
    for (path, content) in parts {
        update_framed(&mut hasher, path.as_bytes());
        update_framed(&mut hasher, content);
    }
    hex::encode(hasher.finalize())
}

/// Length-prefix each field so ("ab", "c") and ("a", "bc") differ
fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// JSON text with object keys sorted at every level.
///
/// Relies on serde_json's `Map` being a `BTreeMap`; the `preserve_order`
/// feature must stay off.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}
