//! Analysis prompt assembly.

use std::collections::BTreeMap;

use crate::domain::{FileCandidate, Procurement, SourceDocument};

/// Build the prompt for a procurement and its included files.
///
/// Files are grouped under the source document they came from so the
/// engine can tell which attachment each file belongs to.
pub fn build_prompt(
    procurement: &Procurement,
    documents: &[SourceDocument],
    candidates: &[FileCandidate],
    warnings: &[String],
) -> String {
    let mut by_document: BTreeMap<&str, Vec<&FileCandidate>> = BTreeMap::new();
    for candidate in candidates.iter().filter(|c| c.is_included()) {
        by_document
            .entry(candidate.source_document_id.as_str())
            .or_default()
            .push(candidate);
    }

    let context = by_document
        .iter()
        .map(|(synthetic_id, files)| {
            let doc = documents.iter().find(|d| d.synthetic_id == *synthetic_id);
            let title = doc.map(|d| d.title.as_str()).unwrap_or("N/A");
            let doc_type = doc.map(|d| d.document_type_name.as_str()).unwrap_or("N/A");
            let published = doc.and_then(|d| d.publication_date.as_deref()).unwrap_or("N/A");
            let listing: Vec<String> = files
                .iter()
                .flat_map(|f| f.parts.iter())
                .map(|p| format!("- `{}`", crate::domain::candidate::file_name_of(&p.path)))
                .collect();
            format!(
                "Source document: {} (type: {}, published: {})\nFiles extracted from this source:\n{}",
                title,
                doc_type,
                published,
                listing.join("\n")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    let metadata = serde_json::to_string_pretty(&procurement.raw).unwrap_or_else(|_| procurement.raw.to_string());

    let mut prompt = String::from(
        "You are a senior auditor of Brazilian public procurement. Analyze the attached \
         documents and identify possible irregularities in the bidding process.\n",
    );
    if !warnings.is_empty() {
        prompt.push_str("\n--- WARNINGS ---\nThe following problems were found while preparing the files:\n");
        for warning in warnings {
            prompt.push_str("- ");
            prompt.push_str(warning);
            prompt.push('\n');
        }
        prompt.push_str("--- END OF WARNINGS ---\n");
    }
    prompt.push_str("\n--- PROCUREMENT METADATA (JSON) ---\n");
    prompt.push_str(&metadata);
    prompt.push_str("\n--- END OF METADATA ---\n\n--- ATTACHED DOCUMENTS ---\n");
    prompt.push_str(&context);
    prompt.push_str("\n--- END OF DOCUMENTS ---\n");
    prompt
}
