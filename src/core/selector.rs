//! Token-budget file selection.
//!
//! Candidates are ordered by how likely they are to matter (the bid
//! notice before reference terms before budget spreadsheets ...) and then
//! added greedily while the measured prompt stays under the completion
//! engine's input ceiling. A file that does not fit is excluded with
//! `TOKEN_LIMIT_EXCEEDED` and selection moves on to the next one.

use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::adapters::CompletionEngine;
use crate::domain::candidate::extension_of;
use crate::domain::{Disposition, ExclusionReason, FileCandidate, Modality, PrioritizationLogic, SourceDocument};

/// Priority keywords, most important first, matched accent- and case-insensitively
pub const PRIORITY_KEYWORDS: &[&str] = &[
    "edital",
    "termo de referencia",
    "projeto basico",
    "planilha",
    "orcamento",
    "custos",
    "contrato",
    "ata de registro",
];

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".avi", ".mkv"];
const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".wav", ".flac", ".ogg"];
const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp"];

/// Outcome of a selection pass
#[derive(Debug, Clone)]
pub struct Selection {
    /// All candidates, in selection order, each included or excluded
    pub candidates: Vec<FileCandidate>,

    /// Prompt warnings produced by selection
    pub warnings: Vec<String>,

    /// Measured tokens of the prompt plus the included files
    pub input_tokens: u64,
}

impl Selection {
    pub fn included(&self) -> impl Iterator<Item = &FileCandidate> {
        self.candidates.iter().filter(|c| c.is_included())
    }
}

/// Lowercase and strip Portuguese diacritics; separators become spaces
pub fn fold_text(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            '_' | '-' => ' ',
            other => other,
        })
        .collect()
}

fn keyword_index(text: &str) -> Option<usize> {
    let folded = fold_text(text);
    PRIORITY_KEYWORDS.iter().position(|k| folded.contains(k))
}

/// Assign a priority and its explanation to every candidate.
///
/// A keyword in the source document's type or title wins over one in the
/// file name; candidates without any keyword sort last.
pub fn prioritize(candidates: &mut [FileCandidate], documents: &HashMap<String, SourceDocument>) {
    for candidate in candidates.iter_mut() {
        let by_metadata = documents.get(&candidate.source_document_id).and_then(|doc| {
            keyword_index(&format!("{} {}", doc.document_type_name, doc.title))
        });

        let (priority, logic) = match by_metadata {
            Some(idx) => (
                idx,
                PrioritizationLogic::ByMetadata {
                    keyword: PRIORITY_KEYWORDS[idx].to_string(),
                },
            ),
            None => match keyword_index(candidate.file_name()) {
                Some(idx) => (
                    idx,
                    PrioritizationLogic::ByKeyword {
                        keyword: PRIORITY_KEYWORDS[idx].to_string(),
                    },
                ),
                None => (PRIORITY_KEYWORDS.len(), PrioritizationLogic::NoPriority),
            },
        };

        candidate.priority = priority;
        candidate.prioritization = logic;
    }
}

/// Sort by priority; equal priorities keep ascending original path order
pub fn sort_by_priority(candidates: &mut [FileCandidate]) {
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.original_path.cmp(&b.original_path))
    });
}

/// Greedy selection under `max_tokens`.
///
/// Already-excluded candidates pass through untouched. Every pending
/// candidate ends included or excluded. Measurement errors abort the pass.
pub async fn select(
    mut candidates: Vec<FileCandidate>,
    prompt: &str,
    max_tokens: u64,
    engine: &dyn CompletionEngine,
) -> Result<Selection> {
    sort_by_priority(&mut candidates);

    let mut selected_uris: Vec<String> = Vec::new();
    let mut input_tokens: Option<u64> = None;
    let mut dropped: Vec<String> = Vec::new();

    for candidate in candidates.iter_mut() {
        if candidate.disposition != Disposition::Pending {
            continue;
        }

        let mut trial = selected_uris.clone();
        trial.extend(candidate.ai_uris.iter().cloned());
        let tokens = engine
            .count_tokens(prompt, &trial)
            .await
            .with_context(|| format!("Failed to count tokens with '{}'", candidate.original_path))?;

        if tokens <= max_tokens {
            debug!(path = %candidate.original_path, tokens, "Including file");
            candidate.include();
            selected_uris = trial;
            input_tokens = Some(tokens);
        } else {
            debug!(path = %candidate.original_path, tokens, max_tokens, "File exceeds token ceiling");
            candidate.exclude(ExclusionReason::TokenLimitExceeded);
            dropped.push(candidate.file_name().to_string());
        }
    }

    let input_tokens = match input_tokens {
        Some(tokens) => tokens,
        None => engine
            .count_tokens(prompt, &[])
            .await
            .context("Failed to count prompt tokens")?,
    };

    let mut warnings = Vec::new();
    if !dropped.is_empty() {
        info!(dropped = dropped.len(), max_tokens, "Files dropped by token ceiling");
        warnings.push(token_limit_warning(max_tokens, &dropped));
    }

    Ok(Selection {
        candidates,
        warnings,
        input_tokens,
    })
}

pub fn token_limit_warning(max_tokens: u64, dropped: &[String]) -> String {
    format!(
        "The input token limit of {} was reached; the following files were ignored: {}",
        max_tokens,
        dropped.join(", ")
    )
}

/// Modality of the included files: any video makes it video, then audio, then image
pub fn infer_modality(candidates: &[FileCandidate]) -> Modality {
    modality_of_paths(
        candidates
            .iter()
            .filter(|c| c.is_included())
            .map(|c| c.ai_path.as_str()),
    )
}

/// Same precedence as [`infer_modality`], from AI-facing paths alone
pub fn modality_of_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Modality {
    let extensions: Vec<String> = paths.into_iter().map(extension_of).collect();
    let any_in = |set: &[&str]| extensions.iter().any(|e| set.contains(&e.as_str()));

    if any_in(VIDEO_EXTENSIONS) {
        Modality::Video
    } else if any_in(AUDIO_EXTENSIONS) {
        Modality::Audio
    } else if any_in(IMAGE_EXTENSIONS) {
        Modality::Image
    } else {
        Modality::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedCompletionEngine;
    use uuid::Uuid;

    fn pending(path: &str, uri_tokens: u64) -> FileCandidate {
        let mut c = FileCandidate::new("doc-1", path, Vec::new(), 0);
        c.ai_uris = vec![format!("mem://{}?tokens={}", path, uri_tokens)];
        c
    }

    fn source(synthetic_id: &str, title: &str, type_name: &str) -> SourceDocument {
        SourceDocument {
            id: Uuid::new_v4(),
            analysis_id: Uuid::new_v4(),
            synthetic_id: synthetic_id.to_string(),
            title: title.to_string(),
            document_type_name: type_name.to_string(),
            publication_date: None,
            url: None,
            raw_metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_fold_text() {
        assert_eq!(fold_text("Termo_de_Referência"), "termo de referencia");
        assert_eq!(fold_text("ORÇAMENTO"), "orcamento");
    }

    #[test]
    fn test_prioritize_prefers_metadata() {
        let mut docs = HashMap::new();
        docs.insert("doc-1".to_string(), source("doc-1", "Aviso", "Edital"));
        docs.insert("doc-2".to_string(), source("doc-2", "Anexo I", "Outros"));

        let mut candidates = vec![
            FileCandidate::new("doc-1", "arquivo.pdf", Vec::new(), 0),
            FileCandidate::new("doc-2", "x.zip/Planilha_Orçamento.xlsx", Vec::new(), 1),
            FileCandidate::new("doc-2", "x.zip/foto.jpg", Vec::new(), 1),
        ];
        prioritize(&mut candidates, &docs);

        assert_eq!(candidates[0].priority, 0);
        assert_eq!(
            candidates[0].prioritization,
            PrioritizationLogic::ByMetadata { keyword: "edital".into() }
        );
        assert_eq!(candidates[1].priority, 3);
        assert_eq!(candidates[1].prioritization.keyword(), Some("planilha"));
        assert_eq!(candidates[2].priority, PRIORITY_KEYWORDS.len());
        assert_eq!(candidates[2].prioritization, PrioritizationLogic::NoPriority);
    }

    #[tokio::test]
    async fn test_greedy_selection_respects_ceiling() {
        // prompt costs 100, each uri its declared token count
        let engine = ScriptedCompletionEngine::new().with_prompt_tokens(100);
        let candidates = vec![pending("a.pdf", 500), pending("b.pdf", 600), pending("c.pdf", 300)];

        let selection = select(candidates, "prompt", 1000, &engine).await.unwrap();
        let included: Vec<&str> = selection.included().map(|c| c.original_path.as_str()).collect();

        assert_eq!(included, vec!["a.pdf", "c.pdf"]);
        assert_eq!(selection.input_tokens, 900);
        assert_eq!(
            selection.candidates[1].exclusion_reason(),
            Some(ExclusionReason::TokenLimitExceeded)
        );
        assert!(selection.warnings[0].contains("b.pdf"));
    }

    #[tokio::test]
    async fn test_ceiling_below_every_file() {
        let engine = ScriptedCompletionEngine::new().with_prompt_tokens(100);
        let candidates = vec![pending("a.pdf", 500), pending("b.pdf", 600)];

        let selection = select(candidates, "prompt", 200, &engine).await.unwrap();
        assert_eq!(selection.included().count(), 0);
        assert!(selection
            .candidates
            .iter()
            .all(|c| c.exclusion_reason() == Some(ExclusionReason::TokenLimitExceeded)));
        assert_eq!(selection.input_tokens, 100);
    }

    #[tokio::test]
    async fn test_excluded_candidates_pass_through() {
        let engine = ScriptedCompletionEngine::new();
        let mut lock = pending("~$a.docx", 1);
        lock.exclude(ExclusionReason::LockFile);

        let selection = select(vec![lock], "p", 10, &engine).await.unwrap();
        assert_eq!(selection.candidates[0].exclusion_reason(), Some(ExclusionReason::LockFile));
        assert!(selection.warnings.is_empty());
    }

    #[test]
    fn test_modality_precedence() {
        let mut image = FileCandidate::new("d", "foto.png", Vec::new(), 0);
        image.include();
        let mut video = FileCandidate::new("d", "clip.mp4", Vec::new(), 0);
        video.include();
        let mut text = FileCandidate::new("d", "edital.pdf", Vec::new(), 0);
        text.include();

        assert_eq!(infer_modality(&[text.clone()]), Modality::Text);
        assert_eq!(infer_modality(&[text.clone(), image.clone()]), Modality::Image);
        assert_eq!(infer_modality(&[image, text, video]), Modality::Video);
        assert_eq!(modality_of_paths(["a.pdf", "b.MP3"]), Modality::Audio);
        assert_eq!(modality_of_paths(Vec::<&str>::new()), Modality::Text);
    }
}
