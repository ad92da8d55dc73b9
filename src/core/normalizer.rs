//! Format normalization.
//!
//! Turns extracted leaf files into forms the completion engine accepts,
//! or excludes them with a typed reason. Each file goes through:
//! 1. Lock-file patterns (`~$edital.docx`) -> `LOCK_FILE`
//! 2. Failed extractions -> `EXTRACTION_FAILED`
//! 3. Route by declared extension, sniffing the content when the
//!    extension is unknown -> `UNSUPPORTED_EXTENSION` if nothing matches
//! 4. A failed route is retried once through the PDF, then PNG fallback
//!    -> `CONVERSION_FAILED` if that fails too
//!
//! One file's failure never affects the others.

use std::io::Cursor;
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};

use crate::adapters::{ConversionError, FormatConverter};
use crate::domain::candidate::{file_name_of, with_extension};
use crate::domain::{ExclusionReason, FileCandidate, NormalizedPart};

/// How a file type reaches its AI-consumable form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Natively supported, sent as is
    Passthrough,

    /// Text-like, renamed to the given extension without transcoding
    Relabel(&'static str),

    /// Transcoded into the given extension
    Convert(&'static str),

    /// One CSV per sheet
    Spreadsheet,
}

const PASSTHROUGH_EXTENSIONS: &[&str] = &[
    ".pdf", ".csv", ".txt", ".md", ".html", ".mp4", ".mov", ".avi", ".mkv", ".mp3", ".wav",
    ".flac", ".ogg", ".jpg", ".jpeg", ".png",
];

const SPREADSHEET_EXTENSIONS: &[&str] = &[".xlsx", ".xls", ".xlsb", ".ods"];

/// Fallback targets, tried in order
const FALLBACK_TARGETS: &[&str] = &[".pdf", ".png"];

fn default_lock_patterns() -> Vec<String> {
    vec!["~$*".to_string(), ".~lock.*#".to_string()]
}

/// Conversion route for a lowercased extension
pub fn route_for(ext: &str) -> Option<Route> {
    if PASSTHROUGH_EXTENSIONS.contains(&ext) {
        return Some(Route::Passthrough);
    }
    if SPREADSHEET_EXTENSIONS.contains(&ext) {
        return Some(Route::Spreadsheet);
    }
    match ext {
        ".docx" => Some(Route::Convert(".html")),
        ".rtf" | ".doc" => Some(Route::Convert(".txt")),
        ".bmp" => Some(Route::Convert(".png")),
        ".gif" => Some(Route::Convert(".mp4")),
        ".xml" | ".json" => Some(Route::Relabel(".txt")),
        _ => None,
    }
}

/// MIME type used when uploading a normalized part
pub fn content_type_for(ext: &str) -> &'static str {
    match ext {
        ".pdf" => "application/pdf",
        ".csv" => "text/csv",
        ".txt" => "text/plain",
        ".md" => "text/markdown",
        ".html" => "text/html",
        ".mp4" => "video/mp4",
        ".mov" => "video/quicktime",
        ".avi" => "video/x-msvideo",
        ".mkv" => "video/x-matroska",
        ".mp3" => "audio/mpeg",
        ".wav" => "audio/wav",
        ".flac" => "audio/flac",
        ".ogg" => "audio/ogg",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        _ => "application/octet-stream",
    }
}

/// Infer an extension from magic bytes
pub fn sniff_extension(content: &[u8]) -> Option<&'static str> {
    const OLE2: &[u8] = &[0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1];

    if content.is_empty() {
        return None;
    }
    if content.starts_with(b"%PDF") {
        return Some(".pdf");
    }
    if content.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(".png");
    }
    if content.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some(".jpeg");
    }
    if content.starts_with(b"GIF87a") || content.starts_with(b"GIF89a") {
        return Some(".gif");
    }
    if content.len() > 14 && content.starts_with(b"BM") {
        return Some(".bmp");
    }
    if content.starts_with(b"{\\rtf") {
        return Some(".rtf");
    }
    if content.starts_with(b"PK\x03\x04") {
        return sniff_zip_document(content);
    }
    if content.starts_with(OLE2) {
        let workbook: Vec<u8> = "Workbook".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let is_workbook = content.windows(workbook.len()).any(|w| w == workbook.as_slice());
        return Some(if is_workbook { ".xls" } else { ".doc" });
    }
    if content.len() >= 12 && &content[0..4] == b"RIFF" {
        return match &content[8..12] {
            b"WAVE" => Some(".wav"),
            b"AVI " => Some(".avi"),
            _ => None,
        };
    }
    if content.len() >= 12 && &content[4..8] == b"ftyp" {
        return Some(if &content[8..10] == b"qt" { ".mov" } else { ".mp4" });
    }
    if content.starts_with(b"ID3") || content.starts_with(&[0xff, 0xfb]) {
        return Some(".mp3");
    }
    if content.starts_with(b"OggS") {
        return Some(".ogg");
    }
    if content.starts_with(b"fLaC") {
        return Some(".flac");
    }
    if content.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        return Some(".mkv");
    }

    sniff_text(content)
}

fn sniff_zip_document(content: &[u8]) -> Option<&'static str> {
    let mut archive = zip::ZipArchive::new(Cursor::new(content)).ok()?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let has = |name: &str| names.iter().any(|n| n == name);

    if has("word/document.xml") {
        return Some(".docx");
    }
    if has("xl/workbook.xml") {
        return Some(".xlsx");
    }
    if has("xl/workbook.bin") {
        return Some(".xlsb");
    }
    if has("ppt/presentation.xml") {
        return Some(".pptx");
    }
    if has("mimetype") {
        let mut mimetype = String::new();
        let mut entry = archive.by_name("mimetype").ok()?;
        std::io::Read::read_to_string(&mut entry, &mut mimetype).ok()?;
        return match mimetype.trim() {
            "application/vnd.oasis.opendocument.text" => Some(".odt"),
            "application/vnd.oasis.opendocument.spreadsheet" => Some(".ods"),
            "application/vnd.oasis.opendocument.presentation" => Some(".odp"),
            _ => None,
        };
    }
    None
}

fn sniff_text(content: &[u8]) -> Option<&'static str> {
    let sample = &content[..content.len().min(8192)];
    if sample.contains(&0) {
        return None;
    }
    // A cut multi-byte sequence at the end of the sample is still text
    let text = match std::str::from_utf8(sample) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&sample[..e.valid_up_to()]).ok()?,
        Err(_) => return None,
    };

    let head = text.trim_start().to_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        return Some(".html");
    }
    if head.starts_with("<?xml") {
        return Some(".xml");
    }
    if (head.starts_with('{') || head.starts_with('['))
        && serde_json::from_slice::<serde_json::Value>(content).is_ok()
    {
        return Some(".json");
    }
    Some(".txt")
}

/// Result of routing one file
struct Normalized {
    ai_path: String,
    parts: Vec<NormalizedPart>,
}

/// Applies the normalization policy to file candidates
pub struct Normalizer {
    converter: Arc<dyn FormatConverter>,
    lock_patterns: Vec<Pattern>,
}

impl Normalizer {
    pub fn new(converter: Arc<dyn FormatConverter>) -> Self {
        Self::with_lock_patterns(converter, &default_lock_patterns())
    }

    /// Use custom lock-file glob patterns; invalid patterns are ignored
    pub fn with_lock_patterns(converter: Arc<dyn FormatConverter>, patterns: &[String]) -> Self {
        let lock_patterns = patterns
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid lock-file pattern");
                    None
                }
            })
            .collect();
        Self {
            converter,
            lock_patterns,
        }
    }

    pub fn is_lock_file(&self, file_name: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            ..Default::default()
        };
        self.lock_patterns
            .iter()
            .any(|p| p.matches_with(file_name, options))
    }

    /// Normalize every candidate; the output has the same length and order
    pub async fn normalize(&self, candidates: Vec<FileCandidate>) -> Vec<FileCandidate> {
        let mut normalized = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            normalized.push(self.normalize_one(candidate).await);
        }
        normalized
    }

    async fn normalize_one(&self, mut candidate: FileCandidate) -> FileCandidate {
        if self.is_lock_file(candidate.file_name()) {
            debug!(path = %candidate.original_path, "Excluding lock file");
            candidate.exclude(ExclusionReason::LockFile);
            return candidate;
        }
        if candidate.extraction_failed {
            debug!(path = %candidate.original_path, "Excluding unextractable archive");
            candidate.exclude(ExclusionReason::ExtractionFailed);
            return candidate;
        }

        let declared = candidate.original_extension();
        let (base_path, ext, route) = match route_for(&declared) {
            Some(route) => (candidate.original_path.clone(), declared, Some(route)),
            None => match sniff_extension(&candidate.original_content) {
                Some(sniffed) => {
                    debug!(
                        path = %candidate.original_path,
                        declared = %declared,
                        inferred = sniffed,
                        "Inferred file type from content"
                    );
                    candidate.inferred_extension = Some(sniffed.to_string());
                    (
                        with_extension(&candidate.original_path, sniffed),
                        sniffed.to_string(),
                        route_for(sniffed),
                    )
                }
                None => {
                    debug!(path = %candidate.original_path, "Unsupported file type");
                    candidate.exclude(ExclusionReason::UnsupportedExtension);
                    return candidate;
                }
            },
        };

        let primary = match route {
            Some(route) => self.apply(&base_path, &candidate.original_content, route).await,
            None => Err(ConversionError::Unsupported {
                from: ext.clone(),
                to: "any".to_string(),
            }),
        };

        let outcome = match primary {
            Ok(normalized) => Ok(normalized),
            Err(e) => {
                warn!(
                    path = %candidate.original_path,
                    error = %e,
                    "Conversion failed, trying fallback"
                );
                match self.fallback(&base_path, &candidate.original_content).await {
                    Ok(normalized) => {
                        candidate.used_fallback_conversion = true;
                        Ok(normalized)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(normalized) => {
                candidate.ai_path = normalized.ai_path;
                candidate.parts = normalized.parts;
            }
            Err(e) => {
                warn!(path = %candidate.original_path, error = %e, "Fallback conversion failed");
                candidate.exclude(ExclusionReason::ConversionFailed);
            }
        }
        candidate
    }

    async fn apply(&self, base_path: &str, content: &[u8], route: Route) -> Result<Normalized, ConversionError> {
        match route {
            Route::Passthrough => Ok(single_part(base_path.to_string(), content.to_vec())),
            Route::Relabel(target) => Ok(single_part(with_extension(base_path, target), content.to_vec())),
            Route::Convert(target) => {
                let converted = self
                    .converter
                    .convert(file_name_of(base_path), content, target)
                    .await?;
                if converted.is_empty() {
                    return Err(ConversionError::EmptyOutput);
                }
                Ok(single_part(with_extension(base_path, target), converted))
            }
            Route::Spreadsheet => {
                let sheets = self
                    .converter
                    .spreadsheet_to_csv(file_name_of(base_path), content)
                    .await?;
                if sheets.is_empty() {
                    return Err(ConversionError::EmptyOutput);
                }
                let stem = with_extension(base_path, "");
                let parts = sheets
                    .into_iter()
                    .map(|sheet| NormalizedPart {
                        path: format!("{}_{}.csv", stem, sheet.sheet_name.replace(['/', '\\'], "_")),
                        content: sheet.csv,
                        content_type: content_type_for(".csv").to_string(),
                    })
                    .collect();
                Ok(Normalized {
                    ai_path: with_extension(base_path, ".csv"),
                    parts,
                })
            }
        }
    }

    async fn fallback(&self, base_path: &str, content: &[u8]) -> Result<Normalized, ConversionError> {
        let mut last_error = ConversionError::EmptyOutput;
        for target in FALLBACK_TARGETS {
            match self.apply(base_path, content, Route::Convert(target)).await {
                Ok(normalized) => return Ok(normalized),
                Err(e) => {
                    debug!(path = %base_path, target, error = %e, "Fallback target failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

fn single_part(path: String, content: Vec<u8>) -> Normalized {
    let content_type = content_type_for(&crate::domain::candidate::extension_of(&path)).to_string();
    Normalized {
        parts: vec![NormalizedPart {
            path: path.clone(),
            content,
            content_type,
        }],
        ai_path: path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StubConverter;

    fn candidate(path: &str, content: &[u8]) -> FileCandidate {
        FileCandidate::new("doc-1", path, content.to_vec(), 0)
    }

    #[test]
    fn test_routes() {
        assert_eq!(route_for(".pdf"), Some(Route::Passthrough));
        assert_eq!(route_for(".docx"), Some(Route::Convert(".html")));
        assert_eq!(route_for(".json"), Some(Route::Relabel(".txt")));
        assert_eq!(route_for(".ods"), Some(Route::Spreadsheet));
        assert_eq!(route_for(".exe"), None);
    }

    #[test]
    fn test_sniffing() {
        assert_eq!(sniff_extension(b"%PDF-1.7\n"), Some(".pdf"));
        assert_eq!(sniff_extension(b"{\\rtf1\\ansi"), Some(".rtf"));
        assert_eq!(sniff_extension(b"  <!DOCTYPE html><html>"), Some(".html"));
        assert_eq!(sniff_extension(br#"{"a": 1}"#), Some(".json"));
        assert_eq!(sniff_extension("Prefeitura de São Paulo".as_bytes()), Some(".txt"));
        assert_eq!(sniff_extension(&[0x00, 0x01, 0x02, 0x03]), None);
    }

    #[tokio::test]
    async fn test_policy_order() {
        let normalizer = Normalizer::new(Arc::new(StubConverter::default()));

        let mut failed = candidate("a.zip", b"PK\x03\x04garbage");
        failed.extraction_failed = true;

        let out = normalizer
            .normalize(vec![
                candidate("dir/~$edital.docx", b"lock"),
                failed,
                candidate("data.bin", &[0x00, 0xff, 0x00]),
                candidate("edital.pdf", b"%PDF-1.4"),
                candidate("dados.json", b"{}"),
            ])
            .await;

        assert_eq!(out[0].exclusion_reason(), Some(ExclusionReason::LockFile));
        assert_eq!(out[1].exclusion_reason(), Some(ExclusionReason::ExtractionFailed));
        assert_eq!(out[2].exclusion_reason(), Some(ExclusionReason::UnsupportedExtension));
        assert_eq!(out[3].exclusion_reason(), None);
        assert_eq!(out[3].ai_path, "edital.pdf");
        assert_eq!(out[4].ai_path, "dados.txt");
        assert_eq!(out[4].parts[0].content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_conversion_and_sheets() {
        let normalizer = Normalizer::new(Arc::new(StubConverter::default()));
        let out = normalizer
            .normalize(vec![
                candidate("x.zip/termo.docx", b"docx bytes"),
                candidate("x.zip/planilha.xlsx", b"xlsx bytes"),
            ])
            .await;

        assert_eq!(out[0].ai_path, "x.zip/termo.html");
        assert_eq!(out[0].parts.len(), 1);

        assert_eq!(out[1].ai_path, "x.zip/planilha.csv");
        let paths: Vec<&str> = out[1].parts.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["x.zip/planilha_Sheet1.csv", "x.zip/planilha_Sheet2.csv"]);
    }

    #[tokio::test]
    async fn test_fallback_then_failure() {
        let converter = StubConverter::default().failing(".html");
        let normalizer = Normalizer::new(Arc::new(converter));
        let out = normalizer.normalize(vec![candidate("termo.docx", b"docx")]).await;
        assert!(out[0].used_fallback_conversion);
        assert_eq!(out[0].ai_path, "termo.pdf");

        let converter = StubConverter::default()
            .failing(".html")
            .failing(".pdf")
            .failing(".png");
        let normalizer = Normalizer::new(Arc::new(converter));
        let out = normalizer.normalize(vec![candidate("termo.docx", b"docx")]).await;
        assert_eq!(out[0].exclusion_reason(), Some(ExclusionReason::ConversionFailed));
    }

    #[tokio::test]
    async fn test_inferred_extension_recorded() {
        let normalizer = Normalizer::new(Arc::new(StubConverter::default()));
        let out = normalizer.normalize(vec![candidate("scan.dat", b"%PDF-1.5 ...")]).await;
        assert_eq!(out[0].inferred_extension.as_deref(), Some(".pdf"));
        assert_eq!(out[0].ai_path, "scan.pdf");
        assert!(out[0].exclusion_reason().is_none());
    }
}
