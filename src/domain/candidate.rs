//! File candidates: one per extracted leaf file, carried through
//! normalization and selection.
//!
//! A candidate is either still undecided, included in the analysis, or
//! excluded with exactly one reason. The [`Disposition`] enum makes the
//! "included XOR excluded" rule a property of the type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a file was left out of an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExclusionReason {
    /// Temporary office lock file (`~$name.docx`), no real content
    LockFile,

    /// The file looked like an archive but could not be opened
    ExtractionFailed,

    /// No conversion route exists for the file type
    UnsupportedExtension,

    /// Every conversion route failed
    ConversionFailed,

    /// Adding the file would overflow the completion engine's token ceiling
    TokenLimitExceeded,
}

impl ExclusionReason {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockFile => "LOCK_FILE",
            Self::ExtractionFailed => "EXTRACTION_FAILED",
            Self::UnsupportedExtension => "UNSUPPORTED_EXTENSION",
            Self::ConversionFailed => "CONVERSION_FAILED",
            Self::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
        }
    }

    /// Human-readable explanation, shown next to the file in reports
    pub fn description(&self) -> &'static str {
        match self {
            Self::LockFile => "Temporary lock file, ignored because it holds no document content.",
            Self::ExtractionFailed => "Archive could not be extracted.",
            Self::UnsupportedExtension => "File type is not supported.",
            Self::ConversionFailed => "File could not be converted.",
            Self::TokenLimitExceeded => "File excluded because the token limit was exceeded.",
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExclusionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOCK_FILE" => Ok(Self::LockFile),
            "EXTRACTION_FAILED" => Ok(Self::ExtractionFailed),
            "UNSUPPORTED_EXTENSION" => Ok(Self::UnsupportedExtension),
            "CONVERSION_FAILED" => Ok(Self::ConversionFailed),
            "TOKEN_LIMIT_EXCEEDED" => Ok(Self::TokenLimitExceeded),
            other => Err(format!("unknown exclusion reason: {}", other)),
        }
    }
}

/// How a file earned its position in the selection order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrioritizationLogic {
    /// Keyword found in the source document's metadata (type or title)
    ByMetadata { keyword: String },

    /// Keyword found in the file name
    ByKeyword { keyword: String },

    /// No keyword matched
    NoPriority,
}

impl PrioritizationLogic {
    pub fn keyword(&self) -> Option<&str> {
        match self {
            Self::ByMetadata { keyword } | Self::ByKeyword { keyword } => Some(keyword),
            Self::NoPriority => None,
        }
    }
}

impl fmt::Display for PrioritizationLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByMetadata { keyword } => {
                write!(f, "Prioritized for containing '{}' in the metadata.", keyword)
            }
            Self::ByKeyword { keyword } => {
                write!(f, "Prioritized for containing '{}' in the name.", keyword)
            }
            Self::NoPriority => f.write_str("No prioritization."),
        }
    }
}

/// Input modality of an analysis, selects the pricing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Text,
    Audio,
    Image,
    Video,
}

impl Default for Modality {
    fn default() -> Self {
        Self::Text
    }
}

/// Where a candidate stands after the normalization and selection stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Disposition {
    /// Normalized and eligible, not yet measured against the token ceiling
    Pending,

    /// Part of the analysis input
    Included,

    /// Left out for the given reason
    Excluded(ExclusionReason),
}

/// One normalized artifact derived from a leaf file.
///
/// Most files normalize to a single part; spreadsheets produce one CSV
/// part per sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPart {
    /// Path of the normalized artifact, relative to the source document
    pub path: String,

    /// Normalized bytes handed to the completion engine
    pub content: Vec<u8>,

    /// MIME type used when uploading
    pub content_type: String,
}

/// A single extracted file considered for inclusion in an analysis
#[derive(Debug, Clone)]
pub struct FileCandidate {
    /// Synthetic id of the source document this file came from
    pub source_document_id: String,

    /// Composite path inside the source document (archive/member/...)
    pub original_path: String,

    /// Raw bytes as extracted
    pub original_content: Vec<u8>,

    /// Archive nesting depth (0 for a plain download)
    pub nesting_level: u32,

    /// The file looked like an archive but could not be opened
    pub extraction_failed: bool,

    /// Normalized path (extension reflects the converted format)
    pub ai_path: String,

    /// Normalized content, empty until normalization succeeds
    pub parts: Vec<NormalizedPart>,

    /// Blob store URIs of the normalized parts, filled on upload
    pub ai_uris: Vec<String>,

    /// Extension inferred by content sniffing, when the declared one was unknown
    pub inferred_extension: Option<String>,

    /// A lower-fidelity fallback conversion produced the parts
    pub used_fallback_conversion: bool,

    /// Position in the selection order (lower first)
    pub priority: usize,

    /// How `priority` was decided
    pub prioritization: PrioritizationLogic,

    /// Inclusion state
    pub disposition: Disposition,
}

impl FileCandidate {
    /// Create an undecided candidate for an extracted leaf
    pub fn new(
        source_document_id: impl Into<String>,
        original_path: impl Into<String>,
        original_content: Vec<u8>,
        nesting_level: u32,
    ) -> Self {
        let original_path = original_path.into();
        Self {
            source_document_id: source_document_id.into(),
            ai_path: original_path.clone(),
            original_path,
            original_content,
            nesting_level,
            extraction_failed: false,
            parts: Vec::new(),
            ai_uris: Vec::new(),
            inferred_extension: None,
            used_fallback_conversion: false,
            priority: usize::MAX,
            prioritization: PrioritizationLogic::NoPriority,
            disposition: Disposition::Pending,
        }
    }

    pub fn is_included(&self) -> bool {
        matches!(self.disposition, Disposition::Included)
    }

    pub fn exclusion_reason(&self) -> Option<ExclusionReason> {
        match self.disposition {
            Disposition::Excluded(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn exclude(&mut self, reason: ExclusionReason) {
        self.disposition = Disposition::Excluded(reason);
    }

    pub fn include(&mut self) {
        self.disposition = Disposition::Included;
    }

    /// Lowercased extension of the original path, with the leading dot
    pub fn original_extension(&self) -> String {
        extension_of(&self.original_path)
    }

    /// Last path component of the original path
    pub fn file_name(&self) -> &str {
        file_name_of(&self.original_path)
    }
}

/// Lowercased extension (with dot) of a slash-separated path, or "" if none
pub fn extension_of(path: &str) -> String {
    let name = file_name_of(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_lowercase(),
        _ => String::new(),
    }
}

/// Last component of a slash-separated path
pub fn file_name_of(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Path with its extension replaced (`dir/a.docx` + `.html` -> `dir/a.html`)
pub fn with_extension(path: &str, new_ext: &str) -> String {
    let name = file_name_of(path);
    let stem_len = match name.rfind('.') {
        Some(idx) if idx > 0 => path.len() - name.len() + idx,
        _ => path.len(),
    };
    format!("{}{}", &path[..stem_len], new_ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_is_exclusive() {
        let mut candidate = FileCandidate::new("doc-1", "edital.pdf", b"%PDF".to_vec(), 0);
        assert!(!candidate.is_included());
        assert_eq!(candidate.exclusion_reason(), None);

        candidate.include();
        assert!(candidate.is_included());
        assert_eq!(candidate.exclusion_reason(), None);

        candidate.exclude(ExclusionReason::TokenLimitExceeded);
        assert!(!candidate.is_included());
        assert_eq!(
            candidate.exclusion_reason(),
            Some(ExclusionReason::TokenLimitExceeded)
        );
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(extension_of("a/b/Edital.PDF"), ".pdf");
        assert_eq!(extension_of("archive.zip/.hidden"), "");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(file_name_of("x.zip/inner/file.txt"), "file.txt");
        assert_eq!(with_extension("x.zip/inner/file.docx", ".html"), "x.zip/inner/file.html");
        assert_eq!(with_extension("x.zip/README", ".txt"), "x.zip/README.txt");
    }

    #[test]
    fn test_exclusion_reason_round_trip() {
        for reason in [
            ExclusionReason::LockFile,
            ExclusionReason::ExtractionFailed,
            ExclusionReason::UnsupportedExtension,
            ExclusionReason::ConversionFailed,
            ExclusionReason::TokenLimitExceeded,
        ] {
            assert_eq!(reason.as_str().parse::<ExclusionReason>().unwrap(), reason);
        }
        assert!("SOMETHING_ELSE".parse::<ExclusionReason>().is_err());
    }
}
