//! Resource limits for archive extraction.
//!
//! Archives come from untrusted uploads. These caps bound how deep the
//! extractor descends and how many bytes and files one source document
//! may expand into:
//! - Nesting depth
//! - Total extracted bytes per document
//! - Size of a single entry
//! - Number of leaf files per document

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extraction caps for one source document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionLimits {
    /// Deepest nesting level at which archives are still opened (default: 5)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Total bytes extracted from one document (default: 512MB)
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,

    /// Largest single entry (default: 256MB)
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: u64,

    /// Leaf files emitted per document (default: 10000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Wall-clock limit for one run of an external extraction tool, in seconds
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_depth() -> u32 {
    5
}
fn default_max_total_bytes() -> u64 {
    512 * 1024 * 1024
} // 512MB
fn default_max_entry_bytes() -> u64 {
    256 * 1024 * 1024
} // 256MB
fn default_max_entries() -> usize {
    10_000
}
fn default_tool_timeout_secs() -> u64 {
    120
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_total_bytes: default_max_total_bytes(),
            max_entry_bytes: default_max_entry_bytes(),
            max_entries: default_max_entries(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

impl ExtractionLimits {
    /// Check whether an archive found at `depth` may be opened
    pub fn check_depth(&self, depth: u32) -> Result<(), LimitViolation> {
        if depth >= self.max_depth {
            return Err(LimitViolation::MaxDepth {
                depth,
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    /// Check a single entry's declared or actual size
    pub fn check_entry(&self, path: &str, size: u64) -> Result<(), LimitViolation> {
        if size > self.max_entry_bytes {
            return Err(LimitViolation::MaxEntryBytes {
                path: path.to_string(),
                actual: size,
                limit: self.max_entry_bytes,
            });
        }
        Ok(())
    }

    /// Check the running byte total after adding `additional` bytes
    pub fn check_total(&self, tracker: &ExtractionTracker, additional: u64) -> Result<(), LimitViolation> {
        let total = tracker.bytes_extracted + additional;
        if total > self.max_total_bytes {
            return Err(LimitViolation::MaxTotalBytes {
                actual: total,
                limit: self.max_total_bytes,
            });
        }
        Ok(())
    }

    /// Remaining bytes any single read may produce
    pub fn read_allowance(&self, tracker: &ExtractionTracker) -> u64 {
        self.max_entry_bytes
            .min(self.max_total_bytes.saturating_sub(tracker.bytes_extracted))
    }
}

/// Tracks resource usage while extracting one document
#[derive(Debug, Clone, Default)]
pub struct ExtractionTracker {
    /// Bytes produced by decompression so far
    pub bytes_extracted: u64,

    /// Leaf files emitted so far
    pub entries_emitted: usize,

    /// Archives opened so far
    pub archives_opened: usize,
}

impl ExtractionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes produced by an archive expansion
    pub fn record_bytes(&mut self, bytes: u64) {
        self.bytes_extracted += bytes;
    }
}

/// Limit violations that degrade an archive to an opaque leaf
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimitViolation {
    #[error("Maximum nesting depth reached: {depth} >= {limit}")]
    MaxDepth { depth: u32, limit: u32 },

    #[error("Maximum extracted bytes exceeded: {actual} > {limit}")]
    MaxTotalBytes { actual: u64, limit: u64 },

    #[error("Entry '{path}' too large: {actual} > {limit}")]
    MaxEntryBytes { path: String, actual: u64, limit: u64 },
}
