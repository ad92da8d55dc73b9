//! Adapter interfaces for external systems.
//!
//! The pipeline talks to five collaborators, each behind an async trait so
//! the orchestrator can hold them as injected `Arc<dyn ...>` values:
//! - [`Registry`]: the public procurement registry (PNCP)
//! - [`CompletionEngine`]: the AI service that analyzes documents
//! - [`BlobStore`]: storage for original and normalized files
//! - [`WorkQueue`]: at-least-once message delivery to workers
//! - [`FormatConverter`]: document, image and spreadsheet conversion

pub mod blob;
pub mod completion;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod office;
pub mod queue;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Procurement;

pub use blob::FsBlobStore;
pub use completion::HttpCompletionEngine;
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryBlobStore, MemoryWorkQueue, ScriptedCompletionEngine, StaticRegistry, StubConverter};
pub use office::OfficeConverter;
pub use queue::JsonlWorkQueue;
pub use registry::PncpRegistry;

/// A downloaded document
#[derive(Debug, Clone)]
pub struct Download {
    /// File name reported by the server, or derived from the URL
    pub file_name: String,

    pub content: Vec<u8>,
}

/// Source of procurement records and their documents
#[async_trait]
pub trait Registry: Send + Sync {
    /// Raw procurement payloads updated on `date`
    async fn list_updated(&self, date: NaiveDate) -> Result<Vec<serde_json::Value>>;

    /// Raw document metadata attached to a procurement
    async fn list_documents(&self, procurement: &Procurement) -> Result<Vec<serde_json::Value>>;

    /// Fetch a document's bytes
    async fn download(&self, url: &str) -> Result<Download>;
}

/// Output of a completed analysis call
#[derive(Debug, Clone, Default)]
pub struct CompletionOutput {
    /// Validated structured result
    pub result: serde_json::Value,

    pub input_tokens: u64,

    pub output_tokens: u64,

    pub thinking_tokens: u64,

    /// Search queries issued while grounding the answer
    pub search_queries: Vec<String>,
}

/// The AI service.
///
/// `submit` fails with [`crate::core::PipelineError::Completion`] when the
/// answer is blocked, empty or not a structured object.
#[async_trait]
pub trait CompletionEngine: Send + Sync {
    async fn submit(&self, prompt: &str, content_refs: &[String]) -> Result<CompletionOutput>;

    async fn count_tokens(&self, prompt: &str, content_refs: &[String]) -> Result<u64>;
}

/// Object storage for original and normalized files
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes, returning a URI the completion engine can read
    async fn put(&self, bucket: &str, key: &str, content: &[u8], content_type: &str) -> Result<String>;

    /// Read back bytes previously stored under `uri`
    async fn get(&self, uri: &str) -> Result<Vec<u8>>;
}

/// A message leased from a work queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,

    pub payload: serde_json::Value,

    /// How many times this message has been handed out, including this one
    pub delivery_attempt: u32,
}

/// At-least-once work queue
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish a payload, returning its message id
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<String>;

    /// Lease up to `max` messages; unacknowledged leases are redelivered
    async fn pull(&self, topic: &str, max: usize) -> Result<Vec<QueueMessage>>;

    async fn ack(&self, topic: &str, message_id: &str) -> Result<()>;

    /// Return a message for immediate redelivery
    async fn nack(&self, topic: &str, message_id: &str) -> Result<()>;
}

/// One sheet of a converted spreadsheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetCsv {
    pub sheet_name: String,

    pub csv: Vec<u8>,
}

/// Errors from a format conversion
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("No converter for {from} -> {to}")]
    Unsupported { from: String, to: String },

    #[error("Conversion tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Conversion timed out after {0}s")]
    Timeout(u64),

    #[error("Conversion produced no output")]
    EmptyOutput,

    #[error("I/O error during conversion: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts files into forms the completion engine accepts
#[async_trait]
pub trait FormatConverter: Send + Sync {
    /// Convert `content`, named `file_name`, into the `target` extension (".html", ".png", ...)
    async fn convert(&self, file_name: &str, content: &[u8], target: &str) -> Result<Vec<u8>, ConversionError>;

    /// Split a spreadsheet into one CSV per sheet
    async fn spreadsheet_to_csv(&self, file_name: &str, content: &[u8]) -> Result<Vec<SheetCsv>, ConversionError>;
}
