//! In-memory implementations of the adapter traits.
//!
//! Test doubles: built for unit tests, and for integration tests through
//! the `testing` feature. None of them touch the network or disk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::PipelineError;
use crate::domain::Procurement;

use super::{
    BlobStore, CompletionEngine, CompletionOutput, ConversionError, Download, FormatConverter,
    QueueMessage, Registry, SheetCsv, WorkQueue,
};

/// Blob store keeping everything in a map keyed by `mem://bucket/key`
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: bool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `put` fails, as an unreachable bucket would
    pub fn failing() -> Self {
        Self {
            blobs: Mutex::default(),
            fail_puts: true,
        }
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bucket: &str, key: &str, content: &[u8], _content_type: &str) -> Result<String> {
        if self.fail_puts {
            return Err(PipelineError::Transient(format!("bucket {} unavailable", bucket)).into());
        }
        let uri = format!("mem://{}/{}", bucket, key);
        self.blobs.lock().await.insert(uri.clone(), content.to_vec());
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow!("Blob not found: {}", uri))
    }
}

/// Completion engine with scripted answers.
///
/// `count_tokens` charges `prompt_tokens` plus, per content reference, the
/// `tokens=N` query parameter of the URI (or `uri_tokens` when absent).
/// `submit` plays back scripted outcomes in order, then the default result.
pub struct ScriptedCompletionEngine {
    prompt_tokens: u64,
    uri_tokens: u64,
    output_tokens: u64,
    thinking_tokens: u64,
    default_result: Value,
    outcomes: Mutex<VecDeque<std::result::Result<Value, String>>>,
    fail_counting: bool,
    submits: AtomicUsize,
}

impl Default for ScriptedCompletionEngine {
    fn default() -> Self {
        Self {
            prompt_tokens: 0,
            uri_tokens: 1_000,
            output_tokens: 2_000,
            thinking_tokens: 500,
            default_result: json!({ "summary": "No irregularities found", "risk_score": 1 }),
            outcomes: Mutex::default(),
            fail_counting: false,
            submits: AtomicUsize::new(0),
        }
    }
}

impl ScriptedCompletionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt_tokens(mut self, tokens: u64) -> Self {
        self.prompt_tokens = tokens;
        self
    }

    pub fn with_uri_tokens(mut self, tokens: u64) -> Self {
        self.uri_tokens = tokens;
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.default_result = result;
        self
    }

    /// Next `submit` fails with a completion error carrying `message`
    pub fn then_fail(mut self, message: &str) -> Self {
        self.outcomes.get_mut().push_back(Err(message.to_string()));
        self
    }

    /// Every `count_tokens` call fails
    pub fn failing_count(mut self) -> Self {
        self.fail_counting = true;
        self
    }

    /// Number of `submit` calls so far
    pub fn submit_calls(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    fn uri_cost(&self, uri: &str) -> u64 {
        uri.split_once('?')
            .and_then(|(_, query)| {
                query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("tokens="))
                    .and_then(|n| n.parse().ok())
            })
            .unwrap_or(self.uri_tokens)
    }
}

#[async_trait]
impl CompletionEngine for ScriptedCompletionEngine {
    async fn submit(&self, prompt: &str, content_refs: &[String]) -> Result<CompletionOutput> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().await.pop_front();
        let result = match outcome {
            Some(Err(message)) => return Err(PipelineError::Completion(message).into()),
            Some(Ok(value)) => value,
            None => self.default_result.clone(),
        };
        Ok(CompletionOutput {
            result,
            input_tokens: self.count_tokens(prompt, content_refs).await?,
            output_tokens: self.output_tokens,
            thinking_tokens: self.thinking_tokens,
            search_queries: Vec::new(),
        })
    }

    async fn count_tokens(&self, _prompt: &str, content_refs: &[String]) -> Result<u64> {
        if self.fail_counting {
            return Err(PipelineError::Transient("token counting unavailable".into()).into());
        }
        Ok(self.prompt_tokens + content_refs.iter().map(|uri| self.uri_cost(uri)).sum::<u64>())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Delivery {
    Ready,
    Leased,
    Acked,
}

#[derive(Debug, Clone)]
struct MemoryMessage {
    id: String,
    payload: Value,
    delivery: Delivery,
    attempts: u32,
}

/// Queue holding messages in memory; leases never expire
#[derive(Default)]
pub struct MemoryWorkQueue {
    topics: Mutex<HashMap<String, Vec<MemoryMessage>>>,
    publish_failures: AtomicUsize,
    pulls_before_failure: Option<usize>,
    pulls: AtomicUsize,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` publishes fail
    pub fn failing_publishes(self, count: usize) -> Self {
        self.publish_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Pulls succeed `count` times, then fail for good
    pub fn failing_pulls_after(mut self, count: usize) -> Self {
        self.pulls_before_failure = Some(count);
        self
    }

    /// Every payload ever published to `topic`
    pub async fn published(&self, topic: &str) -> Vec<Value> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|messages| messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages not yet acknowledged
    pub async fn outstanding(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|messages| messages.iter().filter(|m| m.delivery != Delivery::Acked).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<String> {
        let failing = self
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            bail!("Queue unavailable");
        }
        let id = Uuid::new_v4().to_string();
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(MemoryMessage {
                id: id.clone(),
                payload: payload.clone(),
                delivery: Delivery::Ready,
                attempts: 0,
            });
        Ok(id)
    }

    async fn pull(&self, topic: &str, max: usize) -> Result<Vec<QueueMessage>> {
        let attempt = self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.pulls_before_failure.is_some_and(|limit| attempt >= limit) {
            bail!("Queue connection lost");
        }
        let mut topics = self.topics.lock().await;
        let Some(messages) = topics.get_mut(topic) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .iter_mut()
            .filter(|m| m.delivery == Delivery::Ready)
            .take(max)
            .map(|m| {
                m.delivery = Delivery::Leased;
                m.attempts += 1;
                QueueMessage {
                    id: m.id.clone(),
                    payload: m.payload.clone(),
                    delivery_attempt: m.attempts,
                }
            })
            .collect())
    }

    async fn ack(&self, topic: &str, message_id: &str) -> Result<()> {
        self.settle(topic, message_id, Delivery::Acked).await
    }

    async fn nack(&self, topic: &str, message_id: &str) -> Result<()> {
        self.settle(topic, message_id, Delivery::Ready).await
    }
}

impl MemoryWorkQueue {
    async fn settle(&self, topic: &str, message_id: &str, delivery: Delivery) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let message = topics
            .get_mut(topic)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| anyhow!("Message not found: {}", message_id))?;
        if message.delivery != Delivery::Acked {
            message.delivery = delivery;
        }
        Ok(())
    }
}

/// Registry serving canned payloads
#[derive(Default)]
pub struct StaticRegistry {
    updates: HashMap<NaiveDate, Vec<Value>>,
    documents: HashMap<String, Vec<Value>>,
    downloads: HashMap<String, Download>,
    failing_listings: HashSet<String>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_procurement(mut self, date: NaiveDate, raw: Value) -> Self {
        self.updates.entry(date).or_default().push(raw);
        self
    }

    pub fn with_documents(mut self, control_number: &str, documents: Vec<Value>) -> Self {
        self.documents.insert(control_number.to_string(), documents);
        self
    }

    pub fn with_download(mut self, url: &str, file_name: &str, content: Vec<u8>) -> Self {
        self.downloads.insert(
            url.to_string(),
            Download {
                file_name: file_name.to_string(),
                content,
            },
        );
        self
    }

    /// Listing the documents of `control_number` fails
    pub fn failing_documents(mut self, control_number: &str) -> Self {
        self.failing_listings.insert(control_number.to_string());
        self
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn list_updated(&self, date: NaiveDate) -> Result<Vec<Value>> {
        Ok(self.updates.get(&date).cloned().unwrap_or_default())
    }

    async fn list_documents(&self, procurement: &Procurement) -> Result<Vec<Value>> {
        if self.failing_listings.contains(&procurement.control_number) {
            return Err(PipelineError::Transient(format!(
                "document listing failed for {}",
                procurement.control_number
            ))
            .into());
        }
        Ok(self
            .documents
            .get(&procurement.control_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn download(&self, url: &str) -> Result<Download> {
        match self.downloads.get(url) {
            Some(download) => Ok(download.clone()),
            None => bail!("HTTP 404 for {}", url),
        }
    }
}

/// Converter that fabricates output for every target except the failing ones
#[derive(Default)]
pub struct StubConverter {
    failing: HashSet<String>,
}

impl StubConverter {
    /// Conversions to `target` fail (".csv" makes spreadsheet splitting fail)
    pub fn failing(mut self, target: &str) -> Self {
        self.failing.insert(target.to_string());
        self
    }
}

#[async_trait]
impl FormatConverter for StubConverter {
    async fn convert(&self, file_name: &str, content: &[u8], target: &str) -> Result<Vec<u8>, ConversionError> {
        if self.failing.contains(target) {
            return Err(ConversionError::ToolFailed {
                tool: "stub".to_string(),
                message: format!("refusing {} -> {}", file_name, target),
            });
        }
        let mut out = format!("{} as {}:", file_name, target).into_bytes();
        out.extend_from_slice(content);
        Ok(out)
    }

    async fn spreadsheet_to_csv(&self, file_name: &str, _content: &[u8]) -> Result<Vec<SheetCsv>, ConversionError> {
        if self.failing.contains(".csv") {
            return Err(ConversionError::ToolFailed {
                tool: "stub".to_string(),
                message: format!("refusing {}", file_name),
            });
        }
        Ok(["Sheet1", "Sheet2"]
            .iter()
            .map(|sheet| SheetCsv {
                sheet_name: sheet.to_string(),
                csv: format!("sheet,{}\n", sheet).into_bytes(),
            })
            .collect())
    }
}
