//! JSONL-backed work queue.
//!
//! Append-only log per topic with state derived from replay. Pulling a
//! message appends a lease; a lease that is neither acked nor nacked
//! before its visibility timeout expires makes the message deliverable
//! again, which gives at-least-once delivery across crashed workers.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{QueueMessage, WorkQueue};

/// Errors from the queue log
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One line of the queue log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,

    pub message_id: String,

    pub event_type: QueueEventType,

    /// Payload for `Published`, lease expiry for `Leased`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    Published,
    Leased,
    Acked,
    Nacked,
}

#[derive(Debug, Clone, PartialEq)]
enum MessageState {
    Ready,
    Leased { until: DateTime<Utc> },
    Done,
}

/// Current state of one message, derived from the log
#[derive(Debug, Clone)]
struct MessageEntry {
    seq: usize,
    payload: serde_json::Value,
    state: MessageState,
    deliveries: u32,
}

/// Work queue stored as `{dir}/{topic}.jsonl`
pub struct JsonlWorkQueue {
    dir: PathBuf,

    /// Seconds a pulled message stays invisible to other consumers
    visibility_timeout: Duration,

    /// Serializes replay-then-append sequences within this process
    write_lock: Mutex<()>,
}

impl JsonlWorkQueue {
    pub fn new(dir: PathBuf, visibility_timeout_secs: i64) -> Self {
        Self {
            dir,
            visibility_timeout: Duration::seconds(visibility_timeout_secs),
            write_lock: Mutex::new(()),
        }
    }

    fn topic_path(&self, topic: &str) -> Result<PathBuf, QueueError> {
        let valid = !topic.is_empty()
            && topic
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !topic.starts_with('.');
        if !valid {
            return Err(QueueError::InvalidTopic(topic.to_string()));
        }
        Ok(self.dir.join(format!("{}.jsonl", topic)))
    }

    async fn append_events(&self, topic: &str, events: &[QueueEvent]) -> Result<(), QueueError> {
        if events.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.topic_path(topic)?)
            .await?;

        let mut buffer = String::new();
        for event in events {
            buffer.push_str(&serde_json::to_string(event)?);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn replay(&self, topic: &str) -> Result<HashMap<String, MessageEntry>, QueueError> {
        let mut messages: HashMap<String, MessageEntry> = HashMap::new();
        let path = self.topic_path(topic)?;
        if !path.exists() {
            return Ok(messages);
        }

        let file = File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: QueueEvent = serde_json::from_str(&line)?;
            Self::apply_event(&mut messages, event);
        }
        Ok(messages)
    }

    fn apply_event(messages: &mut HashMap<String, MessageEntry>, event: QueueEvent) {
        match event.event_type {
            QueueEventType::Published => {
                let seq = messages.len();
                messages.entry(event.message_id).or_insert(MessageEntry {
                    seq,
                    payload: event.data.unwrap_or(serde_json::Value::Null),
                    state: MessageState::Ready,
                    deliveries: 0,
                });
            }
            QueueEventType::Leased => {
                if let Some(entry) = messages.get_mut(&event.message_id) {
                    let until = event
                        .data
                        .as_ref()
                        .and_then(|d| d.get("until"))
                        .and_then(|u| serde_json::from_value::<DateTime<Utc>>(u.clone()).ok())
                        .unwrap_or(event.timestamp);
                    if entry.state != MessageState::Done {
                        entry.state = MessageState::Leased { until };
                    }
                    entry.deliveries += 1;
                }
            }
            QueueEventType::Acked => {
                if let Some(entry) = messages.get_mut(&event.message_id) {
                    entry.state = MessageState::Done;
                }
            }
            QueueEventType::Nacked => {
                if let Some(entry) = messages.get_mut(&event.message_id) {
                    if entry.state != MessageState::Done {
                        entry.state = MessageState::Ready;
                    }
                }
            }
        }
    }

    fn event(message_id: &str, event_type: QueueEventType, data: Option<serde_json::Value>) -> QueueEvent {
        QueueEvent {
            timestamp: Utc::now(),
            message_id: message_id.to_string(),
            event_type,
            data,
        }
    }

    async fn settle(&self, topic: &str, message_id: &str, event_type: QueueEventType) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        let messages = self.replay(topic).await?;
        if !messages.contains_key(message_id) {
            return Err(QueueError::NotFound(message_id.to_string()));
        }
        self.append_events(topic, &[Self::event(message_id, event_type, None)]).await
    }

    /// Messages not yet acknowledged
    pub async fn outstanding(&self, topic: &str) -> Result<usize, QueueError> {
        let messages = self.replay(topic).await?;
        Ok(messages.values().filter(|m| m.state != MessageState::Done).count())
    }
}

#[async_trait]
impl WorkQueue for JsonlWorkQueue {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<String> {
        let _guard = self.write_lock.lock().await;
        let message_id = Uuid::new_v4().to_string();
        self.append_events(
            topic,
            &[Self::event(&message_id, QueueEventType::Published, Some(payload.clone()))],
        )
        .await?;
        debug!(topic, message_id = %message_id, "Message published");
        Ok(message_id)
    }

    async fn pull(&self, topic: &str, max: usize) -> Result<Vec<QueueMessage>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let messages = self.replay(topic).await?;

        let mut deliverable: Vec<(&String, &MessageEntry)> = messages
            .iter()
            .filter(|(_, m)| match m.state {
                MessageState::Ready => true,
                MessageState::Leased { until } => until <= now,
                MessageState::Done => false,
            })
            .collect();
        deliverable.sort_by_key(|(_, m)| m.seq);
        deliverable.truncate(max);

        let until = now + self.visibility_timeout;
        let events: Vec<QueueEvent> = deliverable
            .iter()
            .map(|(id, _)| Self::event(id, QueueEventType::Leased, Some(serde_json::json!({ "until": until }))))
            .collect();
        self.append_events(topic, &events).await?;

        Ok(deliverable
            .into_iter()
            .map(|(id, m)| QueueMessage {
                id: id.clone(),
                payload: m.payload.clone(),
                delivery_attempt: m.deliveries + 1,
            })
            .collect())
    }

    async fn ack(&self, topic: &str, message_id: &str) -> Result<()> {
        self.settle(topic, message_id, QueueEventType::Acked).await?;
        Ok(())
    }

    async fn nack(&self, topic: &str, message_id: &str) -> Result<()> {
        self.settle(topic, message_id, QueueEventType::Nacked).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_pull_ack() {
        let temp = TempDir::new().unwrap();
        let queue = JsonlWorkQueue::new(temp.path().to_path_buf(), 600);

        queue.publish("analysis", &json!({"n": 1})).await.unwrap();
        queue.publish("analysis", &json!({"n": 2})).await.unwrap();

        let first = queue.pull("analysis", 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, json!({"n": 1}));
        assert_eq!(first[0].delivery_attempt, 1);

        // leased message stays invisible
        let second = queue.pull("analysis", 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, json!({"n": 2}));

        queue.ack("analysis", &first[0].id).await.unwrap();
        queue.ack("analysis", &second[0].id).await.unwrap();
        assert_eq!(queue.outstanding("analysis").await.unwrap(), 0);
        assert!(queue.pull("analysis", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nack_and_expired_lease_redeliver() {
        let temp = TempDir::new().unwrap();
        let queue = JsonlWorkQueue::new(temp.path().to_path_buf(), 0);

        let id = queue.publish("t", &json!("work")).await.unwrap();
        let first = queue.pull("t", 1).await.unwrap();
        assert_eq!(first[0].id, id);

        // zero visibility timeout: the lease is already expired
        let again = queue.pull("t", 1).await.unwrap();
        assert_eq!(again[0].delivery_attempt, 2);

        queue.nack("t", &id).await.unwrap();
        let third = queue.pull("t", 1).await.unwrap();
        assert_eq!(third[0].delivery_attempt, 3);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let queue = JsonlWorkQueue::new(temp.path().to_path_buf(), 600);
            queue.publish("t", &json!(1)).await.unwrap();
        }
        let reopened = JsonlWorkQueue::new(temp.path().to_path_buf(), 600);
        assert_eq!(reopened.outstanding("t").await.unwrap(), 1);
        assert!(reopened.ack("t", "missing").await.is_err());
        assert!(reopened.publish("../escape", &json!(1)).await.is_err());
    }
}
