//! Queue consumer for analysis requests.
//!
//! Pulls messages published by the trigger, runs each analysis on the
//! orchestrator and acknowledges it. Infrastructure errors (the store is
//! unreachable, ...) nack the message so another delivery retries it;
//! analysis failures are already recorded on the record and get acked.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{QueueMessage, WorkQueue};
use crate::core::{BatchReport, Orchestrator, ProcessOutcome};

/// Payload published by the trigger
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisRequest {
    pub analysis_id: Uuid,

    pub procurement_control_number: String,

    pub version_number: i64,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Messages processed at once
    pub max_concurrency: usize,

    /// Stop pulling after this many messages, then drain
    pub max_messages: Option<usize>,

    /// Exit once the topic has nothing to deliver and nothing is in flight
    pub until_idle: bool,

    /// Wait between empty pulls
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_messages: None,
            until_idle: false,
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    Succeeded,
    Failed,
    Skipped,
}

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn WorkQueue>,
    topic: String,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn WorkQueue>,
        topic: impl Into<String>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            topic: topic.into(),
            options,
        }
    }

    /// Consume until the message cap is hit or, with `until_idle`, the topic drains
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn run(&self) -> Result<BatchReport> {
        let concurrency = self.options.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<Handled> = JoinSet::new();
        let mut report = BatchReport::default();
        let mut pulled = 0usize;
        let mut pull_error = None;

        info!(concurrency, max_messages = ?self.options.max_messages, "Worker started");

        loop {
            let remaining = match self.options.max_messages {
                Some(max) if pulled >= max => {
                    info!(pulled, "Reached max messages, draining");
                    break;
                }
                Some(max) => max - pulled,
                None => usize::MAX,
            };

            let free = semaphore.available_permits();
            if free == 0 {
                if let Some(joined) = tasks.join_next().await {
                    record(&mut report, joined);
                }
                continue;
            }

            let messages = match self.queue.pull(&self.topic, free.min(remaining)).await {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %format!("{:#}", e), in_flight = tasks.len(), "Pull failed, draining");
                    pull_error = Some(e);
                    break;
                }
            };

            if messages.is_empty() {
                if let Some(joined) = tasks.join_next().await {
                    record(&mut report, joined);
                    continue;
                }
                if self.options.until_idle {
                    debug!("Topic idle");
                    break;
                }
                tokio::time::sleep(self.options.poll_interval).await;
                continue;
            }

            for message in messages {
                pulled += 1;
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .context("Worker semaphore closed")?;
                let orchestrator = Arc::clone(&self.orchestrator);
                let queue = Arc::clone(&self.queue);
                let topic = self.topic.clone();
                tasks.spawn(async move {
                    let handled = handle(&orchestrator, queue.as_ref(), &topic, message).await;
                    drop(permit);
                    handled
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record(&mut report, joined);
        }

        if let Some(e) = pull_error {
            warn!(%report, "Worker stopped after a pull failure");
            return Err(e).with_context(|| format!("Failed to pull from '{}'", self.topic));
        }

        info!(%report, "Worker finished");
        Ok(report)
    }
}

fn record(report: &mut BatchReport, joined: std::result::Result<Handled, tokio::task::JoinError>) {
    match joined {
        Ok(Handled::Succeeded) => report.succeeded += 1,
        Ok(Handled::Skipped) => report.skipped += 1,
        Ok(Handled::Failed) => report.failed += 1,
        Err(e) => {
            error!(error = %e, "Worker task panicked");
            report.failed += 1;
        }
    }
}

async fn handle(orchestrator: &Orchestrator, queue: &dyn WorkQueue, topic: &str, message: QueueMessage) -> Handled {
    let request: AnalysisRequest = match serde_json::from_value(message.payload.clone()) {
        Ok(request) => request,
        Err(e) => {
            // redelivery cannot fix a malformed payload
            error!(message_id = %message.id, error = %e, "Dropping malformed analysis request");
            settle(queue, topic, &message.id, true).await;
            return Handled::Failed;
        }
    };

    debug!(
        message_id = %message.id,
        analysis_id = %request.analysis_id,
        control_number = %request.procurement_control_number,
        version = request.version_number,
        attempt = message.delivery_attempt,
        "Processing analysis request"
    );

    match orchestrator.process_analysis(request.analysis_id).await {
        Ok(outcome) => {
            settle(queue, topic, &message.id, true).await;
            match outcome {
                ProcessOutcome::Succeeded { .. } => Handled::Succeeded,
                ProcessOutcome::Failed(_) => Handled::Failed,
                ProcessOutcome::Skipped(reason) => {
                    debug!(analysis_id = %request.analysis_id, %reason, "Nothing to do");
                    Handled::Skipped
                }
            }
        }
        Err(e) => {
            error!(analysis_id = %request.analysis_id, error = %format!("{:#}", e), "Analysis request failed, returning it to the queue");
            settle(queue, topic, &message.id, false).await;
            Handled::Failed
        }
    }
}

async fn settle(queue: &dyn WorkQueue, topic: &str, message_id: &str, ack: bool) {
    let settled = if ack {
        queue.ack(topic, message_id).await
    } else {
        queue.nack(topic, message_id).await
    };
    if let Err(e) = settled {
        warn!(%message_id, ack, error = %format!("{:#}", e), "Failed to settle message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryBlobStore, MemoryWorkQueue, ScriptedCompletionEngine, StaticRegistry, StubConverter};
    use crate::config::Settings;
    use crate::core::orchestrator::Collaborators;
    use crate::store::Store;
    use serde_json::json;

    fn worker(queue: Arc<MemoryWorkQueue>, options: WorkerOptions) -> Worker {
        let settings = Settings::with_home("/tmp/tenderwatch-worker-test");
        let topic = settings.worker.topic.clone();
        let orchestrator = Orchestrator::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Collaborators {
                registry: Arc::new(StaticRegistry::new()),
                engine: Arc::new(ScriptedCompletionEngine::new()),
                blobs: Arc::new(MemoryBlobStore::new()),
                queue: queue.clone(),
                converter: Arc::new(StubConverter::default()),
            },
            settings,
        );
        Worker::new(Arc::new(orchestrator), queue, topic, options)
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_requests_are_acked() {
        let queue = Arc::new(MemoryWorkQueue::new());
        queue.publish("analysis-requests", &json!({"bogus": 1})).await.unwrap();
        queue
            .publish(
                "analysis-requests",
                &json!({
                    "analysis_id": Uuid::new_v4().to_string(),
                    "procurement_control_number": "CN",
                    "version_number": 1
                }),
            )
            .await
            .unwrap();

        let report = worker(
            queue.clone(),
            WorkerOptions {
                until_idle: true,
                ..Default::default()
            },
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(queue.outstanding("analysis-requests").await, 0);
    }

    #[tokio::test]
    async fn test_max_messages_stops_pulling() {
        let queue = Arc::new(MemoryWorkQueue::new());
        for _ in 0..3 {
            queue.publish("analysis-requests", &json!({"bogus": 1})).await.unwrap();
        }

        let report = worker(
            queue.clone(),
            WorkerOptions {
                max_concurrency: 1,
                max_messages: Some(2),
                until_idle: true,
                ..Default::default()
            },
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(queue.outstanding("analysis-requests").await, 1);
    }

    #[tokio::test]
    async fn test_pull_failure_drains_in_flight_messages() {
        let queue = Arc::new(MemoryWorkQueue::new().failing_pulls_after(1));
        for _ in 0..2 {
            queue.publish("analysis-requests", &json!({"bogus": 1})).await.unwrap();
        }

        let result = worker(
            queue.clone(),
            WorkerOptions {
                max_concurrency: 4,
                until_idle: true,
                ..Default::default()
            },
        )
        .run()
        .await;

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Queue connection lost"));
        // both messages from the first pull finished and were acked
        assert_eq!(queue.outstanding("analysis-requests").await, 0);
    }
}
