//! Analysis state machine.
//!
//! Drives each procurement through
//! `PENDING_TOKEN_CALCULATION -> PENDING_ANALYSIS -> ANALYSIS_IN_PROGRESS
//! -> {ANALYSIS_SUCCESSFUL, ANALYSIS_FAILED}` and hosts the batch drivers
//! built on top of it (pre-analysis, ranked run, retry pass).
//!
//! Every status change is a compare-and-set write in the store; a caller
//! that loses a race sees `false` and backs off instead of overwriting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

use crate::adapters::{BlobStore, CompletionEngine, Download, FormatConverter, Registry, WorkQueue};
use crate::config::{BatchSettings, Settings};
use crate::domain::{
    order_documents, AnalysisRecord, AnalysisStatus, BudgetLedgerEntry, CostBreakdown, FileCandidate,
    Procurement, ProcurementVersion, RawDocumentMeta, SourceDocument, StatusHistoryEntry, TokenUsage,
};
use crate::store::{FileRecord, Store};

use super::error::PipelineError;
use super::extractor::Extractor;
use super::hasher::{document_hash, procurement_content_hash};
use super::normalizer::{content_type_for, Normalizer};
use super::prompt::build_prompt;
use super::retry::{RetryAction, RetryPolicy};
use super::scheduler::{allocate, auto_budget, BudgetPeriod, BudgetPlan, RankedCandidate};
use super::selector::{infer_modality, modality_of_paths, prioritize, select};

const ORIGINALS_BUCKET: &str = "originals";
const NORMALIZED_BUCKET: &str = "normalized";

/// External systems the orchestrator drives
pub struct Collaborators {
    pub registry: Arc<dyn Registry>,
    pub engine: Arc<dyn CompletionEngine>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub converter: Arc<dyn FormatConverter>,
}

/// Result of preparing one registry update
#[derive(Debug, Clone, PartialEq)]
pub enum PrepareOutcome {
    /// A new version was stored and its analysis awaits the scheduler
    Prepared {
        analysis_id: Uuid,
        control_number: String,
        version_number: i64,
        estimated_cost: f64,
    },

    /// Nothing changed since an earlier version
    Skipped { control_number: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Triggered { message_id: String },
    Skipped(String),
}

/// Result of running one in-progress analysis
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Succeeded { reused: bool, cost: f64 },
    Failed(String),
    Skipped(String),
}

/// Item counts of a batch command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "succeeded: {}, failed: {}, skipped: {}",
            self.succeeded, self.failed, self.skipped
        )
    }
}

/// Where a ranked run's budget comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetSource {
    Fixed(f64),

    /// Paced from the ledger over a period
    Auto(BudgetPeriod),
}

/// Outcome of a ranked run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RankedRun {
    pub budget: f64,

    /// Estimated cost of the triggered analyses
    pub spent: f64,

    pub counts: BatchReport,
}

/// A procurement's latest version, its analysis chain and the newest record's history
#[derive(Debug, Clone, Serialize)]
pub struct OverallStatus {
    pub version: ProcurementVersion,
    pub analyses: Vec<AnalysisRecord>,
    pub history: Vec<StatusHistoryEntry>,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    store: Arc<Store>,
    registry: Arc<dyn Registry>,
    engine: Arc<dyn CompletionEngine>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn WorkQueue>,
    normalizer: Normalizer,
    extractor: Extractor,
    settings: Settings,
}

/// Blob key `{analysis_id}/{synthetic_id}/{path}` with no `.`/`..` segments
fn blob_key(analysis_id: Uuid, synthetic_id: &str, path: &str) -> String {
    let safe = |segment: &str| match segment {
        "." | ".." => "_".to_string(),
        other => other.replace('\\', "_"),
    };
    let mut segments = vec![analysis_id.to_string(), safe(synthetic_id)];
    segments.extend(path.split('/').filter(|s| !s.is_empty()).map(safe));
    segments.join("/")
}

/// Key joining a candidate to its stored file record
fn record_key(synthetic_id: &str, original_path: &str) -> (String, String) {
    (synthetic_id.to_string(), original_path.to_string())
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, collaborators: Collaborators, settings: Settings) -> Self {
        let extractor =
            Extractor::new(settings.extraction.clone()).with_rar_binary(settings.converter.unrar_binary.clone());
        Self {
            store,
            registry: collaborators.registry,
            engine: collaborators.engine,
            blobs: collaborators.blobs,
            queue: collaborators.queue,
            normalizer: Normalizer::new(collaborators.converter),
            extractor,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Prepare
    // ------------------------------------------------------------------

    /// Turn one raw registry payload into a PENDING_ANALYSIS record.
    ///
    /// Fails before writing anything if the payload is malformed or the
    /// document listing fails. Once the record exists, later failures
    /// leave it in PENDING_TOKEN_CALCULATION for the retry pass.
    #[instrument(skip(self, raw), fields(control_number = tracing::field::Empty))]
    pub async fn prepare(&self, raw: Value) -> Result<PrepareOutcome> {
        let procurement = Procurement::from_raw(raw)
            .map_err(|e| PipelineError::Validation(format!("procurement payload: {}", e)))?;
        let control_number = procurement.control_number.clone();
        Span::current().record("control_number", control_number.as_str());

        let raw_documents = self
            .registry
            .list_documents(&procurement)
            .await
            .map_err(PipelineError::transient)
            .with_context(|| format!("Failed to list documents of {}", control_number))?;

        let mut metas = Vec::with_capacity(raw_documents.len());
        for raw_doc in raw_documents {
            match RawDocumentMeta::from_raw(raw_doc) {
                Ok(meta) => metas.push(meta),
                Err(e) => warn!(error = %e, "Skipping malformed document metadata"),
            }
        }
        let metas = order_documents(metas);

        let sources: Vec<(String, Option<String>)> =
            metas.iter().map(|m| (m.synthetic_id(), m.url.clone())).collect();
        let candidates = self.fetch_files(&sources).await;

        let document_raws: Vec<Value> = metas.iter().map(|m| m.raw.clone()).collect();
        let files: Vec<(String, Vec<u8>)> = candidates
            .iter()
            .map(|c| {
                (
                    format!("{}/{}", c.source_document_id, c.original_path),
                    c.original_content.clone(),
                )
            })
            .collect();
        let content_hash = procurement_content_hash(&procurement.raw, &document_raws, &files);

        if let Some(existing) = self.store.find_version_by_hash(&content_hash)? {
            debug!(version = existing.version_number, "Content unchanged");
            return Ok(PrepareOutcome::Skipped {
                control_number,
                reason: format!("unchanged since version {}", existing.version_number),
            });
        }
        let Some(version) = self.store.insert_version(&procurement, &content_hash)? else {
            return Ok(PrepareOutcome::Skipped {
                control_number,
                reason: "version stored concurrently".to_string(),
            });
        };

        let record = AnalysisRecord::new(&control_number, version.version_number);
        self.store.insert_analysis(
            &record,
            Some(format!("Version {} prepared", version.version_number)),
        )?;

        let documents: Vec<SourceDocument> = metas
            .iter()
            .map(|m| SourceDocument {
                id: Uuid::new_v4(),
                analysis_id: record.id,
                synthetic_id: m.synthetic_id(),
                title: m.title.clone(),
                document_type_name: m.document_type_name.clone(),
                publication_date: m.publication_date.clone(),
                url: m.url.clone(),
                raw_metadata: m.raw.clone(),
            })
            .collect();

        match self
            .store_documents_and_stage(&record, &procurement, &documents, candidates)
            .await
        {
            Ok(estimated_cost) => {
                info!(
                    analysis_id = %record.id,
                    version = version.version_number,
                    estimated_cost,
                    "Analysis prepared"
                );
                Ok(PrepareOutcome::Prepared {
                    analysis_id: record.id,
                    control_number,
                    version_number: version.version_number,
                    estimated_cost,
                })
            }
            Err(e) => {
                self.note_stop(record.id, &e);
                Err(e)
            }
        }
    }

    async fn store_documents_and_stage(
        &self,
        record: &AnalysisRecord,
        procurement: &Procurement,
        documents: &[SourceDocument],
        candidates: Vec<FileCandidate>,
    ) -> Result<f64> {
        for doc in documents {
            self.store.insert_source_document(doc)?;
        }
        self.stage_and_estimate(record, procurement, documents, candidates)
            .await
    }

    /// Download and extract every document that has a URL
    async fn fetch_files(&self, sources: &[(String, Option<String>)]) -> Vec<FileCandidate> {
        let mut candidates = Vec::new();
        for (synthetic_id, url) in sources {
            let Some(url) = url else {
                debug!(document = %synthetic_id, "Document has no URL");
                continue;
            };
            let download = match self.registry.download(url).await {
                Ok(download) => download,
                Err(e) => {
                    warn!(document = %synthetic_id, error = %format!("{:#}", e), "Skipping document that failed to download");
                    continue;
                }
            };

            // archive tools block; keep them off the async workers
            let extractor = self.extractor.clone();
            let Download { file_name, content } = download;
            let extracted = match tokio::task::spawn_blocking(move || extractor.extract(&file_name, content)).await {
                Ok(files) => files,
                Err(e) => {
                    error!(document = %synthetic_id, error = %e, "Extraction task failed, skipping document");
                    continue;
                }
            };

            for file in extracted {
                let mut candidate = FileCandidate::new(synthetic_id, file.path, file.content, file.nesting_level);
                candidate.extraction_failed = file.extraction_failed;
                candidates.push(candidate);
            }
        }
        candidates
    }

    /// Normalize, upload and checkpoint the files, then estimate
    async fn stage_and_estimate(
        &self,
        record: &AnalysisRecord,
        procurement: &Procurement,
        documents: &[SourceDocument],
        candidates: Vec<FileCandidate>,
    ) -> Result<f64> {
        let mut candidates = self.normalizer.normalize(candidates).await;
        let by_synthetic: HashMap<String, SourceDocument> = documents
            .iter()
            .map(|d| (d.synthetic_id.clone(), d.clone()))
            .collect();
        prioritize(&mut candidates, &by_synthetic);

        let mut records = HashMap::new();
        for candidate in candidates.iter_mut() {
            let original_uri = self.upload(record.id, candidate).await?;
            let Some(doc) = by_synthetic.get(&candidate.source_document_id) else {
                continue;
            };
            let file = FileRecord::from_candidate(record.id, doc.id, candidate, Some(original_uri));
            records.insert(record_key(&candidate.source_document_id, &candidate.original_path), file);
        }
        let checkpoint: Vec<FileRecord> = records.values().cloned().collect();
        self.store.save_file_records(&checkpoint)?;

        self.finish_estimation(record, procurement, documents, candidates, records)
            .await
    }

    /// Upload the original bytes and every normalized part, filling `ai_uris`
    async fn upload(&self, analysis_id: Uuid, candidate: &mut FileCandidate) -> Result<String> {
        let original_uri = self
            .blobs
            .put(
                ORIGINALS_BUCKET,
                &blob_key(analysis_id, &candidate.source_document_id, &candidate.original_path),
                &candidate.original_content,
                content_type_for(&candidate.original_extension()),
            )
            .await
            .map_err(PipelineError::transient)
            .with_context(|| format!("Failed to upload '{}'", candidate.original_path))?;

        let mut uris = Vec::with_capacity(candidate.parts.len());
        for part in &candidate.parts {
            let uri = self
                .blobs
                .put(
                    NORMALIZED_BUCKET,
                    &blob_key(analysis_id, &candidate.source_document_id, &part.path),
                    &part.content,
                    &part.content_type,
                )
                .await
                .map_err(PipelineError::transient)
                .with_context(|| format!("Failed to upload '{}'", part.path))?;
            uris.push(uri);
        }
        candidate.ai_uris = uris;
        Ok(original_uri)
    }

    /// Selection, hashing, prompt, cost and scores; ends in PENDING_ANALYSIS
    async fn finish_estimation(
        &self,
        record: &AnalysisRecord,
        procurement: &Procurement,
        documents: &[SourceDocument],
        candidates: Vec<FileCandidate>,
        mut existing: HashMap<(String, String), FileRecord>,
    ) -> Result<f64> {
        let base_prompt = build_prompt(procurement, documents, &[], &[]);
        let selection = select(
            candidates,
            &base_prompt,
            self.settings.completion.max_input_tokens,
            self.engine.as_ref(),
        )
        .await
        .map_err(PipelineError::transient)?;

        let doc_hash = document_hash(&selection.candidates);
        let prompt = build_prompt(procurement, documents, &selection.candidates, &selection.warnings);
        let modality = infer_modality(&selection.candidates);
        let tokens = TokenUsage {
            input_tokens: selection.input_tokens,
            ..Default::default()
        };
        let costs = self.settings.pricing.estimate(&tokens, modality, 0);

        let doc_ids: HashMap<&str, Uuid> = documents
            .iter()
            .map(|d| (d.synthetic_id.as_str(), d.id))
            .collect();
        let mut files = Vec::with_capacity(selection.candidates.len());
        for candidate in &selection.candidates {
            let Some(&doc_id) = doc_ids.get(candidate.source_document_id.as_str()) else {
                continue;
            };
            let previous = existing.remove(&record_key(&candidate.source_document_id, &candidate.original_path));
            let mut file = FileRecord::from_candidate(record.id, doc_id, candidate, None);
            if let Some(previous) = previous {
                file.id = previous.id;
                file.original_uri = previous.original_uri;
            }
            files.push(file);
        }
        self.store.save_file_records(&files)?;

        let votes = self
            .store
            .get_version(&record.control_number, record.version_number)?
            .map(|v| v.votes_count)
            .unwrap_or(0);
        let scores = self
            .settings
            .ranking
            .score(procurement, &selection.candidates, votes, costs.total_cost, Utc::now());
        self.store
            .update_scores(&record.control_number, record.version_number, &scores)?;

        let moved = self.store.finish_preparation(
            record.id,
            &doc_hash,
            tokens,
            costs,
            &prompt,
            &selection.warnings,
        )?;
        if !moved {
            let found = self
                .store
                .get_analysis(record.id)?
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(PipelineError::TransitionRejected {
                analysis_id: record.id,
                expected: AnalysisStatus::PendingTokenCalculation,
                found,
            }
            .into());
        }

        debug!(
            analysis_id = %record.id,
            included = selection.included().count(),
            input_tokens = selection.input_tokens,
            priority = scores.priority_score,
            "Estimation finished"
        );
        Ok(costs.total_cost)
    }

    /// Record why preparation stopped on a record still awaiting estimation
    fn note_stop(&self, analysis_id: Uuid, cause: &anyhow::Error) {
        let entry = StatusHistoryEntry::new(
            analysis_id,
            AnalysisStatus::PendingTokenCalculation,
            Some(format!("Preparation stopped: {:#}", cause)),
        );
        if let Err(e) = self.store.note(&entry) {
            warn!(%analysis_id, error = %format!("{:#}", e), "Failed to record preparation failure");
        }
    }

    /// Finish a record stuck in PENDING_TOKEN_CALCULATION without re-extracting.
    ///
    /// Returns `false` when another retry pass claimed it first.
    async fn resume_in_place(&self, record: &AnalysisRecord) -> Result<bool> {
        if !self.store.claim_for_resume(record.id, record.updated_at)? {
            return Ok(false);
        }
        info!(analysis_id = %record.id, "Resuming token calculation");

        match self.resume_estimation(record).await {
            Ok(_) => Ok(true),
            Err(e) => {
                self.note_stop(record.id, &e);
                Err(e)
            }
        }
    }

    /// Rebuild candidates from the stored records and finish estimation
    async fn resume_estimation(&self, record: &AnalysisRecord) -> Result<f64> {
        let version = self
            .store
            .get_version(&record.control_number, record.version_number)?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "procurement version",
                id: format!("{} v{}", record.control_number, record.version_number),
            })?;
        let documents = self.store.source_documents(record.id)?;
        let stored = self.store.file_records(record.id)?;

        if stored.is_empty() && documents.iter().any(|d| d.url.is_some()) {
            // stopped before the upload checkpoint
            let sources: Vec<(String, Option<String>)> = documents
                .iter()
                .map(|d| (d.synthetic_id.clone(), d.url.clone()))
                .collect();
            let candidates = self.fetch_files(&sources).await;
            return self
                .stage_and_estimate(record, &version.procurement, &documents, candidates)
                .await;
        }

        let synthetic: HashMap<Uuid, &str> = documents
            .iter()
            .map(|d| (d.id, d.synthetic_id.as_str()))
            .collect();
        let mut candidates = Vec::with_capacity(stored.len());
        let mut existing = HashMap::new();
        for file in stored {
            let Some(&synthetic_id) = synthetic.get(&file.source_document_id) else {
                continue;
            };
            let mut contents = Vec::with_capacity(file.ai_parts.len());
            for part in &file.ai_parts {
                let bytes = self
                    .blobs
                    .get(&part.uri)
                    .await
                    .map_err(PipelineError::transient)
                    .with_context(|| format!("Failed to fetch '{}'", part.uri))?;
                contents.push(bytes);
            }
            candidates.push(file.to_candidate(synthetic_id, contents));
            existing.insert(record_key(synthetic_id, &file.original_path), file);
        }

        self.finish_estimation(record, &version.procurement, &documents, candidates, existing)
            .await
    }

    // ------------------------------------------------------------------
    // Trigger / Complete
    // ------------------------------------------------------------------

    /// Move a PENDING_ANALYSIS record to ANALYSIS_IN_PROGRESS and enqueue it
    #[instrument(skip(self))]
    pub async fn trigger(&self, analysis_id: Uuid) -> Result<TriggerOutcome> {
        let record = self
            .store
            .get_analysis(analysis_id)?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "analysis",
                id: analysis_id.to_string(),
            })?;

        if record.status != AnalysisStatus::PendingAnalysis {
            warn!(status = %record.status, "Only pending analyses can be triggered");
            return Ok(TriggerOutcome::Skipped(format!("status is {}", record.status)));
        }

        let moved = self.store.transition(
            analysis_id,
            AnalysisStatus::PendingAnalysis,
            AnalysisStatus::AnalysisInProgress,
            Some("Triggered".to_string()),
        )?;
        if !moved {
            warn!("Trigger lost to a concurrent transition");
            return Ok(TriggerOutcome::Skipped(
                "status changed or another analysis of this version is in progress".to_string(),
            ));
        }

        let payload = json!({
            "analysis_id": analysis_id.to_string(),
            "procurement_control_number": record.control_number,
            "version_number": record.version_number,
        });
        match self.queue.publish(&self.settings.worker.topic, &payload).await {
            Ok(message_id) => {
                info!(%message_id, cost = record.costs.total_cost, "Analysis triggered");
                Ok(TriggerOutcome::Triggered { message_id })
            }
            Err(e) => {
                let cause = format!("Failed to publish analysis request: {:#}", e);
                self.store.transition(
                    analysis_id,
                    AnalysisStatus::AnalysisInProgress,
                    AnalysisStatus::AnalysisFailed,
                    Some(cause.clone()),
                )?;
                Err(PipelineError::Transient(cause).into())
            }
        }
    }

    /// Run the AI analysis of an in-progress record.
    ///
    /// Failures of the analysis itself end in ANALYSIS_FAILED and come back
    /// as [`ProcessOutcome::Failed`]; `Err` means the store is unusable.
    #[instrument(skip(self))]
    pub async fn process_analysis(&self, analysis_id: Uuid) -> Result<ProcessOutcome> {
        let Some(record) = self.store.get_analysis(analysis_id)? else {
            warn!("Analysis not found");
            return Ok(ProcessOutcome::Skipped("analysis not found".to_string()));
        };
        if record.status != AnalysisStatus::AnalysisInProgress {
            debug!(status = %record.status, "Analysis is not in progress");
            return Ok(ProcessOutcome::Skipped(format!("status is {}", record.status)));
        }

        match self.run_analysis(&record).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Ok(ProcessOutcome::Skipped(
                "analysis left ANALYSIS_IN_PROGRESS concurrently".to_string(),
            )),
            Err(e) => {
                let cause = format!("{:#}", e);
                error!(error = %cause, "Analysis failed");
                self.store.transition(
                    analysis_id,
                    AnalysisStatus::AnalysisInProgress,
                    AnalysisStatus::AnalysisFailed,
                    Some(cause.clone()),
                )?;
                Ok(ProcessOutcome::Failed(cause))
            }
        }
    }

    /// `None` when the result could not be saved because the record moved on
    async fn run_analysis(&self, record: &AnalysisRecord) -> Result<Option<ProcessOutcome>> {
        if let Some(hash) = &record.document_hash {
            if let Some(previous) =
                self.store
                    .find_successful_by_document_hash(&record.control_number, hash, record.id)?
            {
                if let Some(result) = &previous.result {
                    let saved = self.store.save_result(
                        record.id,
                        result,
                        TokenUsage::default(),
                        CostBreakdown::default(),
                        None,
                        Some(format!("Reused result of analysis {}", previous.id)),
                    )?;
                    info!(reused_from = %previous.id, "Reused earlier result for identical documents");
                    return Ok(saved.then_some(ProcessOutcome::Succeeded { reused: true, cost: 0.0 }));
                }
            }
        }

        let prompt = record
            .prompt
            .as_deref()
            .ok_or_else(|| PipelineError::Validation("analysis has no prompt".to_string()))?;

        let mut included: Vec<FileRecord> = self
            .store
            .file_records(record.id)?
            .into_iter()
            .filter(|f| f.included)
            .collect();
        included.sort_by(|a, b| {
            a.priority
                .unwrap_or(i64::MAX)
                .cmp(&b.priority.unwrap_or(i64::MAX))
                .then_with(|| a.original_path.cmp(&b.original_path))
        });
        let uris: Vec<String> = included
            .iter()
            .flat_map(|f| f.ai_parts.iter().map(|p| p.uri.clone()))
            .collect();

        let output = self.engine.submit(prompt, &uris).await?;

        let tokens = TokenUsage {
            input_tokens: output.input_tokens,
            output_tokens: output.output_tokens,
            thinking_tokens: output.thinking_tokens,
        };
        let modality = modality_of_paths(included.iter().map(|f| f.ai_path.as_str()));
        let costs = self
            .settings
            .pricing
            .estimate(&tokens, modality, output.search_queries.len() as u64);
        let expense = BudgetLedgerEntry::expense(
            record.id,
            costs.total_cost,
            format!("Analysis of {} v{}", record.control_number, record.version_number),
        );

        let saved = self.store.save_result(
            record.id,
            &output.result,
            tokens,
            costs,
            Some(&expense),
            Some(format!("Cost {:.4}", costs.total_cost)),
        )?;
        if saved {
            info!(cost = costs.total_cost, files = included.len(), "Analysis completed");
        }
        Ok(saved.then_some(ProcessOutcome::Succeeded {
            reused: false,
            cost: costs.total_cost,
        }))
    }

    // ------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------

    /// Retry failed and stuck records according to `policy`
    #[instrument(skip(self, policy), fields(max_retries = policy.max_retries))]
    pub async fn retry_analyses(&self, policy: &RetryPolicy) -> Result<BatchReport> {
        let now = Utc::now();
        let candidates = self
            .store
            .retry_candidates(policy.max_retries, policy.stale_before(now))?;
        info!(candidates = candidates.len(), "Starting retry pass");

        let mut report = BatchReport::default();
        for record in candidates {
            let Some(action) = policy.plan(&record, now) else {
                debug!(analysis_id = %record.id, "Not yet eligible for retry");
                report.skipped += 1;
                continue;
            };

            match self.retry_one(&record, action, policy, now).await {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(analysis_id = %record.id, ?action, error = %format!("{:#}", e), "Retry failed");
                    report.failed += 1;
                }
            }
        }

        info!(%report, "Retry pass finished");
        Ok(report)
    }

    async fn retry_one(
        &self,
        record: &AnalysisRecord,
        action: RetryAction,
        policy: &RetryPolicy,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        match action {
            RetryAction::ResumeInPlace => self.resume_in_place(record).await,
            RetryAction::Successor => self.start_successor(record).await,
            RetryAction::FailStaleThenSuccessor => {
                let failed = self.store.fail_stale(
                    record.id,
                    policy.stale_before(now),
                    format!("No progress within {} hours", policy.timeout_hours),
                )?;
                if !failed {
                    return Ok(false);
                }
                let Some(reloaded) = self.store.get_analysis(record.id)? else {
                    return Ok(false);
                };
                self.start_successor(&reloaded).await
            }
        }
    }

    /// Supersede a failed record and trigger the new attempt
    async fn start_successor(&self, failed: &AnalysisRecord) -> Result<bool> {
        let successor = failed.successor();
        if !self.store.create_successor(failed.id, &successor)? {
            return Ok(false);
        }
        info!(
            previous = %failed.id,
            analysis_id = %successor.id,
            retry_count = successor.retry_count,
            "Created retry attempt"
        );
        Ok(matches!(
            self.trigger(successor.id).await?,
            TriggerOutcome::Triggered { .. }
        ))
    }

    // ------------------------------------------------------------------
    // Batch drivers
    // ------------------------------------------------------------------

    /// Prepare every registry update between `start` and `end` inclusive
    #[instrument(skip(self, batch))]
    pub async fn run_pre_analysis(&self, start: NaiveDate, end: NaiveDate, batch: &BatchSettings) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut processed = 0usize;
        let mut date = start;

        'dates: while date <= end {
            let updates = match self.registry.list_updated(date).await {
                Ok(updates) => updates,
                Err(e) => {
                    error!(%date, error = %format!("{:#}", e), "Failed to list registry updates");
                    report.failed += 1;
                    match date.succ_opt() {
                        Some(next) => date = next,
                        None => break,
                    }
                    continue;
                }
            };
            info!(%date, updates = updates.len(), "Preparing registry updates");

            for raw in updates {
                if batch.max_messages.is_some_and(|max| processed >= max) {
                    info!(processed, "Reached max messages");
                    break 'dates;
                }

                match self.prepare(raw).await {
                    Ok(PrepareOutcome::Prepared { .. }) => report.succeeded += 1,
                    Ok(PrepareOutcome::Skipped { control_number, reason }) => {
                        debug!(%control_number, %reason, "Skipped");
                        report.skipped += 1;
                    }
                    Err(e) => match e.downcast_ref::<PipelineError>() {
                        Some(PipelineError::Validation(reason)) => {
                            warn!(%reason, "Skipping malformed procurement");
                            report.skipped += 1;
                        }
                        _ => {
                            error!(error = %format!("{:#}", e), "Failed to prepare procurement");
                            report.failed += 1;
                        }
                    },
                }
                processed += 1;

                if batch.batch_size > 0 && processed % batch.batch_size == 0 && batch.sleep_seconds > 0 {
                    info!(processed, sleep_seconds = batch.sleep_seconds, "Batch done, sleeping");
                    tokio::time::sleep(Duration::from_secs(batch.sleep_seconds)).await;
                }
            }

            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }

        info!(%report, "Pre-analysis finished");
        Ok(report)
    }

    /// Budget a ranked run may spend
    pub fn resolve_budget(&self, source: BudgetSource) -> Result<f64> {
        match source {
            BudgetSource::Fixed(amount) => Ok(amount.max(0.0)),
            BudgetSource::Auto(period) => {
                let today = Utc::now().date_naive();
                let period_start = period
                    .start(today)
                    .and_hms_opt(0, 0, 0)
                    .context("Invalid budget period start")?;
                let donations = self.store.total_donations()?;
                let expenses = self
                    .store
                    .total_expenses_since(Utc.from_utc_datetime(&period_start))?;
                let budget = auto_budget(period, today, donations, expenses);
                info!(?period, donations, expenses, budget, "Computed automatic budget");
                Ok(budget)
            }
        }
    }

    /// Trigger the highest-ranked stable pending analyses within the budget
    #[instrument(skip(self), fields(budget = tracing::field::Empty))]
    pub async fn run_ranked_analysis(
        &self,
        source: BudgetSource,
        zero_vote_percent: f64,
        max_messages: Option<usize>,
    ) -> Result<RankedRun> {
        let budget = self.resolve_budget(source)?;
        Span::current().record("budget", budget);

        let now = Utc::now();
        let mut counts = BatchReport::default();
        let mut eligible = Vec::new();
        for pending in self.store.pending_for_ranking()? {
            if !self.settings.ranking.is_stable_since(pending.last_update_date, now) {
                debug!(analysis_id = %pending.analysis_id, "Procurement still changing, waiting");
                counts.skipped += 1;
                continue;
            }
            eligible.push(RankedCandidate {
                analysis_id: pending.analysis_id,
                control_number: pending.control_number,
                version_number: pending.version_number,
                region: pending.region,
                priority: pending.priority_score,
                votes: pending.votes,
                estimated_cost: pending.estimated_cost,
            });
        }

        let plan = BudgetPlan {
            budget,
            zero_vote_percent,
            max_messages,
        };

        // Only triggered candidates consume budget; when one is not
        // triggered, what is left is allocated again over the rest.
        let mut triggered: Vec<RankedCandidate> = Vec::new();
        'rounds: loop {
            let allocation = allocate(eligible.clone(), &plan.remaining_after(&triggered));
            if allocation.chosen.is_empty() {
                break;
            }
            for chosen in allocation.chosen {
                eligible.retain(|c| c.analysis_id != chosen.analysis_id);
                match self.trigger(chosen.analysis_id).await {
                    Ok(TriggerOutcome::Triggered { .. }) => {
                        counts.succeeded += 1;
                        triggered.push(chosen);
                    }
                    Ok(TriggerOutcome::Skipped(reason)) => {
                        debug!(analysis_id = %chosen.analysis_id, %reason, "Not triggered, reallocating");
                        counts.skipped += 1;
                        continue 'rounds;
                    }
                    Err(e) => {
                        error!(analysis_id = %chosen.analysis_id, error = %format!("{:#}", e), "Failed to trigger");
                        counts.failed += 1;
                        continue 'rounds;
                    }
                }
            }
            break;
        }
        counts.skipped += eligible.len();

        let spent: f64 = triggered.iter().map(|c| c.estimated_cost).sum();
        info!(%counts, spent, "Ranked run finished");
        Ok(RankedRun { budget, spent, counts })
    }

    // ------------------------------------------------------------------
    // Ledger and status
    // ------------------------------------------------------------------

    /// Record a donation
    pub fn donate(&self, amount: f64, description: impl Into<String>) -> Result<BudgetLedgerEntry> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(PipelineError::Validation(format!("donation must be positive, got {}", amount)).into());
        }
        let entry = BudgetLedgerEntry::donation(amount, description);
        self.store.insert_ledger(&entry)?;
        info!(amount, "Donation recorded");
        Ok(entry)
    }

    /// Latest version, analysis chain and newest history of a procurement
    pub fn overall_status(&self, control_number: &str) -> Result<Option<OverallStatus>> {
        let Some(version) = self.store.latest_version(control_number)? else {
            return Ok(None);
        };
        let analyses = self.store.analyses_for(control_number)?;
        let history = match analyses.last() {
            Some(newest) => self.store.history(newest.id)?,
            None => Vec::new(),
        };
        Ok(Some(OverallStatus {
            version,
            analyses,
            history,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryBlobStore, MemoryWorkQueue, ScriptedCompletionEngine, StaticRegistry, StubConverter};

    fn orchestrator(registry: StaticRegistry) -> Orchestrator {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let collaborators = Collaborators {
            registry: Arc::new(registry),
            engine: Arc::new(ScriptedCompletionEngine::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            queue: Arc::new(MemoryWorkQueue::new()),
            converter: Arc::new(StubConverter::default()),
        };
        Orchestrator::new(store, collaborators, Settings::with_home("/tmp/tenderwatch-test"))
    }

    #[test]
    fn test_blob_key_flattens_traversal() {
        let id = Uuid::nil();
        assert_eq!(
            blob_key(id, "1-2024-3-1", "anexos.zip/../edital.pdf"),
            format!("{}/1-2024-3-1/anexos.zip/_/edital.pdf", id)
        );
        assert_eq!(blob_key(id, "d", "a\\b.txt"), format!("{}/d/a_b.txt", id));
    }

    #[test]
    fn test_batch_report_display() {
        let report = BatchReport {
            succeeded: 3,
            failed: 1,
            skipped: 2,
        };
        assert_eq!(report.to_string(), "succeeded: 3, failed: 1, skipped: 2");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_validation_error() {
        let orch = orchestrator(StaticRegistry::new());
        let err = orch.prepare(json!({"unexpected": true})).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_donation_must_be_positive() {
        let orch = orchestrator(StaticRegistry::new());
        assert!(orch.donate(0.0, "zero").is_err());
        assert!(orch.donate(f64::NAN, "nan").is_err());
        orch.donate(25.0, "gift").unwrap();
        assert_eq!(orch.store().total_donations().unwrap(), 25.0);
    }

    #[tokio::test]
    async fn test_trigger_unknown_analysis() {
        let orch = orchestrator(StaticRegistry::new());
        let err = orch.trigger(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_of_unknown_procurement() {
        let orch = orchestrator(StaticRegistry::new());
        assert!(orch.overall_status("nothing").unwrap().is_none());
    }
}
