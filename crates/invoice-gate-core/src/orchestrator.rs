// crates/invoice-gate-core/src/orchestrator.rs
// ============================================================================
// Module: Invoice Gate Orchestrator
// Description: The six-stage PREPROCESS -> OCR -> EXTRACT -> VALIDATE ->
//              PERSIST -> EXPORT run pipeline, with per-stage retry/timeout
//              and cooperative cancellation.
// Purpose: Drive a single Run from QUEUED to a terminal status, generic over
//          the Repository/BlobStore/AuditSink/OcrProvider/ExtractionProvider
//          trait surfaces so it never hard-links to a concrete backend.
// Dependencies: serde_json, tracing, crate::entities, crate::errors,
//               crate::hashing, crate::interfaces, crate::review,
//               crate::validation
// ============================================================================

//! ## Overview
//! [`Orchestrator::process_run`] is the single routine a background task, an
//! HTTP handler's fire-and-forget dispatch, or the polling worker all call —
//! there is no behavioural difference between drivers. It loads the run and
//! its document, walks the six fixed stages in order, and leaves the run in
//! exactly one terminal status: `SUCCESS`, `WARN`, `NEEDS_REVIEW`, `FAILED`,
//! or `CANCELLED`.
//!
//! Each stage attempt is dispatched onto a dedicated single-slot thread and
//! raced against `stage_timeout_seconds` via [`std::sync::mpsc::Receiver::recv_timeout`],
//! mirroring the original's `ThreadPoolExecutor(max_workers=1)` +
//! `future.result(timeout=...)` pattern. Only `OCR`, `EXTRACT`, `PERSIST`,
//! and `EXPORT` are retried on a retryable failure; `PREPROCESS` and
//! `VALIDATE` are single-attempt by design. Cancellation and the run-level
//! wall-clock budget are both checked at every stage boundary.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::entities::Document;
use crate::entities::IngestionStatus;
use crate::entities::Run;
use crate::entities::RunStatus;
use crate::entities::StageName;
use crate::entities::StageStatus;
use crate::errors::RUN_CANCELLED_ERROR_CODE;
use crate::errors::RUN_TIMEOUT_ERROR_CODE;
use crate::errors::TRANSIENT_ERROR_CODES;
use crate::errors::UNEXPECTED_RUNTIME_ERROR_CODE;
use crate::errors::StageError;
use crate::errors::stage_is_retryable;
use crate::errors::stage_timeout_code;
use crate::identifiers::RunId;
use crate::interfaces::AuditSink;
use crate::interfaces::BlobStore;
use crate::interfaces::ExtractionProvider;
use crate::interfaces::ExtractionResult;
use crate::interfaces::OcrProvider;
use crate::interfaces::OcrResult;
use crate::interfaces::Repository;
use crate::interfaces::starting_stage;
use crate::review::ReviewOutcome;
use crate::review::ReviewThresholds;
use crate::review::evaluate_review_decision;
use crate::review::status_from_decision;
use crate::validation::ValidationIssueRecord;
use crate::validation::validate_extraction_result;

/// Configuration the orchestrator needs but does not own. Built by the
/// caller (typically `invoice-gate-cli`) from `InvoiceGateConfig`, since
/// this crate does not depend on the config crate.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wall-clock deadline for a single stage attempt.
    pub stage_timeout: Duration,
    /// Wall-clock budget for an entire run, checked at stage boundaries.
    pub run_timeout: Duration,
    /// Maximum attempts for a retryable stage (including the first).
    pub max_stage_attempts: u32,
    /// Extraction confidence floor below which `LOW_EXTRACTION_CONFIDENCE` fires.
    pub low_extraction_confidence_threshold: f64,
    /// OCR confidence floor below which `LOW_OCR_CONFIDENCE` fires.
    pub low_ocr_confidence_threshold: f64,
    /// Currency codes the review policy's Gate 4 accepts.
    pub allowed_currencies: Vec<String>,
    /// Review policy gate thresholds.
    pub review_thresholds: ReviewThresholds,
    /// Static version/route metadata folded into the decision log's
    /// `versions` block, e.g. `prompt_version`, `model_version`.
    pub version_snapshot: BTreeMap<String, Value>,
}

/// Drives a single [`Run`] through the six-stage pipeline.
pub struct Orchestrator<'a> {
    repository: &'a dyn Repository,
    blob_store: &'a dyn BlobStore,
    audit_sink: &'a dyn AuditSink,
    ocr_provider: &'a dyn OcrProvider,
    extraction_provider: &'a dyn ExtractionProvider,
    config: OrchestratorConfig,
}

/// Outcome of one stage attempt, carried back across the dedicated
/// per-attempt thread.
enum StageOutcome {
    Preprocess {
        details: BTreeMap<String, Value>,
    },
    Ocr {
        result: OcrResult,
        details: BTreeMap<String, Value>,
    },
    Extract {
        result: ExtractionResult,
        details: BTreeMap<String, Value>,
    },
    Validate {
        issues: Vec<ValidationIssueRecord>,
        decision: ReviewOutcome,
        details: BTreeMap<String, Value>,
    },
    Persist {
        payload: Value,
        details: BTreeMap<String, Value>,
    },
    Export {
        details: BTreeMap<String, Value>,
    },
}

/// Accumulated state threaded through the six stages of one run.
#[derive(Default)]
struct RunContext {
    ocr: Option<OcrResult>,
    extraction: Option<ExtractionResult>,
    issues: Vec<ValidationIssueRecord>,
    quality_status: String,
    quality_reasons: Vec<String>,
    review_decision: String,
    decision_log: Option<BTreeMap<String, Value>>,
    quality_tier: Option<String>,
    quality_score: Option<f64>,
}

impl<'a> Orchestrator<'a> {
    /// Builds an orchestrator over the given backend implementations.
    #[must_use]
    pub fn new(
        repository: &'a dyn Repository,
        blob_store: &'a dyn BlobStore,
        audit_sink: &'a dyn AuditSink,
        ocr_provider: &'a dyn OcrProvider,
        extraction_provider: &'a dyn ExtractionProvider,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repository,
            blob_store,
            audit_sink,
            ocr_provider,
            extraction_provider,
            config,
        }
    }

    /// Runs `run_id` through the pipeline to a terminal status.
    ///
    /// This never panics on expected failure paths: every error becomes a
    /// `FAILED` or `CANCELLED` terminal status, recorded on the run and in
    /// the audit chain. A backend failure (e.g. the repository itself is
    /// unreachable when loading the run) is logged and swallowed, matching
    /// the original's top-level `except Exception` safety net — there is no
    /// caller to propagate a `Result` to once a background task has been
    /// dispatched.
    pub fn process_run(&self, run_id: &RunId, worker_id: &str) {
        let run_started = Instant::now();
        let Some(mut run) = self.load_run(run_id) else {
            return;
        };
        if run.status != RunStatus::Queued {
            return;
        }

        run.status = RunStatus::Running;
        run.route_name = Some("ocr_llm_pipeline".to_string());
        self.save_run(&mut run);

        let Some(document) = self.load_document(&run) else {
            self.fail_run(&mut run, "DOCUMENT_NOT_FOUND");
            return;
        };
        if document.ingestion_status != IngestionStatus::Accepted {
            self.fail_run(&mut run, "DOCUMENT_QUARANTINED");
            return;
        }

        let mut context = RunContext {
            quality_tier: document.quality_tier.clone(),
            quality_score: document.quality_score,
            quality_status: "SUCCESS".to_string(),
            review_decision: "AUTO_APPROVED".to_string(),
            ..RunContext::default()
        };

        for stage in StageName::pipeline_order() {
            match self.ensure_runnable(&mut run, stage, run_started) {
                Ok(()) => {}
                Err(err) => {
                    self.finish_with_error(&mut run, &err);
                    return;
                }
            }
            if let Err(err) =
                self.execute_stage_with_retry(&mut run, &document, stage, &mut context, worker_id, run_started)
            {
                self.finish_with_error(&mut run, &err);
                return;
            }
        }

        self.finish_success(&mut run, context);
    }

    fn load_run(&self, run_id: &RunId) -> Option<Run> {
        match self.repository.get_run(run_id, None) {
            Ok(run) => run,
            Err(err) => {
                warn!(error = %err, run_id = %run_id, "failed to load run");
                None
            }
        }
    }

    fn load_document(&self, run: &Run) -> Option<Document> {
        match self.repository.get_document(&run.document_id, None) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %err, document_id = %run.document_id, "failed to load document");
                None
            }
        }
    }

    fn save_run(&self, run: &mut Run) {
        run.updated_at = time::OffsetDateTime::now_utc();
        if let Err(err) = self.repository.update_run(run) {
            warn!(error = %err, run_id = %run.id, "failed to persist run update");
        }
    }

    fn ensure_runnable(&self, run: &mut Run, stage: StageName, run_started: Instant) -> Result<(), StageError> {
        if let Ok(Some(refreshed)) = self.repository.get_run(&run.id, None) {
            run.cancel_requested = refreshed.cancel_requested;
        }
        if run.cancel_requested {
            self.upsert_cancelled_stage(run, stage);
            return Err(StageError::fatal(
                RUN_CANCELLED_ERROR_CODE,
                format!("cancelled before {stage:?}"),
            ));
        }
        if run_started.elapsed() > self.config.run_timeout {
            return Err(StageError::fatal(
                RUN_TIMEOUT_ERROR_CODE,
                format!("elapsed={:.2}s", run_started.elapsed().as_secs_f64()),
            ));
        }
        Ok(())
    }

    fn upsert_cancelled_stage(&self, run: &Run, stage: StageName) {
        let mut stage_row = starting_stage(run.id.clone(), stage, 1);
        stage_row.status = StageStatus::Cancelled;
        stage_row.finished_at = Some(time::OffsetDateTime::now_utc());
        if let Err(err) = self.repository.upsert_stage(stage_row) {
            warn!(error = %err, run_id = %run.id, ?stage, "failed to record cancelled stage");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_stage_with_retry(
        &self,
        run: &mut Run,
        document: &Document,
        stage: StageName,
        context: &mut RunContext,
        worker_id: &str,
        run_started: Instant,
    ) -> Result<(), StageError> {
        let max_attempts = if stage_is_retryable(stage) {
            self.config.max_stage_attempts.max(1)
        } else {
            1
        };

        for attempt in 1..=max_attempts {
            self.ensure_runnable(run, stage, run_started)?;

            let started_at = time::OffsetDateTime::now_utc();
            let mut running_row = starting_stage(run.id.clone(), stage, attempt);
            running_row.started_at = Some(started_at);
            running_row
                .details
                .insert("worker_id".to_string(), Value::String(worker_id.to_string()));
            if let Err(err) = self.repository.upsert_stage(running_row) {
                warn!(error = %err, run_id = %run.id, ?stage, "failed to record running stage");
            }

            let attempt_start = Instant::now();
            let outcome = self.run_stage_with_timeout(stage, document, context, run.id.clone());

            match outcome {
                Ok(stage_outcome) => {
                    let duration_ms = attempt_start.elapsed().as_secs_f64() * 1000.0;
                    let mut details = BTreeMap::new();
                    details.insert("worker_id".to_string(), Value::String(worker_id.to_string()));
                    details.insert("duration_ms".to_string(), serde_json::json!(round2(duration_ms)));
                    apply_stage_outcome(context, stage_outcome, &mut details, &self.config.version_snapshot);

                    let mut finished_row = starting_stage(run.id.clone(), stage, attempt);
                    finished_row.status = StageStatus::Succeeded;
                    finished_row.started_at = Some(started_at);
                    finished_row.finished_at = Some(time::OffsetDateTime::now_utc());
                    finished_row.details = details;
                    if let Err(err) = self.repository.upsert_stage(finished_row) {
                        warn!(error = %err, run_id = %run.id, ?stage, "failed to record succeeded stage");
                    }
                    debug!(run_id = %run.id, ?stage, attempt, "stage succeeded");
                    return Ok(());
                }
                Err(stage_err) => {
                    let duration_ms = attempt_start.elapsed().as_secs_f64() * 1000.0;
                    let mut details = BTreeMap::new();
                    details.insert("worker_id".to_string(), Value::String(worker_id.to_string()));
                    details.insert("duration_ms".to_string(), serde_json::json!(round2(duration_ms)));
                    details.insert("detail".to_string(), Value::String(stage_err.detail.clone()));

                    let mut failed_row = starting_stage(run.id.clone(), stage, attempt);
                    failed_row.status = StageStatus::Failed;
                    failed_row.started_at = Some(started_at);
                    failed_row.finished_at = Some(time::OffsetDateTime::now_utc());
                    failed_row.error_code = Some(stage_err.code.clone());
                    failed_row.details = details;
                    if let Err(err) = self.repository.upsert_stage(failed_row) {
                        warn!(error = %err, run_id = %run.id, ?stage, "failed to record failed stage");
                    }

                    let should_retry = (stage_err.retryable || TRANSIENT_ERROR_CODES.contains(&stage_err.code.as_str()))
                        && attempt < max_attempts;
                    if should_retry {
                        info!(run_id = %run.id, ?stage, attempt, code = %stage_err.code, "retrying stage");
                        thread::sleep(Duration::from_secs_f64(0.2 * f64::from(attempt)));
                        continue;
                    }
                    return Err(stage_err);
                }
            }
        }
        unreachable!("loop always returns on its final iteration")
    }

    fn run_stage_with_timeout(
        &self,
        stage: StageName,
        document: &Document,
        context: &RunContext,
        run_id: RunId,
    ) -> Result<StageOutcome, StageError> {
        let timeout = self.config.stage_timeout.max(Duration::from_secs(1));
        let (tx, rx) = mpsc::channel::<Result<StageOutcome, StageError>>();
        thread::scope(|scope| {
            scope.spawn(|| {
                let outcome = self.execute_stage(stage, document, context, &run_id);
                let _ = tx.send(outcome);
            });
            match rx.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(_) => Err(StageError {
                    code: stage_timeout_code(stage).to_string(),
                    retryable: stage_is_retryable(stage),
                    detail: format!("stage timeout after {}s", timeout.as_secs()),
                }),
            }
        })
    }

    fn execute_stage(
        &self,
        stage: StageName,
        document: &Document,
        context: &RunContext,
        run_id: &RunId,
    ) -> Result<StageOutcome, StageError> {
        match stage {
            StageName::Preprocess => self.stage_preprocess(run_id, document),
            StageName::Ocr => self.stage_ocr(run_id, document),
            StageName::Extract => self.stage_extract(document, context),
            StageName::Validate => self.stage_validate(context),
            StageName::Persist => self.stage_persist(run_id, context),
            StageName::Export => self.stage_export(run_id, context),
        }
    }

    fn stage_preprocess(&self, run_id: &RunId, document: &Document) -> Result<StageOutcome, StageError> {
        let payload = format!(
            "preprocess_ok|filename={}|bytes={}",
            document.filename, document.size_bytes
        );
        self.blob_store
            .put(&format!("runs/{run_id}/artifacts/preprocess.txt"), payload.as_bytes())
            .map_err(|err| StageError::retryable("STORAGE_UNAVAILABLE", err.to_string()))?;
        let mut details = BTreeMap::new();
        details.insert("filename".to_string(), Value::String(document.filename.clone()));
        details.insert("size_bytes".to_string(), serde_json::json!(document.size_bytes));
        Ok(StageOutcome::Preprocess { details })
    }

    fn stage_ocr(&self, run_id: &RunId, document: &Document) -> Result<StageOutcome, StageError> {
        let bytes = self
            .blob_store
            .get(&document.storage_path)
            .map_err(|err| StageError::retryable("STORAGE_UNAVAILABLE", err.to_string()))?;
        let ocr = self
            .ocr_provider
            .run_ocr(&bytes, &document.content_type)
            .map_err(|err| StageError::retryable("OCR_ENGINE_UNAVAILABLE", err.to_string()))?;

        self.blob_store
            .put(&format!("runs/{run_id}/artifacts/ocr_text.txt"), ocr.text.as_bytes())
            .map_err(|err| StageError::retryable("STORAGE_UNAVAILABLE", err.to_string()))?;
        let meta = serde_json::to_vec(&ocr).unwrap_or_default();
        self.blob_store
            .put(&format!("runs/{run_id}/artifacts/ocr_meta.json"), &meta)
            .map_err(|err| StageError::retryable("STORAGE_UNAVAILABLE", err.to_string()))?;

        let mut details = BTreeMap::new();
        details.insert("language".to_string(), Value::String(ocr.language.clone()));
        details.insert("confidence".to_string(), serde_json::json!(round4(ocr.confidence)));
        Ok(StageOutcome::Ocr { result: ocr, details })
    }

    fn stage_extract(&self, document: &Document, context: &RunContext) -> Result<StageOutcome, StageError> {
        let Some(ocr) = &context.ocr else {
            return Err(StageError::fatal("OCR_EMPTY", "OCR stage did not produce text"));
        };
        let extraction = self
            .extraction_provider
            .run_extraction(&ocr.text, &document.language)
            .map_err(|err| StageError::retryable("MODEL_OOM", err.to_string()))?;
        let mut details = BTreeMap::new();
        details.insert("model_name".to_string(), Value::String(extraction.model_name.clone()));
        details.insert("route_name".to_string(), Value::String(extraction.route_name.clone()));
        details.insert("confidence".to_string(), serde_json::json!(round4(extraction.confidence)));
        Ok(StageOutcome::Extract {
            result: extraction,
            details,
        })
    }

    fn stage_validate(&self, context: &RunContext) -> Result<StageOutcome, StageError> {
        let (Some(ocr), Some(extraction)) = (&context.ocr, &context.extraction) else {
            return Err(StageError::fatal("VALIDATION_INPUT_MISSING", "missing ocr or extraction result"));
        };

        let issues = validate_extraction_result(
            &extraction.fields,
            extraction.confidence,
            ocr.confidence,
            self.config.low_extraction_confidence_threshold,
            self.config.low_ocr_confidence_threshold,
        );
        let gate_issues: Vec<_> = issues.iter().map(ValidationIssueRecord::as_gate_issue).collect();

        let decision = evaluate_review_decision(
            &extraction.fields,
            &gate_issues,
            extraction.confidence,
            ocr.confidence,
            context.quality_tier.as_deref(),
            context.quality_score,
            &self.config.review_thresholds,
            &self.config.allowed_currencies,
        );

        let mut details = BTreeMap::new();
        details.insert("issue_count".to_string(), serde_json::json!(issues.len()));
        details.insert(
            "review_decision".to_string(),
            serde_json::json!(decision.decision),
        );
        Ok(StageOutcome::Validate {
            issues,
            decision,
            details,
        })
    }

    fn stage_persist(&self, run_id: &RunId, context: &RunContext) -> Result<StageOutcome, StageError> {
        let (Some(ocr), Some(extraction)) = (&context.ocr, &context.extraction) else {
            return Err(StageError::fatal("PERSIST_INPUT_MISSING", "missing ocr or extraction result"));
        };
        let issues_json: Vec<Value> = context.issues.iter().map(ValidationIssueRecord::to_json).collect();
        let payload = serde_json::json!({
            "result": extraction.fields,
            "validation_issues": issues_json,
            "model_name": extraction.model_name,
            "route_name": extraction.route_name,
            "ocr_confidence": round4(ocr.confidence),
            "extraction_confidence": round4(extraction.confidence),
            "quality_status": context.quality_status,
            "review_decision": context.review_decision,
            "quality_reason_codes": context.quality_reasons,
            "decision_log": context.decision_log,
        });
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        self.blob_store
            .put(&format!("runs/{run_id}/outputs/result.json"), &bytes)
            .map_err(|err| StageError::retryable("STORAGE_UNAVAILABLE", err.to_string()))?;
        let mut details = BTreeMap::new();
        details.insert("output".to_string(), Value::String("result.json".to_string()));
        Ok(StageOutcome::Persist { payload, details })
    }

    fn stage_export(&self, run_id: &RunId, context: &RunContext) -> Result<StageOutcome, StageError> {
        let summary = serde_json::json!({
            "run_id": run_id.as_str(),
            "quality_status": context.quality_status,
            "review_decision": context.review_decision,
            "quality_reason_codes": context.quality_reasons,
        });
        let bytes = serde_json::to_vec(&summary).unwrap_or_default();
        self.blob_store
            .put(&format!("runs/{run_id}/artifacts/export_summary.json"), &bytes)
            .map_err(|err| StageError::retryable("STORAGE_UNAVAILABLE", err.to_string()))?;
        let mut details = BTreeMap::new();
        details.insert(
            "export_artifact".to_string(),
            Value::String("export_summary.json".to_string()),
        );
        Ok(StageOutcome::Export { details })
    }

    fn finish_with_error(&self, run: &mut Run, err: &StageError) {
        if err.code == RUN_CANCELLED_ERROR_CODE {
            run.status = RunStatus::Cancelled;
            run.error_code = None;
            run.finished_at = Some(time::OffsetDateTime::now_utc());
            self.save_run(run);
            self.append_audit(
                "run_cancelled",
                Some(&run.id),
                serde_json::json!({"error_code": err.code}),
            );
            return;
        }
        run.status = RunStatus::Failed;
        run.error_code = Some(err.code.clone());
        run.finished_at = Some(time::OffsetDateTime::now_utc());
        self.save_run(run);
        self.append_audit("run_failed", Some(&run.id), serde_json::json!({"error_code": err.code}));
    }

    fn fail_run(&self, run: &mut Run, error_code: &str) {
        run.status = RunStatus::Failed;
        run.error_code = Some(error_code.to_string());
        run.finished_at = Some(time::OffsetDateTime::now_utc());
        self.save_run(run);
        self.append_audit(
            "run_failed",
            Some(&run.id),
            serde_json::json!({"error_code": error_code}),
        );
    }

    fn finish_success(&self, run: &mut Run, context: RunContext) {
        let extraction = context.extraction.clone();
        let final_status = status_from_decision(
            parse_decision(&context.review_decision),
            &context
                .issues
                .iter()
                .map(ValidationIssueRecord::as_gate_issue)
                .collect::<Vec<_>>(),
        );

        run.status = parse_run_status(final_status);
        run.model_name = extraction.as_ref().map(|e| e.model_name.clone());
        run.route_name = extraction.as_ref().map(|e| e.route_name.clone());
        run.review_decision = Some(context.review_decision.clone());
        run.review_reason_codes = Some(context.quality_reasons.clone());
        run.decision_log = context.decision_log.clone();
        run.result = extraction.map(|e| serde_json::json!(e.fields));
        run.validation_issues = Some(context.issues.iter().map(ValidationIssueRecord::to_json).collect());
        run.finished_at = Some(time::OffsetDateTime::now_utc());
        self.save_run(run);

        let decision_log_hash = context
            .decision_log
            .as_ref()
            .and_then(|log| log.get("inputs_snapshot"))
            .and_then(|snapshot| snapshot.get("hash_sha256"))
            .cloned();
        self.append_audit(
            "run_completed",
            Some(&run.id),
            serde_json::json!({
                "status": final_status,
                "model_name": run.model_name,
                "route_name": run.route_name,
                "issue_count": context.issues.len(),
                "decision": context.review_decision,
                "reason_codes": context.quality_reasons,
                "decision_log_hash": decision_log_hash,
            }),
        );

        if let Some(log) = &context.decision_log {
            let bytes = serde_json::to_vec(log).unwrap_or_default();
            if let Err(err) = self
                .blob_store
                .put(&format!("runs/{}/artifacts/quality_decision_log.json", run.id), &bytes)
            {
                warn!(error = %err, run_id = %run.id, "failed to persist optional decision log artifact");
            }
        }
        if !context.quality_reasons.is_empty() {
            let bytes = serde_json::to_vec(&serde_json::json!({"reason_codes": context.quality_reasons})).unwrap_or_default();
            if let Err(err) = self
                .blob_store
                .put(&format!("runs/{}/artifacts/quality_reason_codes.json", run.id), &bytes)
            {
                warn!(error = %err, run_id = %run.id, "failed to persist optional reason codes artifact");
            }
        }
    }

    fn append_audit(&self, event_type: &str, run_id: Option<&RunId>, payload: Value) {
        let Some(map) = payload.as_object().cloned() else {
            return;
        };
        if let Err(err) = self.audit_sink.append(event_type, run_id, map) {
            warn!(error = %err, event_type, "failed to append audit event");
        }
    }
}

fn apply_stage_outcome(
    context: &mut RunContext,
    outcome: StageOutcome,
    details: &mut BTreeMap<String, Value>,
    version_snapshot: &BTreeMap<String, Value>,
) {
    match outcome {
        StageOutcome::Preprocess { details: extra } => merge(details, extra),
        StageOutcome::Ocr { result, details: extra } => {
            context.ocr = Some(result);
            merge(details, extra);
        }
        StageOutcome::Extract { result, details: extra } => {
            context.extraction = Some(result);
            merge(details, extra);
        }
        StageOutcome::Validate {
            issues,
            decision,
            details: extra,
        } => {
            let mut decision_log = build_decision_log(&decision);
            if !version_snapshot.is_empty() {
                decision_log.insert(
                    "versions".to_string(),
                    Value::Object(version_snapshot.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                );
            }
            context.quality_status = status_from_decision(
                decision.decision,
                &issues.iter().map(ValidationIssueRecord::as_gate_issue).collect::<Vec<_>>(),
            )
            .to_string();
            context.quality_reasons = decision.reason_codes.clone();
            context.review_decision = match decision.decision {
                crate::review::ReviewDecision::AutoApproved => "AUTO_APPROVED".to_string(),
                crate::review::ReviewDecision::NeedsReview => "NEEDS_REVIEW".to_string(),
            };
            context.decision_log = Some(decision_log);
            context.issues = issues;
            merge(details, extra);
        }
        StageOutcome::Persist { details: extra, .. } => merge(details, extra),
        StageOutcome::Export { details: extra } => merge(details, extra),
    }
}

fn merge(details: &mut BTreeMap<String, Value>, extra: BTreeMap<String, Value>) {
    for (key, value) in extra {
        details.insert(key, value);
    }
}

fn build_decision_log(outcome: &ReviewOutcome) -> BTreeMap<String, Value> {
    match serde_json::to_value(outcome) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

fn parse_decision(decision: &str) -> crate::review::ReviewDecision {
    if decision == "NEEDS_REVIEW" {
        crate::review::ReviewDecision::NeedsReview
    } else {
        crate::review::ReviewDecision::AutoApproved
    }
}

fn parse_run_status(status: &str) -> RunStatus {
    match status {
        "WARN" => RunStatus::Warn,
        "NEEDS_REVIEW" => RunStatus::NeedsReview,
        _ => RunStatus::Success,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}


#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::fixtures::FixedExtractionProvider;
    use super::fixtures::FixedOcrProvider;
    use super::fixtures::FlakyOcrProvider;
    use super::fixtures::InMemoryBlobStore;
    use super::fixtures::InMemoryRepository;
    use super::fixtures::NoopAuditSink;
    use super::fixtures::SlowOcrProvider;
    use super::fixtures::accepted_document;
    use super::fixtures::orchestrator_config;
    use super::fixtures::queued_run;
    use super::fixtures::succeeded_anywhere;
    use super::*;
    use crate::identifiers::DocumentId;
    use crate::identifiers::TenantId;

    fn default_ocr() -> FixedOcrProvider {
        FixedOcrProvider {
            text: "invoice text".to_string(),
            confidence: 0.9,
            language: "en".to_string(),
        }
    }

    #[test]
    fn happy_path_reaches_terminal_success_family_with_six_stage_rows() {
        let repo = InMemoryRepository::default();
        let blob = InMemoryBlobStore::default();
        let audit = NoopAuditSink;
        let ocr = default_ocr();
        let extraction = FixedExtractionProvider;

        let document = accepted_document("raw/doc/invoice.png");
        blob.put(&document.storage_path, b"fake-png-bytes").unwrap();
        repo.create_document(document.clone()).unwrap();
        let run = repo
            .create_run(queued_run(document.id.clone(), document.tenant_id.clone()))
            .unwrap();

        let orchestrator = Orchestrator::new(
            &repo,
            &blob,
            &audit,
            &ocr,
            &extraction,
            orchestrator_config(Duration::from_secs(5), Duration::from_secs(30), 3),
        );
        orchestrator.process_run(&run.id, "worker-1");

        let finished = repo.get_run(&run.id, None).unwrap().unwrap();
        assert!(finished.status.is_terminal());
        assert!(matches!(
            finished.status,
            RunStatus::Success | RunStatus::Warn | RunStatus::NeedsReview
        ));
        assert!(finished.finished_at.is_some());

        for stage in StageName::pipeline_order() {
            let rows = repo.stage_rows(&run.id, stage);
            assert!(succeeded_anywhere(&rows), "missing succeeded row for {stage:?}");
        }
        assert!(blob.get(&format!("runs/{}/outputs/result.json", run.id)).is_ok());
    }

    #[test]
    fn pre_cancelled_run_terminates_as_cancelled_before_preprocess() {
        let repo = InMemoryRepository::default();
        let blob = InMemoryBlobStore::default();
        let audit = NoopAuditSink;
        let ocr = default_ocr();
        let extraction = FixedExtractionProvider;

        let document = accepted_document("raw/doc/invoice.png");
        repo.create_document(document.clone()).unwrap();
        let mut run = queued_run(document.id.clone(), document.tenant_id.clone());
        run.cancel_requested = true;
        let run = repo.create_run(run).unwrap();

        let orchestrator = Orchestrator::new(
            &repo,
            &blob,
            &audit,
            &ocr,
            &extraction,
            orchestrator_config(Duration::from_secs(5), Duration::from_secs(30), 3),
        );
        orchestrator.process_run(&run.id, "worker-1");

        let finished = repo.get_run(&run.id, None).unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Cancelled);
        assert!(finished.error_code.is_none());
        let rows = repo.stage_rows(&run.id, StageName::Preprocess);
        assert!(rows.iter().any(|row| row.status == StageStatus::Cancelled));
    }

    #[test]
    fn missing_document_fails_the_run() {
        let repo = InMemoryRepository::default();
        let blob = InMemoryBlobStore::default();
        let audit = NoopAuditSink;
        let ocr = default_ocr();
        let extraction = FixedExtractionProvider;

        let missing_document_id = DocumentId::generate();
        let tenant = TenantId::generate();
        let run = repo.create_run(queued_run(missing_document_id, tenant)).unwrap();

        let orchestrator = Orchestrator::new(
            &repo,
            &blob,
            &audit,
            &ocr,
            &extraction,
            orchestrator_config(Duration::from_secs(5), Duration::from_secs(30), 3),
        );
        orchestrator.process_run(&run.id, "worker-1");

        let finished = repo.get_run(&run.id, None).unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error_code.as_deref(), Some("DOCUMENT_NOT_FOUND"));
    }

    #[test]
    fn quarantined_document_fails_the_run() {
        let repo = InMemoryRepository::default();
        let blob = InMemoryBlobStore::default();
        let audit = NoopAuditSink;
        let ocr = default_ocr();
        let extraction = FixedExtractionProvider;

        let mut document = accepted_document("raw/doc/invoice.png");
        document.ingestion_status = IngestionStatus::Quarantined;
        repo.create_document(document.clone()).unwrap();
        let run = repo
            .create_run(queued_run(document.id.clone(), document.tenant_id.clone()))
            .unwrap();

        let orchestrator = Orchestrator::new(
            &repo,
            &blob,
            &audit,
            &ocr,
            &extraction,
            orchestrator_config(Duration::from_secs(5), Duration::from_secs(30), 3),
        );
        orchestrator.process_run(&run.id, "worker-1");

        let finished = repo.get_run(&run.id, None).unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error_code.as_deref(), Some("DOCUMENT_QUARANTINED"));
    }

    #[test]
    fn run_timeout_fails_before_any_stage_executes() {
        let repo = InMemoryRepository::default();
        let blob = InMemoryBlobStore::default();
        let audit = NoopAuditSink;
        let ocr = default_ocr();
        let extraction = FixedExtractionProvider;

        let document = accepted_document("raw/doc/invoice.png");
        repo.create_document(document.clone()).unwrap();
        let run = repo
            .create_run(queued_run(document.id.clone(), document.tenant_id.clone()))
            .unwrap();

        let orchestrator = Orchestrator::new(
            &repo,
            &blob,
            &audit,
            &ocr,
            &extraction,
            orchestrator_config(Duration::from_secs(5), Duration::from_nanos(1), 3),
        );
        orchestrator.process_run(&run.id, "worker-1");

        let finished = repo.get_run(&run.id, None).unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error_code.as_deref(), Some("RUN_TIMEOUT"));
        assert!(repo.stage_rows(&run.id, StageName::Preprocess).is_empty());
    }

    #[test]
    fn transient_ocr_failure_retries_then_succeeds() {
        let repo = InMemoryRepository::default();
        let blob = InMemoryBlobStore::default();
        let audit = NoopAuditSink;
        let ocr = FlakyOcrProvider {
            calls: AtomicU32::new(0),
            fail_first_n: 1,
        };
        let extraction = FixedExtractionProvider;

        let document = accepted_document("raw/doc/invoice.png");
        blob.put(&document.storage_path, b"fake-png-bytes").unwrap();
        repo.create_document(document.clone()).unwrap();
        let run = repo
            .create_run(queued_run(document.id.clone(), document.tenant_id.clone()))
            .unwrap();

        let orchestrator = Orchestrator::new(
            &repo,
            &blob,
            &audit,
            &ocr,
            &extraction,
            orchestrator_config(Duration::from_secs(5), Duration::from_secs(30), 3),
        );
        orchestrator.process_run(&run.id, "worker-1");

        let finished = repo.get_run(&run.id, None).unwrap().unwrap();
        assert!(matches!(
            finished.status,
            RunStatus::Success | RunStatus::Warn | RunStatus::NeedsReview
        ));
        let ocr_rows = repo.stage_rows(&run.id, StageName::Ocr);
        assert_eq!(ocr_rows.len(), 2);
        assert!(ocr_rows.iter().any(|row| row.attempt == 1 && row.status == StageStatus::Failed));
        assert!(ocr_rows.iter().any(|row| row.attempt == 2 && row.status == StageStatus::Succeeded));
    }

    #[test]
    fn ocr_stage_timeout_is_terminal_when_no_attempts_remain() {
        let repo = InMemoryRepository::default();
        let blob = InMemoryBlobStore::default();
        let audit = NoopAuditSink;
        // `run_stage_with_timeout` floors the configured stage timeout at one
        // second, so the fake provider must sleep past that floor to trip it.
        let ocr = SlowOcrProvider {
            sleep: Duration::from_millis(1100),
        };
        let extraction = FixedExtractionProvider;

        let document = accepted_document("raw/doc/invoice.png");
        blob.put(&document.storage_path, b"fake-png-bytes").unwrap();
        repo.create_document(document.clone()).unwrap();
        let run = repo
            .create_run(queued_run(document.id.clone(), document.tenant_id.clone()))
            .unwrap();

        let orchestrator = Orchestrator::new(
            &repo,
            &blob,
            &audit,
            &ocr,
            &extraction,
            orchestrator_config(Duration::from_millis(1), Duration::from_secs(30), 1),
        );
        orchestrator.process_run(&run.id, "worker-1");

        let finished = repo.get_run(&run.id, None).unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error_code.as_deref(), Some("OCR_TIMEOUT"));
        let ocr_rows = repo.stage_rows(&run.id, StageName::Ocr);
        assert_eq!(ocr_rows.len(), 1);
        assert_eq!(ocr_rows[0].error_code.as_deref(), Some("OCR_TIMEOUT"));
    }

    #[test]
    fn already_terminal_run_is_a_no_op() {
        let repo = InMemoryRepository::default();
        let blob = InMemoryBlobStore::default();
        let audit = NoopAuditSink;
        let ocr = default_ocr();
        let extraction = FixedExtractionProvider;

        let document = accepted_document("raw/doc/invoice.png");
        repo.create_document(document.clone()).unwrap();
        let mut run = queued_run(document.id.clone(), document.tenant_id.clone());
        run.status = RunStatus::Success;
        run.finished_at = Some(time::OffsetDateTime::now_utc());
        let run = repo.create_run(run).unwrap();

        let orchestrator = Orchestrator::new(
            &repo,
            &blob,
            &audit,
            &ocr,
            &extraction,
            orchestrator_config(Duration::from_secs(5), Duration::from_secs(30), 3),
        );
        orchestrator.process_run(&run.id, "worker-1");

        let finished = repo.get_run(&run.id, None).unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Success);
        assert!(repo.stage_rows(&run.id, StageName::Preprocess).is_empty());
    }
}
