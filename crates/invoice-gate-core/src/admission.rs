// crates/invoice-gate-core/src/admission.rs
// ============================================================================
// Module: Invoice Gate Admission
// Description: Run-creation admission checks — document eligibility,
//              idempotency dedup, per-tenant queue-depth backpressure — plus
//              run cancellation and replay.
// Purpose: Gate and mint Run rows ahead of orchestrator execution, generic
//          over the Repository/AuditSink trait surfaces like the
//          orchestrator itself.
// Dependencies: serde_json, time, crate::entities, crate::errors,
//               crate::identifiers, crate::interfaces
// ============================================================================

//! ## Overview
//! [`AdmissionService::create_run`] is the single entry point an HTTP
//! handler, CLI command, or test harness calls to mint a new [`Run`]. It
//! never executes the pipeline itself — that is the orchestrator's job —
//! it only decides whether a run may be queued at all, and leaves the
//! decision of *when* it executes to the configured
//! [`ExecutionMode`].

use time::OffsetDateTime;

use crate::entities::Document;
use crate::entities::IngestionStatus;
use crate::entities::Run;
use crate::entities::RunStatus;
use crate::identifiers::DocumentId;
use crate::identifiers::RunId;
use crate::identifiers::TenantId;
use crate::interfaces::AuditSink;
use crate::interfaces::Repository;
use crate::interfaces::StoreError;

/// How admitted runs are handed off for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Runs are dispatched to a background task immediately on admission.
    Background,
    /// Runs are left `QUEUED` for the polling worker to pick up.
    Worker,
    /// Runs are dispatched inline, same as `Background`; the worker also
    /// polls as a safety net for anything left behind.
    Hybrid,
}

impl ExecutionMode {
    /// Whether admission should hand the run to an inline executor rather
    /// than leaving it for the polling worker.
    #[must_use]
    pub const fn dispatches_inline(self) -> bool {
        matches!(self, Self::Background | Self::Hybrid)
    }
}

/// Per-tenant queue-depth thresholds admission enforces.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionThresholds {
    /// Queued-run count at or above which admission still accepts but
    /// signals backpressure.
    pub queue_warn_depth: u64,
    /// Queued-run count at or above which admission rejects outright.
    pub queue_reject_depth: u64,
}

/// Outcome of a successful [`AdmissionService::create_run`] call.
#[derive(Debug, Clone)]
pub struct AdmissionOutcome {
    /// The run that was admitted (or the pre-existing run returned for a
    /// repeated idempotency key).
    pub run: Run,
    /// `true` when this call created a new row; `false` for an idempotent
    /// replay of an existing request.
    pub created: bool,
    /// `true` when the tenant's queue depth was at or above
    /// `queue_warn_depth` at admission time.
    pub backpressure: bool,
    /// Whether the caller should dispatch the run inline, per the
    /// configured [`ExecutionMode`].
    pub dispatch_inline: bool,
}

/// Reasons [`AdmissionService::create_run`] may refuse to admit a run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    /// No document exists with the given id (and tenant, if scoped).
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),
    /// The document failed ingestion or has an open quarantine item.
    #[error("document not admissible: {0}")]
    DocumentNotAdmissible(String),
    /// The tenant's queued-run count has reached `queue_reject_depth`.
    #[error("queue overloaded for tenant {0}")]
    QueueOverloaded(TenantId),
    /// The run to be replayed does not exist.
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    /// The repository reported a backend failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Mints and cancels [`Run`] rows, applying the admission rules from
/// the original system's run-creation endpoint.
pub struct AdmissionService<'a> {
    repository: &'a dyn Repository,
    audit_sink: &'a dyn AuditSink,
    thresholds: AdmissionThresholds,
    execution_mode: ExecutionMode,
}

impl<'a> AdmissionService<'a> {
    /// Builds an admission service over the given backends.
    #[must_use]
    pub const fn new(
        repository: &'a dyn Repository,
        audit_sink: &'a dyn AuditSink,
        thresholds: AdmissionThresholds,
        execution_mode: ExecutionMode,
    ) -> Self {
        Self {
            repository,
            audit_sink,
            thresholds,
            execution_mode,
        }
    }

    /// Admits a new run for `document_id`, or returns the existing run for
    /// a repeated `idempotency_key`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::DocumentNotFound`] if no such document
    /// exists, [`AdmissionError::DocumentNotAdmissible`] if it failed
    /// ingestion or has an open quarantine item, or
    /// [`AdmissionError::QueueOverloaded`] if the tenant's queue depth has
    /// reached `queue_reject_depth`.
    pub fn create_run(
        &self,
        tenant_id: &TenantId,
        document_id: &DocumentId,
        requested_by: &str,
        idempotency_key: Option<&str>,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        let document = self
            .repository
            .get_document(document_id, Some(tenant_id))?
            .ok_or_else(|| AdmissionError::DocumentNotFound(document_id.clone()))?;
        self.check_document_admissible(&document, tenant_id)?;

        if let Some(key) = idempotency_key {
            if let Some(existing) = self.repository.get_run_by_idempotency(key, tenant_id)? {
                return Ok(AdmissionOutcome {
                    run: existing,
                    created: false,
                    backpressure: false,
                    dispatch_inline: false,
                });
            }
        }

        let backpressure = self.check_queue_depth(tenant_id)?;

        let now = OffsetDateTime::now_utc();
        let run = Run {
            id: RunId::generate(),
            document_id: document_id.clone(),
            tenant_id: tenant_id.clone(),
            requested_by: requested_by.to_string(),
            idempotency_key: idempotency_key.map(ToString::to_string),
            replay_of_run_id: None,
            status: RunStatus::Queued,
            error_code: None,
            model_name: None,
            route_name: None,
            review_decision: None,
            review_reason_codes: None,
            decision_log: None,
            result: None,
            validation_issues: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        let created = self.repository.create_run(run)?;
        self.append_audit("run_created", &created, backpressure);

        Ok(AdmissionOutcome {
            run: created,
            created: true,
            backpressure,
            dispatch_inline: self.execution_mode.dispatches_inline(),
        })
    }

    /// Creates a replay of `original_run_id`: a new run against the same
    /// document and tenant, bypassing idempotency but still subject to
    /// admission thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::RunNotFound`] if the original run does not
    /// exist, or [`AdmissionError::QueueOverloaded`] if the tenant's queue
    /// depth has reached `queue_reject_depth`.
    pub fn replay_run(
        &self,
        tenant_id: &TenantId,
        original_run_id: &RunId,
        requested_by: &str,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        let original = self
            .repository
            .get_run(original_run_id, Some(tenant_id))?
            .ok_or_else(|| AdmissionError::RunNotFound(original_run_id.clone()))?;

        let backpressure = self.check_queue_depth(tenant_id)?;

        let now = OffsetDateTime::now_utc();
        let run = Run {
            id: RunId::generate(),
            document_id: original.document_id.clone(),
            tenant_id: tenant_id.clone(),
            requested_by: requested_by.to_string(),
            idempotency_key: None,
            replay_of_run_id: Some(original.id.clone()),
            status: RunStatus::Queued,
            error_code: None,
            model_name: None,
            route_name: None,
            review_decision: None,
            review_reason_codes: None,
            decision_log: None,
            result: None,
            validation_issues: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        let created = self.repository.create_run(run)?;
        self.append_audit("run_created", &created, backpressure);

        Ok(AdmissionOutcome {
            run: created,
            created: true,
            backpressure,
            dispatch_inline: self.execution_mode.dispatches_inline(),
        })
    }

    /// Requests cancellation of `run_id`. A still-`QUEUED` run is
    /// immediately finalized as `CANCELLED`; any other non-terminal run is
    /// flagged for the orchestrator to observe at its next stage boundary.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::RunNotFound`] if the run does not exist.
    pub fn cancel_run(&self, tenant_id: &TenantId, run_id: &RunId) -> Result<Run, AdmissionError> {
        let mut run = self
            .repository
            .get_run(run_id, Some(tenant_id))?
            .ok_or_else(|| AdmissionError::RunNotFound(run_id.clone()))?;

        if run.status.is_terminal() {
            return Ok(run);
        }

        run.cancel_requested = true;
        run.updated_at = OffsetDateTime::now_utc();
        if run.status == RunStatus::Queued {
            run.status = RunStatus::Cancelled;
            run.finished_at = Some(run.updated_at);
        }
        self.repository.update_run(&run)?;
        self.append_audit("run_cancel_requested", &run, false);
        Ok(run)
    }

    fn check_document_admissible(&self, document: &Document, tenant_id: &TenantId) -> Result<(), AdmissionError> {
        if document.ingestion_status != IngestionStatus::Accepted {
            return Err(AdmissionError::DocumentNotAdmissible(format!(
                "ingestion_status={:?}",
                document.ingestion_status
            )));
        }
        if let Some(item) = self
            .repository
            .get_latest_open_quarantine_for_document(&document.id, tenant_id)?
        {
            if item.is_open() {
                return Err(AdmissionError::DocumentNotAdmissible(format!(
                    "open quarantine item {}",
                    item.id
                )));
            }
        }
        Ok(())
    }

    fn check_queue_depth(&self, tenant_id: &TenantId) -> Result<bool, AdmissionError> {
        let queued = self
            .repository
            .count_runs_by_status(RunStatus::Queued, Some(tenant_id))?;
        if queued >= self.thresholds.queue_reject_depth {
            return Err(AdmissionError::QueueOverloaded(tenant_id.clone()));
        }
        Ok(queued >= self.thresholds.queue_warn_depth)
    }

    fn append_audit(&self, event_type: &str, run: &Run, backpressure: bool) {
        let payload = serde_json::json!({
            "document_id": run.document_id.as_str(),
            "tenant_id": run.tenant_id.as_str(),
            "replay_of_run_id": run.replay_of_run_id.as_ref().map(crate::identifiers::RunId::as_str),
            "backpressure": backpressure,
        });
        let Some(map) = payload.as_object().cloned() else {
            return;
        };
        let _ = self.audit_sink.append(event_type, Some(&run.id), map);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::entities::AuditEvent;
    use crate::entities::QuarantineItem;
    use crate::entities::RunStage;
    use crate::interfaces::AuditError;
    use crate::interfaces::AuditVerification;
    use crate::interfaces::BlobError;

    struct FakeAuditSink;

    impl AuditSink for FakeAuditSink {
        fn append(
            &self,
            _event_type: &str,
            _run_id: Option<&RunId>,
            _payload: serde_json::Map<String, serde_json::Value>,
        ) -> Result<AuditEvent, AuditError> {
            Ok(AuditEvent {
                timestamp_utc: "2026-01-01T00:00:00Z".to_string(),
                event_type: "x".to_string(),
                run_id: None,
                payload: std::collections::BTreeMap::new(),
                prev_hash: "GENESIS".to_string(),
                hash: "deadbeef".to_string(),
            })
        }
        fn read_events(&self) -> Result<Vec<AuditEvent>, AuditError> {
            Ok(Vec::new())
        }
        fn verify(&self) -> Result<AuditVerification, AuditError> {
            Ok(AuditVerification {
                valid: true,
                events_checked: 0,
                head_hash: None,
                first_error_index: None,
                error: None,
            })
        }
    }

    #[derive(Default)]
    struct FakeRepository {
        documents: Mutex<Vec<Document>>,
        runs: Mutex<Vec<Run>>,
    }

    impl Repository for FakeRepository {
        fn create_document(&self, document: Document) -> Result<Document, StoreError> {
            self.documents.lock().unwrap().push(document.clone());
            Ok(document)
        }
        fn update_document_ingestion(&self, _document: &Document) -> Result<(), StoreError> {
            Ok(())
        }
        fn get_document(
            &self,
            document_id: &DocumentId,
            _tenant_id: Option<&TenantId>,
        ) -> Result<Option<Document>, StoreError> {
            Ok(self
                .documents
                .lock()
                .unwrap()
                .iter()
                .find(|d| &d.id == document_id)
                .cloned())
        }
        fn get_run_by_idempotency(&self, key: &str, tenant_id: &TenantId) -> Result<Option<Run>, StoreError> {
            Ok(self
                .runs
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.tenant_id == *tenant_id && r.idempotency_key.as_deref() == Some(key))
                .cloned())
        }
        fn create_run(&self, run: Run) -> Result<Run, StoreError> {
            self.runs.lock().unwrap().push(run.clone());
            Ok(run)
        }
        fn get_run(&self, run_id: &RunId, _tenant_id: Option<&TenantId>) -> Result<Option<Run>, StoreError> {
            Ok(self.runs.lock().unwrap().iter().find(|r| &r.id == run_id).cloned())
        }
        fn count_runs_by_status(
            &self,
            status: RunStatus,
            tenant_id: Option<&TenantId>,
        ) -> Result<u64, StoreError> {
            let count = self
                .runs
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.status == status && tenant_id.is_none_or(|t| &r.tenant_id == t))
                .count();
            Ok(count as u64)
        }
        fn list_queued_runs(&self, _limit: u32) -> Result<Vec<Run>, StoreError> {
            Ok(Vec::new())
        }
        fn list_run_stages(&self, _run_id: &RunId) -> Result<Vec<RunStage>, StoreError> {
            Ok(Vec::new())
        }
        fn upsert_stage(&self, stage: RunStage) -> Result<RunStage, StoreError> {
            Ok(stage)
        }
        fn update_run(&self, run: &Run) -> Result<(), StoreError> {
            let mut runs = self.runs.lock().unwrap();
            if let Some(existing) = runs.iter_mut().find(|r| r.id == run.id) {
                *existing = run.clone();
            }
            Ok(())
        }
        fn create_quarantine_item(&self, item: QuarantineItem) -> Result<QuarantineItem, StoreError> {
            Ok(item)
        }
        fn get_quarantine_item(
            &self,
            _item_id: &crate::identifiers::QuarantineItemId,
            _tenant_id: Option<&TenantId>,
        ) -> Result<Option<QuarantineItem>, StoreError> {
            Ok(None)
        }
        fn list_quarantine_items(
            &self,
            _tenant_id: &TenantId,
            _status: Option<&str>,
            _reason_code: Option<&str>,
            _limit: u32,
        ) -> Result<Vec<QuarantineItem>, StoreError> {
            Ok(Vec::new())
        }
        fn get_latest_open_quarantine_for_document(
            &self,
            _document_id: &DocumentId,
            _tenant_id: &TenantId,
        ) -> Result<Option<QuarantineItem>, StoreError> {
            Ok(None)
        }
        fn mark_quarantine_reprocessed(&self, _item: &QuarantineItem) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn accepted_document(id: DocumentId, tenant: TenantId) -> Document {
        Document {
            id,
            tenant_id: tenant,
            filename: "invoice.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 100,
            storage_path: "raw/doc/invoice.pdf".to_string(),
            language: "en".to_string(),
            ingestion_status: IngestionStatus::Accepted,
            quality_tier: Some("HIGH".to_string()),
            quality_score: Some(0.9),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn create_run_admits_accepted_document() {
        let repo = FakeRepository::default();
        let tenant = TenantId::generate();
        let document_id = DocumentId::generate();
        repo.create_document(accepted_document(document_id.clone(), tenant.clone()))
            .unwrap();
        let sink = FakeAuditSink;
        let service = AdmissionService::new(
            &repo,
            &sink,
            AdmissionThresholds {
                queue_warn_depth: 5,
                queue_reject_depth: 10,
            },
            ExecutionMode::Background,
        );
        let outcome = service.create_run(&tenant, &document_id, "alice", None).unwrap();
        assert!(outcome.created);
        assert!(outcome.dispatch_inline);
        assert_eq!(outcome.run.status, RunStatus::Queued);
    }

    #[test]
    fn repeated_idempotency_key_returns_existing_run() {
        let repo = FakeRepository::default();
        let tenant = TenantId::generate();
        let document_id = DocumentId::generate();
        repo.create_document(accepted_document(document_id.clone(), tenant.clone()))
            .unwrap();
        let sink = FakeAuditSink;
        let service = AdmissionService::new(
            &repo,
            &sink,
            AdmissionThresholds {
                queue_warn_depth: 5,
                queue_reject_depth: 10,
            },
            ExecutionMode::Worker,
        );
        let first = service
            .create_run(&tenant, &document_id, "alice", Some("key-1"))
            .unwrap();
        let second = service
            .create_run(&tenant, &document_id, "alice", Some("key-1"))
            .unwrap();
        assert_eq!(first.run.id, second.run.id);
        assert!(!second.created);
    }

    #[test]
    fn queue_at_reject_depth_is_refused() {
        let repo = FakeRepository::default();
        let tenant = TenantId::generate();
        let document_id = DocumentId::generate();
        repo.create_document(accepted_document(document_id.clone(), tenant.clone()))
            .unwrap();
        let sink = FakeAuditSink;
        let service = AdmissionService::new(
            &repo,
            &sink,
            AdmissionThresholds {
                queue_warn_depth: 0,
                queue_reject_depth: 1,
            },
            ExecutionMode::Worker,
        );
        service.create_run(&tenant, &document_id, "alice", None).unwrap();
        let second_document = DocumentId::generate();
        repo.create_document(accepted_document(second_document.clone(), tenant.clone()))
            .unwrap();
        let err = service
            .create_run(&tenant, &second_document, "alice", None)
            .unwrap_err();
        assert!(matches!(err, AdmissionError::QueueOverloaded(_)));
    }

    #[test]
    fn cancel_queued_run_finishes_immediately() {
        let repo = FakeRepository::default();
        let tenant = TenantId::generate();
        let document_id = DocumentId::generate();
        repo.create_document(accepted_document(document_id.clone(), tenant.clone()))
            .unwrap();
        let sink = FakeAuditSink;
        let service = AdmissionService::new(
            &repo,
            &sink,
            AdmissionThresholds {
                queue_warn_depth: 5,
                queue_reject_depth: 10,
            },
            ExecutionMode::Worker,
        );
        let outcome = service.create_run(&tenant, &document_id, "alice", None).unwrap();
        let cancelled = service.cancel_run(&tenant, &outcome.run.id).unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());
    }

    #[test]
    fn replay_run_creates_new_run_linked_to_original() {
        let repo = FakeRepository::default();
        let tenant = TenantId::generate();
        let document_id = DocumentId::generate();
        repo.create_document(accepted_document(document_id.clone(), tenant.clone()))
            .unwrap();
        let sink = FakeAuditSink;
        let service = AdmissionService::new(
            &repo,
            &sink,
            AdmissionThresholds {
                queue_warn_depth: 5,
                queue_reject_depth: 10,
            },
            ExecutionMode::Worker,
        );
        let original = service
            .create_run(&tenant, &document_id, "alice", Some("idem-1"))
            .unwrap();
        let replay = service
            .replay_run(&tenant, &original.run.id, "bob")
            .unwrap();
        assert_ne!(replay.run.id, original.run.id);
        assert_eq!(replay.run.replay_of_run_id, Some(original.run.id.clone()));
        assert_eq!(replay.run.document_id, original.run.document_id);
        assert!(replay.run.idempotency_key.is_none());
        assert!(replay.created);
    }

    #[test]
    fn replay_run_missing_original_is_not_found() {
        let repo = FakeRepository::default();
        let tenant = TenantId::generate();
        let sink = FakeAuditSink;
        let service = AdmissionService::new(
            &repo,
            &sink,
            AdmissionThresholds {
                queue_warn_depth: 5,
                queue_reject_depth: 10,
            },
            ExecutionMode::Worker,
        );
        let missing_run_id = RunId::generate();
        let err = service.replay_run(&tenant, &missing_run_id, "bob").unwrap_err();
        assert!(matches!(err, AdmissionError::RunNotFound(_)));
    }
}
