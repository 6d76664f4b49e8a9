// crates/invoice-gate-core/src/entities.rs
// ============================================================================
// Module: Invoice Gate Entities
// Description: Document, Run, RunStage, QuarantineItem, and AuditEvent types.
// Purpose: Shared in-memory representation of the persisted data model.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! These types mirror the persisted rows of the four core tables plus the
//! append-only audit log. They carry no behavior of their own; the
//! orchestrator and policy modules operate on them.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;

use crate::identifiers::DocumentId;
use crate::identifiers::QuarantineItemId;
use crate::identifiers::RunId;
use crate::identifiers::TenantId;

/// Outcome of ingestion-time quality gating for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    /// The document passed all ingestion gates and may be run.
    Accepted,
    /// The document failed one or more ingestion gates and is quarantined.
    Quarantined,
    /// The document was refused outright; no run may be created for it.
    Rejected,
}

/// A document accepted (or quarantined) at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique document identifier.
    pub id: DocumentId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Original uploaded filename.
    pub filename: String,
    /// Declared MIME content type.
    pub content_type: String,
    /// Size of the stored blob in bytes.
    pub size_bytes: u64,
    /// Blob store path of the stored document.
    pub storage_path: String,
    /// Detected or declared document language.
    pub language: String,
    /// Result of the ingestion contract evaluation.
    pub ingestion_status: IngestionStatus,
    /// Quality tier assigned by the ingestion contract, if any.
    pub quality_tier: Option<String>,
    /// Quality score in `[0, 1]` assigned by the ingestion contract, if any.
    pub quality_score: Option<f64>,
    /// Creation timestamp.
    pub created_at: OffsetDateTime,
}

/// Lifecycle status of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Waiting for a worker to pick it up.
    Queued,
    /// Actively being processed by a worker.
    Running,
    /// Completed with no quality issues.
    Success,
    /// Completed with non-blocking quality issues.
    Warn,
    /// Completed but held for human review.
    NeedsReview,
    /// Failed after exhausting retries or hitting a non-retryable error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl RunStatus {
    /// Returns whether this status is terminal (no further stage execution
    /// will occur for the run).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// A single execution of a [`Document`] through the processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,
    /// Document this run processes.
    pub document_id: DocumentId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Username of the principal that requested the run.
    pub requested_by: String,
    /// Client-supplied idempotency key, if any.
    pub idempotency_key: Option<String>,
    /// The run this one replays, if it is a replay.
    pub replay_of_run_id: Option<RunId>,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Error code set when `status` is [`RunStatus::Failed`].
    pub error_code: Option<String>,
    /// Name of the model used for structured extraction, once known.
    pub model_name: Option<String>,
    /// Name of the extraction route used, once known.
    pub route_name: Option<String>,
    /// Review policy decision, once the VALIDATE stage has run.
    pub review_decision: Option<String>,
    /// Reason codes backing `review_decision`.
    pub review_reason_codes: Option<Vec<String>>,
    /// Full decision log recorded by the review policy, including the
    /// hashed `inputs_snapshot`.
    pub decision_log: Option<BTreeMap<String, serde_json::Value>>,
    /// Final extraction/export result payload, once persisted.
    pub result: Option<serde_json::Value>,
    /// Validation issues recorded by the VALIDATE stage.
    pub validation_issues: Option<Vec<serde_json::Value>>,
    /// Set once a cancellation has been requested, even if not yet honored.
    pub cancel_requested: bool,
    /// Creation timestamp.
    pub created_at: OffsetDateTime,
    /// Last-modified timestamp.
    pub updated_at: OffsetDateTime,
    /// Timestamp the run reached a terminal status, if it has.
    pub finished_at: Option<OffsetDateTime>,
}

/// Identifies one of the six fixed pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageName {
    /// Normalize and validate the raw document.
    Preprocess,
    /// Produce text from the document image/PDF.
    Ocr,
    /// Produce structured invoice fields from OCR text.
    Extract,
    /// Run the review policy gates against extracted fields.
    Validate,
    /// Persist the final run outcome.
    Persist,
    /// Emit the exportable result artifact.
    Export,
}

impl StageName {
    /// Returns the fixed stage execution order.
    #[must_use]
    pub const fn pipeline_order() -> [Self; 6] {
        [
            Self::Preprocess,
            Self::Ocr,
            Self::Extract,
            Self::Validate,
            Self::Persist,
            Self::Export,
        ]
    }
}

/// Execution status of a single stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// The stage attempt is in flight.
    Running,
    /// The stage attempt completed successfully.
    Succeeded,
    /// The stage attempt failed.
    Failed,
    /// The stage attempt was abandoned because the run was cancelled.
    Cancelled,
}

/// A recorded attempt at running one stage of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStage {
    /// Run this stage attempt belongs to.
    pub run_id: RunId,
    /// Which pipeline stage this attempt is for.
    pub stage_name: StageName,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Outcome of this attempt.
    pub status: StageStatus,
    /// Error code recorded when `status` is [`StageStatus::Failed`].
    pub error_code: Option<String>,
    /// Stage-specific details (duration, worker id, etc).
    pub details: BTreeMap<String, serde_json::Value>,
    /// Timestamp the attempt started.
    pub started_at: Option<OffsetDateTime>,
    /// Timestamp the attempt finished.
    pub finished_at: Option<OffsetDateTime>,
}

/// A document or run held for human attention after a quality failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineItem {
    /// Unique quarantine item identifier.
    pub id: QuarantineItemId,
    /// Document this item concerns.
    pub document_id: DocumentId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Pipeline stage (or ingestion) that produced this quarantine item.
    pub stage: String,
    /// Current handling status of the quarantine item.
    pub status: String,
    /// Reason codes explaining why the item was quarantined.
    pub reason_codes: Vec<String>,
    /// Blob store path of the document, if applicable.
    pub storage_path: String,
    /// Additional diagnostic details.
    pub details: BTreeMap<String, serde_json::Value>,
    /// Number of times this item has been reprocessed.
    pub reprocess_count: u32,
    /// Timestamp of the most recent reprocess attempt.
    pub last_reprocessed_at: Option<OffsetDateTime>,
    /// Creation timestamp.
    pub created_at: OffsetDateTime,
    /// Last-modified timestamp.
    pub updated_at: OffsetDateTime,
    /// Timestamp the item was resolved, if it has been.
    pub resolved_at: Option<OffsetDateTime>,
}

impl QuarantineItem {
    /// Returns whether this item is still awaiting resolution.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// A single entry in the append-only, hash-chained audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// RFC 3339 UTC timestamp of the event.
    pub timestamp_utc: String,
    /// Event type discriminator, e.g. `"run_created"`.
    pub event_type: String,
    /// Run the event concerns, if any.
    pub run_id: Option<String>,
    /// Event-specific payload, with sensitive leaves already masked.
    pub payload: BTreeMap<String, serde_json::Value>,
    /// Hash of the previous event in the chain, or the genesis marker.
    pub prev_hash: String,
    /// Hash of this event (computed before this field is populated).
    pub hash: String,
}
