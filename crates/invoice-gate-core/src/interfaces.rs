// crates/invoice-gate-core/src/interfaces.rs
// ============================================================================
// Module: Invoice Gate Interfaces
// Description: Backend-agnostic interfaces for storage, blobs, OCR, and audit.
// Purpose: Define the contract surfaces the orchestrator runs against.
// Dependencies: crate::entities, crate::identifiers, thiserror
// ============================================================================

//! ## Overview
//! Interfaces define how the orchestrator integrates with persistence, blob
//! storage, OCR, structured extraction, and the audit log without embedding
//! any backend-specific detail. Implementations must be deterministic given
//! identical inputs and must fail closed on missing or invalid data.

use thiserror::Error;

use crate::entities::AuditEvent;
use crate::entities::Document;
use crate::entities::QuarantineItem;
use crate::entities::Run;
use crate::entities::RunStage;
use crate::entities::RunStatus;
use crate::entities::StageName;
use crate::entities::StageStatus;
use crate::identifiers::DocumentId;
use crate::identifiers::QuarantineItemId;
use crate::identifiers::RunId;
use crate::identifiers::TenantId;

// ============================================================================
// SECTION: Repository
// ============================================================================

/// Errors raised by a [`Repository`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness constraint (e.g. idempotency key) was violated.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The backing store reported an I/O or driver error.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence surface for documents, runs, run stages, and quarantine
/// items. Mirrors the repository functions the orchestrator and admission
/// layer call against in the original system.
pub trait Repository: Send + Sync {
    /// Inserts a newly ingested document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn create_document(&self, document: Document) -> Result<Document, StoreError>;

    /// Updates the ingestion outcome fields of an existing document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the document does not exist, or
    /// [`StoreError::Backend`] on a storage failure.
    fn update_document_ingestion(&self, document: &Document) -> Result<(), StoreError>;

    /// Fetches a document by id, optionally scoped to a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn get_document(
        &self,
        document_id: &DocumentId,
        tenant_id: Option<&TenantId>,
    ) -> Result<Option<Document>, StoreError>;

    /// Fetches a run by its client-supplied idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn get_run_by_idempotency(
        &self,
        key: &str,
        tenant_id: &TenantId,
    ) -> Result<Option<Run>, StoreError>;

    /// Inserts a newly created run in [`RunStatus::Queued`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the idempotency key already
    /// exists for this tenant, or [`StoreError::Backend`] on a storage
    /// failure.
    fn create_run(&self, run: Run) -> Result<Run, StoreError>;

    /// Fetches a run by id, optionally scoped to a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn get_run(&self, run_id: &RunId, tenant_id: Option<&TenantId>) -> Result<Option<Run>, StoreError>;

    /// Counts runs in the given status, optionally scoped to a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn count_runs_by_status(
        &self,
        status: RunStatus,
        tenant_id: Option<&TenantId>,
    ) -> Result<u64, StoreError>;

    /// Lists the oldest queued runs, up to `limit`, for worker pickup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn list_queued_runs(&self, limit: u32) -> Result<Vec<Run>, StoreError>;

    /// Lists all recorded stage attempts for a run, in execution order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn list_run_stages(&self, run_id: &RunId) -> Result<Vec<RunStage>, StoreError>;

    /// Inserts or updates the stage attempt identified by
    /// `(run_id, stage_name, attempt)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn upsert_stage(&self, stage: RunStage) -> Result<RunStage, StoreError>;

    /// Updates a run's terminal/in-flight fields.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the run does not exist, or
    /// [`StoreError::Backend`] on a storage failure.
    fn update_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Inserts a new quarantine item.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn create_quarantine_item(&self, item: QuarantineItem) -> Result<QuarantineItem, StoreError>;

    /// Fetches a quarantine item by id, optionally scoped to a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn get_quarantine_item(
        &self,
        item_id: &QuarantineItemId,
        tenant_id: Option<&TenantId>,
    ) -> Result<Option<QuarantineItem>, StoreError>;

    /// Lists quarantine items for a tenant, optionally filtered by status
    /// or reason code.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn list_quarantine_items(
        &self,
        tenant_id: &TenantId,
        status: Option<&str>,
        reason_code: Option<&str>,
        limit: u32,
    ) -> Result<Vec<QuarantineItem>, StoreError>;

    /// Returns the most recent unresolved quarantine item for a document,
    /// if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn get_latest_open_quarantine_for_document(
        &self,
        document_id: &DocumentId,
        tenant_id: &TenantId,
    ) -> Result<Option<QuarantineItem>, StoreError>;

    /// Updates a quarantine item after a reprocessing attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the item does not exist, or
    /// [`StoreError::Backend`] on a storage failure.
    fn mark_quarantine_reprocessed(&self, item: &QuarantineItem) -> Result<(), StoreError>;
}

// ============================================================================
// SECTION: Blob Store
// ============================================================================

/// Errors raised by a [`BlobStore`] implementation.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The requested blob does not exist.
    #[error("blob not found: {0}")]
    NotFound(String),
    /// The backing store reported an I/O error.
    #[error("blob store io error: {0}")]
    Io(String),
}

/// Content-addressed artifact storage for raw uploads and stage outputs.
pub trait BlobStore: Send + Sync {
    /// Writes `bytes` under `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Io`] on a storage failure.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError>;

    /// Reads the bytes stored under `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::NotFound`] if `path` does not exist, or
    /// [`BlobError::Io`] on a storage failure.
    fn get(&self, path: &str) -> Result<Vec<u8>, BlobError>;
}

// ============================================================================
// SECTION: Audit Sink
// ============================================================================

/// Errors raised by an [`AuditSink`] implementation.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The canonicalization or hashing of an event failed.
    #[error("audit hashing error: {0}")]
    Hashing(String),
    /// The backing store reported an I/O error.
    #[error("audit sink io error: {0}")]
    Io(String),
}

/// Result of verifying the integrity of the audit chain.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditVerification {
    /// Whether every event's hash and chain link verified.
    pub valid: bool,
    /// Number of events checked.
    pub events_checked: u64,
    /// Hash of the last verified event, if any were verified.
    pub head_hash: Option<String>,
    /// Index of the first event that failed verification, if `valid` is
    /// `false`.
    pub first_error_index: Option<u64>,
    /// Description of the first verification failure, if `valid` is
    /// `false`.
    pub error: Option<String>,
}

/// Append-only, hash-chained audit log sink.
pub trait AuditSink: Send + Sync {
    /// Appends a new event to the chain, masking sensitive payload leaves
    /// and linking to the current chain head.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if canonicalization or the underlying write
    /// fails.
    fn append(
        &self,
        event_type: &str,
        run_id: Option<&RunId>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AuditEvent, AuditError>;

    /// Reads every event currently recorded, in append order.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] on a read failure.
    fn read_events(&self) -> Result<Vec<AuditEvent>, AuditError>;

    /// Recomputes and checks every event's hash and chain link.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] on a read failure.
    fn verify(&self) -> Result<AuditVerification, AuditError>;
}

// ============================================================================
// SECTION: OCR Provider
// ============================================================================

/// Result of running OCR over a document page.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OcrResult {
    /// Extracted plain text.
    pub text: String,
    /// Confidence in `[0, 1]` that the text is accurate.
    pub confidence: f64,
    /// Detected (or configured) language code.
    pub language: String,
}

/// Errors raised by an [`OcrProvider`] implementation.
#[derive(Debug, Error)]
pub enum OcrError {
    /// OCR failed and no deterministic fallback is permitted.
    #[error("ocr failed: {0}")]
    EngineUnavailable(String),
}

/// Produces text from document bytes.
pub trait OcrProvider: Send + Sync {
    /// Runs OCR over `bytes`, given the document's declared `content_type`.
    ///
    /// # Errors
    ///
    /// Returns [`OcrError::EngineUnavailable`] when no engine or fallback
    /// can produce a result.
    fn run_ocr(&self, bytes: &[u8], content_type: &str) -> Result<OcrResult, OcrError>;
}

// ============================================================================
// SECTION: Extraction Provider
// ============================================================================

/// Result of running structured field extraction over OCR text.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExtractionResult {
    /// Extracted field name/value pairs.
    pub fields: std::collections::BTreeMap<String, serde_json::Value>,
    /// Per-field evidence snippets, keyed the same as `fields`.
    pub field_evidence: std::collections::BTreeMap<String, String>,
    /// Overall confidence in `[0, 1]` of the extraction.
    pub confidence: f64,
    /// Name of the model that produced this result.
    pub model_name: String,
    /// Name of the extraction route used.
    pub route_name: String,
}

/// Errors raised by an [`ExtractionProvider`] implementation.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The extraction model or heuristic path failed.
    #[error("extraction failed: {0}")]
    ModelFailure(String),
    /// The extraction attempt exceeded its allotted time.
    #[error("extraction timed out")]
    Timeout,
}

/// Produces structured invoice fields from OCR text.
pub trait ExtractionProvider: Send + Sync {
    /// Runs structured extraction over `ocr_text`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError`] when extraction fails or times out.
    fn run_extraction(&self, ocr_text: &str, language: &str) -> Result<ExtractionResult, ExtractionError>;
}

// ============================================================================
// SECTION: Stage Status Helper
// ============================================================================

/// Builds a [`RunStage`] in the [`StageStatus::Running`] state, the shape
/// every stage's first write takes before it either succeeds or fails.
#[must_use]
pub fn starting_stage(run_id: RunId, stage_name: StageName, attempt: u32) -> RunStage {
    RunStage {
        run_id,
        stage_name,
        attempt,
        status: StageStatus::Running,
        error_code: None,
        details: std::collections::BTreeMap::new(),
        started_at: None,
        finished_at: None,
    }
}
