// crates/invoice-gate-core/src/errors.rs
// ============================================================================
// Module: Invoice Gate Error Taxonomy
// Description: Stage errors, retry/timeout classification, and the HTTP
//              status mapping for them.
// Purpose: Give the orchestrator a uniform, retry-aware error type.
// Dependencies: thiserror, crate::entities
// ============================================================================

//! ## Overview
//! [`StageError`] is the single error type stage implementations return.
//! It carries a stable machine-readable `code`, whether the orchestrator
//! should retry the attempt, and a free-form `detail` string for logs and
//! audit payloads. This mirrors the original `StageExecutionError` exception
//! used as control flow between stage functions and the orchestrator.

use thiserror::Error;

use crate::entities::StageName;

/// Error raised by a single stage execution attempt.
#[derive(Debug, Error, Clone)]
#[error("stage error {code}: {detail}")]
pub struct StageError {
    /// Stable machine-readable error code, e.g. `"OCR_TIMEOUT"`.
    pub code: String,
    /// Whether the orchestrator should retry this stage.
    pub retryable: bool,
    /// Human-readable detail for logs and audit payloads.
    pub detail: String,
}

impl StageError {
    /// Builds a non-retryable stage error.
    #[must_use]
    pub fn fatal(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            retryable: false,
            detail: detail.into(),
        }
    }

    /// Builds a retryable stage error.
    #[must_use]
    pub fn retryable(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            retryable: true,
            detail: detail.into(),
        }
    }
}

/// Stages the orchestrator will re-attempt (up to `max_stage_attempts`) on a
/// retryable failure. PREPROCESS and VALIDATE are single-attempt by design.
#[must_use]
pub const fn stage_is_retryable(stage: StageName) -> bool {
    matches!(
        stage,
        StageName::Ocr | StageName::Extract | StageName::Persist | StageName::Export
    )
}

/// The stage-specific error code raised when a stage exceeds
/// `stage_timeout_seconds`.
#[must_use]
pub const fn stage_timeout_code(stage: StageName) -> &'static str {
    match stage {
        StageName::Preprocess => "PREPROCESS_TIMEOUT",
        StageName::Ocr => "OCR_TIMEOUT",
        StageName::Extract => "EXTRACT_TIMEOUT",
        StageName::Validate => "VALIDATE_TIMEOUT",
        StageName::Persist => "PERSIST_TIMEOUT",
        StageName::Export => "EXPORT_TIMEOUT",
    }
}

/// Error codes the orchestrator treats as transient and therefore retryable
/// regardless of how the stage itself classified the failure.
pub const TRANSIENT_ERROR_CODES: &[&str] = &[
    "OCR_TIMEOUT",
    "EXTRACT_TIMEOUT",
    "PERSIST_TIMEOUT",
    "EXPORT_TIMEOUT",
    "STORAGE_UNAVAILABLE",
    "MODEL_OOM",
];

/// Error code raised when a cooperative cancellation check observes
/// `cancel_requested`.
pub const RUN_CANCELLED_ERROR_CODE: &str = "RUN_CANCELLED";

/// Error code raised when a run's wall-clock budget (`run_timeout_seconds`)
/// is exceeded at a stage boundary.
pub const RUN_TIMEOUT_ERROR_CODE: &str = "RUN_TIMEOUT";

/// Error code raised when a stage panics or returns an unclassified error.
pub const UNEXPECTED_RUNTIME_ERROR_CODE: &str = "UNEXPECTED_RUNTIME_ERROR";

/// A coarse HTTP status class a [`StageError`] or admission failure maps to.
/// Recorded here as a pure function so a future HTTP layer can reuse it
/// without this crate depending on any web framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatusClass {
    /// 400 Bad Request.
    BadRequest,
    /// 404 Not Found.
    NotFound,
    /// 409 Conflict.
    Conflict,
    /// 422 Unprocessable Entity.
    UnprocessableEntity,
    /// 429 Too Many Requests.
    TooManyRequests,
    /// 500 Internal Server Error.
    InternalError,
    /// 504 Gateway Timeout.
    GatewayTimeout,
}

/// Maps a stable error code to the HTTP status class it should surface as.
///
/// Unknown codes default to [`HttpStatusClass::InternalError`].
#[must_use]
pub fn http_status_for(code: &str) -> HttpStatusClass {
    match code {
        "DOCUMENT_NOT_FOUND" | "RUN_NOT_FOUND" => HttpStatusClass::NotFound,
        "DOCUMENT_QUARANTINED" | "RUN_NOT_FINALIZED" => HttpStatusClass::Conflict,
        "QUEUE_OVERLOADED" => HttpStatusClass::TooManyRequests,
        "UNSUPPORTED_MIME" | "FILE_TOO_LARGE" | "FILE_CORRUPT" => HttpStatusClass::BadRequest,
        "MISSING_REQUIRED_FIELDS"
        | "LOW_EXTRACTION_CONFIDENCE"
        | "OCR_EMPTY"
        | "PERSIST_INPUT_MISSING"
        | "VALIDATION_INPUT_MISSING" => HttpStatusClass::UnprocessableEntity,
        code if code.ends_with("_TIMEOUT") => HttpStatusClass::GatewayTimeout,
        _ => HttpStatusClass::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_is_not_retryable() {
        let err = StageError::fatal("FILE_CORRUPT", "bad header");
        assert!(!err.retryable);
    }

    #[test]
    fn retryable_is_retryable() {
        let err = StageError::retryable("OCR_TIMEOUT", "engine down");
        assert!(err.retryable);
    }

    #[test]
    fn only_ocr_extract_persist_export_are_retryable_stages() {
        assert!(!stage_is_retryable(StageName::Preprocess));
        assert!(stage_is_retryable(StageName::Ocr));
        assert!(stage_is_retryable(StageName::Extract));
        assert!(!stage_is_retryable(StageName::Validate));
        assert!(stage_is_retryable(StageName::Persist));
        assert!(stage_is_retryable(StageName::Export));
    }

    #[test]
    fn unknown_code_maps_to_internal_error() {
        assert_eq!(http_status_for("SOMETHING_NEW"), HttpStatusClass::InternalError);
    }

    #[test]
    fn timeout_code_maps_to_gateway_timeout() {
        assert_eq!(
            http_status_for(stage_timeout_code(StageName::Ocr)),
            HttpStatusClass::GatewayTimeout
        );
    }

    #[test]
    fn stage_timeout_codes_are_stage_specific() {
        assert_eq!(stage_timeout_code(StageName::Ocr), "OCR_TIMEOUT");
        assert_eq!(stage_timeout_code(StageName::Export), "EXPORT_TIMEOUT");
    }
}
