// crates/invoice-gate-providers/src/lib.rs
// ============================================================================
// Module: Invoice Gate Providers
// Description: Built-in filesystem blob store, hash-chained audit sink, and
//              heuristic OCR/extraction adapters.
// Purpose: Concrete, dependency-light implementations of the core traits so
//          the orchestrator can run end-to-end without external services.
// Dependencies: invoice-gate-core, serde, serde_json, sha2, thiserror, time,
//               tracing
// ============================================================================

//! ## Overview
//! Every type in this crate implements a trait from
//! `invoice_gate_core::interfaces`. None of them is the "real" production
//! backend the original system integrates with (`pytesseract`, an LLM
//! endpoint, `invoice2data`); they are deterministic stand-ins that exercise
//! the same contract so the orchestrator never needs a special case for
//! "no real engine wired".

#![forbid(unsafe_code)]

pub mod audit;
pub mod blob;
pub mod extraction;
pub mod ocr;

pub use audit::FileAuditChain;
pub use blob::FilesystemBlobStore;
pub use extraction::select_model_for_extraction;
pub use extraction::HeuristicExtractionProvider;
pub use ocr::HeuristicOcrProvider;
pub use ocr::OcrFallbackMode;
