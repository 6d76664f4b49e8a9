// crates/invoice-gate-providers/src/ocr.rs
// ============================================================================
// Module: Heuristic OCR Provider
// Description: `OcrProvider` standing in for a real OCR engine: a plain-text
//              passthrough path plus a deterministic content-hash fallback.
// Purpose: Let the pipeline run end-to-end without a real OCR dependency.
// Dependencies: invoice_gate_core::{hashing, interfaces}
// ============================================================================

//! ## Overview
//! Mirrors `run_ocr`'s layered fallback in the original system, minus the
//! `pytesseract`/`PIL` dependency this workspace does not carry: a document
//! that already decodes as UTF-8 text is returned as-is at high confidence;
//! anything else falls through to [`OcrFallbackMode::Deterministic`] (a
//! stable synthetic transcript derived from a content hash) or
//! [`OcrFallbackMode::FailClosed`] (refuse outright), per [`OcrFallbackMode`].

use invoice_gate_core::hashing::hash_bytes;
use invoice_gate_core::hashing::DEFAULT_HASH_ALGORITHM;
use invoice_gate_core::interfaces::OcrError;
use invoice_gate_core::interfaces::OcrProvider;
use invoice_gate_core::interfaces::OcrResult;

/// Length, in hex characters, of the content-hash hint embedded in a
/// deterministic OCR fallback transcript.
const FALLBACK_DIGEST_LENGTH: usize = 12;
/// Confidence assigned to a plain-text passthrough result.
const PLAIN_TEXT_CONFIDENCE: f64 = 0.99;
/// Confidence assigned to a deterministic fallback transcript.
const FALLBACK_CONFIDENCE: f64 = 0.74;

/// Governs what happens when no real OCR engine can decode a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrFallbackMode {
    /// Synthesize a stable transcript from a content hash.
    Deterministic,
    /// Refuse to process the document at all.
    FailClosed,
}

/// A heuristic [`OcrProvider`]: plain-text passthrough, then a fallback
/// transcript gated by [`OcrFallbackMode`].
#[derive(Debug, Clone, Copy)]
pub struct HeuristicOcrProvider {
    fallback_mode: OcrFallbackMode,
}

impl HeuristicOcrProvider {
    /// Builds a provider with the given fallback behavior.
    #[must_use]
    pub const fn new(fallback_mode: OcrFallbackMode) -> Self {
        Self { fallback_mode }
    }
}

impl OcrProvider for HeuristicOcrProvider {
    fn run_ocr(&self, bytes: &[u8], content_type: &str) -> Result<OcrResult, OcrError> {
        if let Ok(text) = std::str::from_utf8(bytes) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Ok(OcrResult {
                    text: trimmed.to_string(),
                    confidence: PLAIN_TEXT_CONFIDENCE,
                    language: detect_language(trimmed),
                });
            }
        }

        match self.fallback_mode {
            OcrFallbackMode::FailClosed => Err(OcrError::EngineUnavailable(
                "no ocr engine available and fallback mode is fail_closed".to_string(),
            )),
            OcrFallbackMode::Deterministic => {
                let hint = if content_type.is_empty() { "document" } else { content_type };
                let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, bytes);
                let short_digest: String = digest.value.chars().take(FALLBACK_DIGEST_LENGTH).collect();
                let text = format!("invoice_file:{hint}\ncontent_hash:{short_digest}\nextracted_text_from:{hint}");
                Ok(OcrResult {
                    text,
                    confidence: FALLBACK_CONFIDENCE,
                    language: "en".to_string(),
                })
            }
        }
    }
}

/// Detects Persian text by the presence of Arabic-script codepoints;
/// defaults to English otherwise. A coarse stand-in for the original's
/// filename-keyword detector, since this provider only sees document bytes.
fn detect_language(text: &str) -> String {
    let has_persian = text.chars().any(|ch| ('\u{0600}'..='\u{06FF}').contains(&ch));
    if has_persian { "fa".to_string() } else { "en".to_string() }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let provider = HeuristicOcrProvider::new(OcrFallbackMode::Deterministic);
        let result = provider.run_ocr(b"Invoice No: 1001\nTotal: 100.00", "text/plain").unwrap();
        assert_eq!(result.text, "Invoice No: 1001\nTotal: 100.00");
        assert!((result.confidence - PLAIN_TEXT_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn binary_input_falls_back_deterministically() {
        let provider = HeuristicOcrProvider::new(OcrFallbackMode::Deterministic);
        let bytes = [0xFF, 0xFE, 0x00, 0x01, 0x02];
        let result = provider.run_ocr(&bytes, "application/pdf").unwrap();
        assert!(result.text.starts_with("invoice_file:application/pdf"));
        assert!((result.confidence - FALLBACK_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn binary_input_fails_closed_when_configured() {
        let provider = HeuristicOcrProvider::new(OcrFallbackMode::FailClosed);
        let bytes = [0xFF, 0xFE, 0x00];
        let err = provider.run_ocr(&bytes, "application/pdf").unwrap_err();
        assert!(matches!(err, OcrError::EngineUnavailable(_)));
    }

    #[test]
    fn persian_text_is_detected() {
        let provider = HeuristicOcrProvider::new(OcrFallbackMode::Deterministic);
        let result = provider.run_ocr("فاکتور شماره ۱".as_bytes(), "text/plain").unwrap();
        assert_eq!(result.language, "fa");
    }
}
