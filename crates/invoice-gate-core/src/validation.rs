// crates/invoice-gate-core/src/validation.rs
// ============================================================================
// Module: Invoice Gate Extraction Validation
// Description: Upstream validation issues raised over a structured
//              extraction result, ahead of the review policy's own gates.
// Purpose: Catch missing fields, arithmetic inconsistency, and low
//          confidence before the review policy runs.
// Dependencies: serde_json, crate::review
// ============================================================================

//! ## Overview
//! [`validate_extraction_result`] mirrors the original system's
//! `validate_result`: four independent checks, each contributing at most one
//! issue, accumulated rather than short-circuited. Its output feeds both the
//! persisted `Run.validation_issues` column (as JSON, via [`ValidationIssueRecord::to_json`])
//! and the review policy's own Gate 2/Gate 4 checks (as [`crate::review::ValidationIssue`]).

use std::collections::BTreeMap;

use serde_json::Value;

use crate::review::IssueSeverity;
use crate::review::ValidationIssue;

/// The five fields required for a structured extraction result to be
/// considered complete.
pub const REQUIRED_FIELDS: &[&str] = &["vendor_name", "invoice_no", "invoice_date", "total", "currency"];

/// A single upstream validation issue, carrying the human-readable detail
/// the review policy's gates discard.
#[derive(Debug, Clone)]
pub struct ValidationIssueRecord {
    /// Stable issue code, e.g. `"TOTAL_MISMATCH"`.
    pub code: String,
    /// Severity of the issue.
    pub severity: IssueSeverity,
    /// Human-readable detail for persistence and audit payloads.
    pub detail: String,
}

impl ValidationIssueRecord {
    /// Projects this record down to the `{code, severity}` pair the review
    /// policy's gates consume.
    #[must_use]
    pub fn as_gate_issue(&self) -> ValidationIssue {
        ValidationIssue {
            code: self.code.clone(),
            severity: self.severity,
        }
    }

    /// Serializes this record as the JSON object persisted in
    /// `Run.validation_issues`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "code": self.code,
            "severity": match self.severity {
                IssueSeverity::Error => "error",
                IssueSeverity::Warning => "warning",
            },
            "detail": self.detail,
        })
    }
}

/// Runs the four upstream validation checks over a structured extraction
/// `result`, given its `extraction_confidence` and the `ocr_confidence` the
/// OCR stage produced.
///
/// # Invariants
/// - All four checks always run; none short-circuits the others.
#[must_use]
pub fn validate_extraction_result(
    result: &BTreeMap<String, Value>,
    extraction_confidence: f64,
    ocr_confidence: f64,
    low_confidence_threshold: f64,
    low_ocr_confidence_threshold: f64,
) -> Vec<ValidationIssueRecord> {
    let mut issues = Vec::new();

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .filter(|field| !field_present(result, field))
        .copied()
        .collect();
    if !missing.is_empty() {
        issues.push(ValidationIssueRecord {
            code: "MISSING_REQUIRED_FIELDS".to_string(),
            severity: IssueSeverity::Error,
            detail: format!("Missing required fields: {}", missing.join(", ")),
        });
    }

    let subtotal = to_number(result.get("subtotal")).unwrap_or(0.0);
    let tax = to_number(result.get("tax")).unwrap_or(0.0);
    let total = to_number(result.get("total")).unwrap_or(0.0);
    if round2(subtotal + tax) != round2(total) {
        issues.push(ValidationIssueRecord {
            code: "TOTAL_MISMATCH".to_string(),
            severity: IssueSeverity::Warning,
            detail: "subtotal + tax does not match total".to_string(),
        });
    }

    if extraction_confidence < low_confidence_threshold {
        issues.push(ValidationIssueRecord {
            code: "LOW_EXTRACTION_CONFIDENCE".to_string(),
            severity: IssueSeverity::Error,
            detail: format!("extraction confidence={extraction_confidence:.2}"),
        });
    }

    if ocr_confidence < low_ocr_confidence_threshold {
        issues.push(ValidationIssueRecord {
            code: "LOW_OCR_CONFIDENCE".to_string(),
            severity: IssueSeverity::Error,
            detail: format!("ocr confidence={ocr_confidence:.2}"),
        });
    }

    issues
}

fn field_present(result: &BTreeMap<String, Value>, field: &str) -> bool {
    match result.get(field) {
        None => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Null) => false,
        Some(_) => true,
    }
}

fn to_number(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let cleaned = s.trim().replace(',', "");
            if cleaned.is_empty() {
                None
            } else {
                cleaned.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use super::*;

    fn complete_result() -> BTreeMap<String, Value> {
        let mut result = BTreeMap::new();
        result.insert("vendor_name".to_string(), serde_json::json!("Acme Corp"));
        result.insert("invoice_no".to_string(), serde_json::json!("INV-001"));
        result.insert("invoice_date".to_string(), serde_json::json!("2026-01-15"));
        result.insert("total".to_string(), serde_json::json!(108.0));
        result.insert("currency".to_string(), serde_json::json!("USD"));
        result.insert("subtotal".to_string(), serde_json::json!(100.0));
        result.insert("tax".to_string(), serde_json::json!(8.0));
        result
    }

    #[test]
    fn complete_result_with_high_confidence_has_no_issues() {
        let issues = validate_extraction_result(&complete_result(), 0.95, 0.95, 0.6, 0.6);
        assert!(issues.is_empty());
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let mut result = complete_result();
        result.remove("vendor_name");
        let issues = validate_extraction_result(&result, 0.95, 0.95, 0.6, 0.6);
        assert_eq!(issues[0].code, "MISSING_REQUIRED_FIELDS");
        assert!(matches!(issues[0].severity, IssueSeverity::Error));
    }

    #[test]
    fn total_mismatch_is_a_warning() {
        let mut result = complete_result();
        result.insert("total".to_string(), serde_json::json!(999.0));
        let issues = validate_extraction_result(&result, 0.95, 0.95, 0.6, 0.6);
        assert!(issues
            .iter()
            .any(|i| i.code == "TOTAL_MISMATCH" && matches!(i.severity, IssueSeverity::Warning)));
    }

    #[test]
    fn low_confidences_each_raise_their_own_issue() {
        let issues = validate_extraction_result(&complete_result(), 0.1, 0.2, 0.6, 0.6);
        assert!(issues.iter().any(|i| i.code == "LOW_EXTRACTION_CONFIDENCE"));
        assert!(issues.iter().any(|i| i.code == "LOW_OCR_CONFIDENCE"));
    }
}
