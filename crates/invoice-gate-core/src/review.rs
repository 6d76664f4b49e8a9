// crates/invoice-gate-core/src/review.rs
// ============================================================================
// Module: Invoice Gate Review Policy
// Description: Five-gate deterministic review decision over extracted
//              invoice fields.
// Purpose: Decide AUTO_APPROVED vs NEEDS_REVIEW and derive the final run
//          status from that decision plus validation issues.
// Dependencies: crate::hashing, serde, serde_json
// ============================================================================

//! ## Overview
//! [`evaluate_review_decision`] runs five independent gates over an
//! extraction result and its validation issues, in a fixed order, and
//! accumulates reason codes rather than short-circuiting on the first
//! failure — every gate always runs so the decision log reflects the full
//! picture. [`status_from_decision`] then folds that decision together with
//! validation issue severities into the run's final status.
//!
//! The field-definition catalog below stands in for the external
//! `Metrics_Definitions.yaml` catalog consumed by the system this crate
//! replaces; see `DESIGN.md` for the sourcing decision.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::hashing::HashAlgorithm;
use crate::hashing::hash_sorted_json;

/// Expected scalar type of a field, used for `Gate 1`/`Gate 2` validity
/// checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// A monetary or plain numeric value.
    Money,
    /// An ISO `YYYY-MM-DD` date.
    Date,
    /// A non-empty string.
    Str,
}

/// Definition of a single invoice field the review policy gates against.
#[derive(Debug, Clone)]
pub struct FieldDefinition {
    /// Canonical metrics-catalog name, e.g. `"invoice_number"`.
    pub name: &'static str,
    /// Key this field is read under in the extraction result, e.g.
    /// `"invoice_no"`.
    pub result_key: &'static str,
    /// Whether the field must be present and valid for Gate 1 to pass.
    pub required: bool,
    /// Whether the field is subject to Gate 2/Gate 3 critical-field checks.
    pub critical: bool,
    /// Whether a critical field additionally requires evidence for Gate 3.
    pub evidence_required: bool,
    /// Expected scalar type, if validity is type-checked.
    pub field_type: Option<FieldType>,
}

/// Returns the built-in field-definition catalog. See `DESIGN.md` for why
/// this is a static table rather than a loaded document.
#[must_use]
pub fn field_catalog() -> Vec<FieldDefinition> {
    vec![
        FieldDefinition {
            name: "invoice_number",
            result_key: "invoice_no",
            required: true,
            critical: true,
            evidence_required: true,
            field_type: Some(FieldType::Str),
        },
        FieldDefinition {
            name: "invoice_date",
            result_key: "invoice_date",
            required: true,
            critical: true,
            evidence_required: true,
            field_type: Some(FieldType::Date),
        },
        FieldDefinition {
            name: "vendor_name",
            result_key: "vendor_name",
            required: true,
            critical: true,
            evidence_required: true,
            field_type: Some(FieldType::Str),
        },
        FieldDefinition {
            name: "vendor_tax_id",
            result_key: "vendor_tax_id",
            required: false,
            critical: false,
            evidence_required: false,
            field_type: Some(FieldType::Str),
        },
        FieldDefinition {
            name: "currency",
            result_key: "currency",
            required: true,
            critical: true,
            evidence_required: false,
            field_type: Some(FieldType::Str),
        },
        FieldDefinition {
            name: "subtotal_amount",
            result_key: "subtotal",
            required: true,
            critical: true,
            evidence_required: true,
            field_type: Some(FieldType::Money),
        },
        FieldDefinition {
            name: "tax_amount",
            result_key: "tax",
            required: false,
            critical: true,
            evidence_required: true,
            field_type: Some(FieldType::Money),
        },
        FieldDefinition {
            name: "total_amount",
            result_key: "total",
            required: true,
            critical: true,
            evidence_required: true,
            field_type: Some(FieldType::Money),
        },
        FieldDefinition {
            name: "due_date",
            result_key: "due_date",
            required: false,
            critical: false,
            evidence_required: false,
            field_type: Some(FieldType::Date),
        },
        FieldDefinition {
            name: "payment_terms",
            result_key: "payment_terms",
            required: false,
            critical: false,
            evidence_required: false,
            field_type: Some(FieldType::Str),
        },
    ]
}

/// Configurable thresholds the review policy gates against.
#[derive(Debug, Clone)]
pub struct ReviewThresholds {
    /// Minimum fraction of required fields that must be present and valid.
    pub required_field_coverage_threshold: f64,
    /// Minimum fraction of evidence-required critical fields that must have
    /// evidence.
    pub evidence_coverage_threshold: f64,
    /// Minimum combined OCR/extraction uncertainty that triggers escalation
    /// on a low-quality document.
    pub uncertainty_threshold: f64,
    /// Maximum acceptable document risk score before Gate 5 fails.
    pub risk_threshold: f64,
}

/// A single issue recorded by an upstream validation pass (distinct from
/// the review policy's own Gate 4 consistency check).
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Stable issue code, e.g. `"TOTAL_MISMATCH"`.
    pub code: String,
    /// Severity of the issue.
    pub severity: IssueSeverity,
}

/// Severity of a [`ValidationIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Non-blocking; contributes to a `WARN` run status.
    Warning,
    /// Blocking.
    Error,
}

/// The policy's binary decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    /// No gate raised a reason code.
    AutoApproved,
    /// At least one gate raised a reason code; a human must review.
    NeedsReview,
}

/// Per-gate pass/fail detail recorded in the decision log.
#[derive(Debug, Clone, Serialize)]
pub struct GateResult {
    /// Whether this gate passed.
    pub passed: bool,
    /// Arbitrary gate-specific detail fields.
    pub detail: BTreeMap<String, Value>,
}

/// Full output of [`evaluate_review_decision`].
#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    /// The binary decision.
    pub decision: ReviewDecision,
    /// Accumulated, order-preserving deduplicated reason codes.
    pub reason_codes: Vec<String>,
    /// Hash and signal snapshot of the inputs this decision was computed
    /// from, for replay verification.
    pub inputs_snapshot: InputsSnapshot,
    /// Per-gate pass/fail detail.
    pub gate_results: BTreeMap<String, GateResult>,
}

/// Hash-stamped snapshot of the signals a review decision was computed
/// from.
#[derive(Debug, Clone, Serialize)]
pub struct InputsSnapshot {
    /// SHA-256 hash of the sorted-key JSON encoding of `signals`.
    pub hash_sha256: String,
    /// The signal values themselves.
    pub signals: BTreeMap<String, Value>,
}

/// Evaluates the five review gates over an extraction `result` and its
/// upstream `issues`.
///
/// # Invariants
/// - All five gates always run; none short-circuits the others.
/// - `reason_codes` preserves first-seen order and contains no duplicates.
#[must_use]
pub fn evaluate_review_decision(
    result: &BTreeMap<String, Value>,
    issues: &[ValidationIssue],
    extraction_confidence: f64,
    ocr_confidence: f64,
    quality_tier: Option<&str>,
    quality_score: Option<f64>,
    thresholds: &ReviewThresholds,
    allowed_currencies: &[String],
) -> ReviewOutcome {
    let fields = field_catalog();
    let mut reason_codes: Vec<String> = Vec::new();
    let mut gate_results: BTreeMap<String, GateResult> = BTreeMap::new();

    // Gate 1: required fields present and valid.
    let mut required_missing = Vec::new();
    let mut required_invalid = Vec::new();
    for field in &fields {
        if !field.required {
            continue;
        }
        match result.get(field.result_key) {
            None => required_missing.push(field.result_key.to_string()),
            Some(value) if is_blank(value) => required_missing.push(field.result_key.to_string()),
            Some(value) => {
                if !is_value_valid(value, field.field_type) {
                    required_invalid.push(field.result_key.to_string());
                }
            }
        }
    }
    let gate1_pass = required_missing.is_empty() && required_invalid.is_empty();
    gate_results.insert(
        "required_fields".to_string(),
        GateResult {
            passed: gate1_pass,
            detail: BTreeMap::from([
                ("missing".to_string(), serde_json::json!(required_missing)),
                ("invalid".to_string(), serde_json::json!(required_invalid)),
            ]),
        },
    );
    if !required_missing.is_empty() {
        reason_codes.push("REQ_FIELD_MISSING".to_string());
    }
    if !required_invalid.is_empty() {
        reason_codes.push("REQ_FIELD_INVALID".to_string());
    }

    // Gate 2: critical field parseability and upstream mismatch issues.
    let mut critical_parse_fail = Vec::new();
    for field in &fields {
        if !field.critical {
            continue;
        }
        if let Some(value) = result.get(field.result_key) {
            if !is_blank(value) && !is_value_valid(value, field.field_type) {
                critical_parse_fail.push(field.result_key.to_string());
            }
        }
    }
    let critical_mismatch: Vec<&str> = issues
        .iter()
        .filter(|issue| issue.code == "MISSING_REQUIRED_FIELDS" || issue.code == "TOTAL_MISMATCH")
        .map(|issue| issue.code.as_str())
        .collect();
    let gate2_pass = critical_parse_fail.is_empty() && critical_mismatch.is_empty();
    gate_results.insert(
        "critical_fields".to_string(),
        GateResult {
            passed: gate2_pass,
            detail: BTreeMap::from([
                ("parse_fail_fields".to_string(), serde_json::json!(critical_parse_fail)),
                ("mismatch_issue_codes".to_string(), serde_json::json!(critical_mismatch)),
            ]),
        },
    );
    if !critical_parse_fail.is_empty() {
        reason_codes.push("CRIT_FIELD_PARSE_FAIL".to_string());
    }
    if !critical_mismatch.is_empty() {
        reason_codes.push("CRIT_FIELD_MISMATCH".to_string());
    }

    // Gate 3: evidence coverage on evidence-required critical fields.
    let field_evidence: BTreeMap<String, Value> = result
        .get("field_evidence")
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let evidence_required: Vec<&str> = fields
        .iter()
        .filter(|field| field.critical && field.evidence_required)
        .map(|field| field.result_key)
        .collect();
    let evidence_present = evidence_required
        .iter()
        .filter(|key| {
            field_evidence
                .get(**key)
                .map(|value| !is_blank(value))
                .unwrap_or(false)
        })
        .count();
    let evidence_coverage = if evidence_required.is_empty() {
        1.0
    } else {
        evidence_present as f64 / evidence_required.len() as f64
    };
    let gate3_pass = evidence_coverage >= thresholds.evidence_coverage_threshold;
    gate_results.insert(
        "evidence_coverage".to_string(),
        GateResult {
            passed: gate3_pass,
            detail: BTreeMap::from([
                ("required_fields".to_string(), serde_json::json!(evidence_required)),
                ("covered_fields".to_string(), serde_json::json!(evidence_present)),
                ("coverage".to_string(), serde_json::json!(round4(evidence_coverage))),
            ]),
        },
    );
    if !evidence_required.is_empty() && evidence_present == 0 {
        reason_codes.push("EVIDENCE_MISSING".to_string());
    }
    if !gate3_pass {
        reason_codes.push("EVIDENCE_INSUFFICIENT".to_string());
    }

    // Gate 4: consistency rules.
    let hard_fail = hard_consistency_failed(result, allowed_currencies);
    let soft_fail = issues.iter().any(|issue| issue.severity == IssueSeverity::Warning);
    gate_results.insert(
        "consistency".to_string(),
        GateResult {
            passed: !hard_fail && !soft_fail,
            detail: BTreeMap::from([
                ("hard_fail".to_string(), serde_json::json!(hard_fail)),
                ("soft_fail".to_string(), serde_json::json!(soft_fail)),
            ]),
        },
    );
    if hard_fail {
        reason_codes.push("CONSISTENCY_HARD_FAIL".to_string());
    } else if soft_fail {
        reason_codes.push("CONSISTENCY_SOFT_FAIL".to_string());
    }

    // Gate 5: low-quality escalation.
    let quality_tier_value = quality_tier.unwrap_or("MEDIUM").to_uppercase();
    let uncertainty = 1.0 - extraction_confidence.min(ocr_confidence);
    let risk_doc = (1.0 - extraction_confidence).max(1.0 - ocr_confidence);
    let low_quality_escalation =
        quality_tier_value == "LOW" && uncertainty >= thresholds.uncertainty_threshold;
    let risk_exceeded = risk_doc > thresholds.risk_threshold;
    gate_results.insert(
        "quality_escalation".to_string(),
        GateResult {
            passed: !low_quality_escalation && !risk_exceeded,
            detail: BTreeMap::from([
                ("quality_tier".to_string(), serde_json::json!(quality_tier_value)),
                ("quality_score".to_string(), serde_json::json!(quality_score)),
                ("uncertainty".to_string(), serde_json::json!(round4(uncertainty))),
                ("risk_doc".to_string(), serde_json::json!(round4(risk_doc))),
            ]),
        },
    );
    if low_quality_escalation {
        reason_codes.push("LOW_QUALITY_INPUT".to_string());
        reason_codes.push("HIGH_UNCERTAINTY".to_string());
    }
    if risk_exceeded {
        reason_codes.push("RISK_THRESHOLD_EXCEEDED".to_string());
    }

    let decision = if reason_codes.is_empty() {
        ReviewDecision::AutoApproved
    } else {
        ReviewDecision::NeedsReview
    };
    let reason_codes = dedupe_in_order(reason_codes);
    let inputs_snapshot = make_inputs_snapshot(
        result,
        extraction_confidence,
        ocr_confidence,
        &quality_tier_value,
        quality_score,
    );

    ReviewOutcome {
        decision,
        reason_codes,
        inputs_snapshot,
        gate_results,
    }
}

/// Derives the run's final status from the review decision and upstream
/// validation issue severities.
#[must_use]
pub fn status_from_decision(decision: ReviewDecision, issues: &[ValidationIssue]) -> &'static str {
    if decision == ReviewDecision::NeedsReview {
        return "NEEDS_REVIEW";
    }
    if issues.iter().any(|issue| issue.severity == IssueSeverity::Warning) {
        return "WARN";
    }
    "SUCCESS"
}

fn hard_consistency_failed(result: &BTreeMap<String, Value>, allowed_currencies: &[String]) -> bool {
    let subtotal = result.get("subtotal").and_then(to_float);
    let tax = result.get("tax").and_then(to_float);
    let total = result.get("total").and_then(to_float);
    let currency = result
        .get("currency")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_uppercase();

    if !currency.is_empty() && !allowed_currencies.iter().any(|c| c == &currency) {
        return true;
    }
    let (Some(subtotal), Some(tax), Some(total)) = (subtotal, tax, total) else {
        return false;
    };
    ((subtotal + tax) - total).abs() > 0.02
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
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

fn is_value_valid(value: &Value, expected_type: Option<FieldType>) -> bool {
    match expected_type {
        None => true,
        Some(FieldType::Money) => to_float(value).is_some(),
        Some(FieldType::Date) => is_valid_date(value),
        Some(FieldType::Str) => !is_blank(value),
    }
}

fn is_valid_date(value: &Value) -> bool {
    let Some(text) = value.as_str() else { return false };
    let text = text.trim();
    if text.len() != 10 {
        return false;
    }
    let parts: Vec<&str> = text.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let (Ok(year), Ok(month), Ok(day)) = (
        parts[0].parse::<i32>(),
        parts[1].parse::<u32>(),
        parts[2].parse::<u32>(),
    ) else {
        return false;
    };
    (1900..=2100).contains(&year) && (1..=12).contains(&month) && (1..=31).contains(&day)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn dedupe_in_order(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        if seen.insert(value.clone()) {
            out.push(value);
        }
    }
    out
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn make_inputs_snapshot(
    result: &BTreeMap<String, Value>,
    extraction_confidence: f64,
    ocr_confidence: f64,
    quality_tier: &str,
    quality_score: Option<f64>,
) -> InputsSnapshot {
    let mut signals = BTreeMap::new();
    signals.insert(
        "invoice_no".to_string(),
        result.get("invoice_no").cloned().unwrap_or(Value::Null),
    );
    signals.insert(
        "invoice_date".to_string(),
        result.get("invoice_date").cloned().unwrap_or(Value::Null),
    );
    signals.insert(
        "vendor_name".to_string(),
        result.get("vendor_name").cloned().unwrap_or(Value::Null),
    );
    signals.insert(
        "currency".to_string(),
        result.get("currency").cloned().unwrap_or(Value::Null),
    );
    signals.insert("total".to_string(), result.get("total").cloned().unwrap_or(Value::Null));
    signals.insert(
        "extraction_confidence".to_string(),
        serde_json::json!(round4(extraction_confidence)),
    );
    signals.insert("ocr_confidence".to_string(), serde_json::json!(round4(ocr_confidence)));
    signals.insert("quality_tier".to_string(), serde_json::json!(quality_tier));
    signals.insert(
        "quality_score".to_string(),
        serde_json::json!(quality_score.map(round4)),
    );

    let hash = hash_sorted_json(HashAlgorithm::Sha256, &signals)
        .map(|digest| digest.value)
        .unwrap_or_default();
    InputsSnapshot {
        hash_sha256: hash,
        signals,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use super::*;

    fn sample_result() -> BTreeMap<String, Value> {
        let mut result = BTreeMap::new();
        result.insert("invoice_no".to_string(), serde_json::json!("INV-001"));
        result.insert("invoice_date".to_string(), serde_json::json!("2026-01-15"));
        result.insert("vendor_name".to_string(), serde_json::json!("Acme Corp"));
        result.insert("currency".to_string(), serde_json::json!("USD"));
        result.insert("subtotal".to_string(), serde_json::json!(100.0));
        result.insert("tax".to_string(), serde_json::json!(8.0));
        result.insert("total".to_string(), serde_json::json!(108.0));
        result.insert(
            "field_evidence".to_string(),
            serde_json::json!({
                "invoice_no": "found on line 1",
                "invoice_date": "found on line 2",
                "vendor_name": "found on header",
                "subtotal": "found in table",
                "total": "found in table",
            }),
        );
        result
    }

    fn thresholds() -> ReviewThresholds {
        ReviewThresholds {
            required_field_coverage_threshold: 1.0,
            evidence_coverage_threshold: 0.8,
            uncertainty_threshold: 0.3,
            risk_threshold: 0.4,
        }
    }

    #[test]
    fn clean_result_is_auto_approved() {
        let outcome = evaluate_review_decision(
            &sample_result(),
            &[],
            0.95,
            0.95,
            Some("HIGH"),
            Some(0.9),
            &thresholds(),
            &["USD".to_string(), "EUR".to_string()],
        );
        assert_eq!(outcome.decision, ReviewDecision::AutoApproved);
        assert!(outcome.reason_codes.is_empty());
    }

    #[test]
    fn missing_vendor_name_triggers_req_field_missing() {
        let mut result = sample_result();
        result.remove("vendor_name");
        let outcome = evaluate_review_decision(
            &result,
            &[],
            0.95,
            0.95,
            Some("HIGH"),
            Some(0.9),
            &thresholds(),
            &["USD".to_string()],
        );
        assert_eq!(outcome.decision, ReviewDecision::NeedsReview);
        assert!(outcome.reason_codes.contains(&"REQ_FIELD_MISSING".to_string()));
    }

    #[test]
    fn total_mismatch_triggers_hard_consistency_failure() {
        let mut result = sample_result();
        result.insert("total".to_string(), serde_json::json!(999.0));
        let outcome = evaluate_review_decision(
            &result,
            &[],
            0.95,
            0.95,
            Some("HIGH"),
            Some(0.9),
            &thresholds(),
            &["USD".to_string()],
        );
        assert!(outcome.reason_codes.contains(&"CONSISTENCY_HARD_FAIL".to_string()));
    }

    #[test]
    fn low_quality_and_low_confidence_escalates() {
        let outcome = evaluate_review_decision(
            &sample_result(),
            &[],
            0.4,
            0.4,
            Some("LOW"),
            Some(0.2),
            &thresholds(),
            &["USD".to_string()],
        );
        assert!(outcome.reason_codes.contains(&"LOW_QUALITY_INPUT".to_string()));
        assert!(outcome.reason_codes.contains(&"HIGH_UNCERTAINTY".to_string()));
    }

    #[test]
    fn status_from_decision_prefers_needs_review() {
        let issues = vec![ValidationIssue {
            code: "TOTAL_MISMATCH".to_string(),
            severity: IssueSeverity::Warning,
        }];
        assert_eq!(
            status_from_decision(ReviewDecision::NeedsReview, &issues),
            "NEEDS_REVIEW"
        );
        assert_eq!(status_from_decision(ReviewDecision::AutoApproved, &issues), "WARN");
        assert_eq!(status_from_decision(ReviewDecision::AutoApproved, &[]), "SUCCESS");
    }

    #[test]
    fn inputs_snapshot_hash_is_stable_under_key_order() {
        let outcome_a = evaluate_review_decision(
            &sample_result(),
            &[],
            0.95,
            0.95,
            Some("HIGH"),
            Some(0.9),
            &thresholds(),
            &["USD".to_string()],
        );
        let outcome_b = evaluate_review_decision(
            &sample_result(),
            &[],
            0.95,
            0.95,
            Some("HIGH"),
            Some(0.9),
            &thresholds(),
            &["USD".to_string()],
        );
        assert_eq!(
            outcome_a.inputs_snapshot.hash_sha256,
            outcome_b.inputs_snapshot.hash_sha256
        );
    }
}
