// crates/invoice-gate-providers/src/extraction.rs
// ============================================================================
// Module: Heuristic Extraction Provider
// Description: `ExtractionProvider` implementing the original system's
//              keyword/pattern heuristic lane, plus its model router.
// Purpose: Produce structured invoice fields without a real LLM dependency.
// Dependencies: invoice_gate_core::{hashing, interfaces, validation}, time
// ============================================================================

//! ## Overview
//! Grounded in `original_source/app/services/extraction.py`'s
//! `_heuristic_extract` lane and `services/model_router.py`'s
//! `select_model_for_extraction` — the `invoice2data`-backed template lane
//! is out of scope (see `DESIGN.md`: it depends on an external Python
//! library with no Rust equivalent in this workspace). Field parsing is
//! hand-rolled string scanning rather than a regex port: the retrieval pack
//! carries no regex dependency anywhere, so this stays aligned with the
//! corpus rather than introducing one.
//!
//! One signature-driven simplification: [`invoice_gate_core::interfaces::ExtractionProvider::run_extraction`]
//! receives OCR text and language only, not a source filename or OCR
//! confidence. Where the original seeds its invoice-number fallback from the
//! filename and blends OCR confidence into its confidence estimate, this
//! provider seeds the fallback id from a hash of the OCR text and assumes a
//! fixed baseline OCR quality for the confidence blend.

use std::collections::BTreeMap;

use invoice_gate_core::hashing::hash_bytes;
use invoice_gate_core::hashing::DEFAULT_HASH_ALGORITHM;
use invoice_gate_core::interfaces::ExtractionError;
use invoice_gate_core::interfaces::ExtractionProvider;
use invoice_gate_core::interfaces::ExtractionResult;
use invoice_gate_core::validation::REQUIRED_FIELDS;
use serde_json::Value;
use time::OffsetDateTime;

/// Length, in hex characters, of the digest folded into a synthesized
/// invoice number.
const STABLE_ID_DIGEST_LENGTH: usize = 8;
/// Assumed OCR confidence baseline blended into the extraction confidence
/// estimate, since `run_extraction` is not handed a real OCR confidence.
const ASSUMED_OCR_CONFIDENCE: f64 = 0.75;
/// Floor applied to the extraction confidence estimate.
const CONFIDENCE_FLOOR: f64 = 0.2;
/// Ceiling applied to the extraction confidence estimate.
const CONFIDENCE_CEILING: f64 = 0.97;
/// Snippet length used as evidence for each populated field.
const EVIDENCE_SNIPPET_LENGTH: usize = 240;

/// Selects a model name for structured extraction given language and table
/// hints, matching `select_model_for_extraction`'s routing table.
#[must_use]
pub fn select_model_for_extraction(language: &str, has_tables: bool) -> &'static str {
    if language == "fa" {
        if has_tables { "qwen2.5-7b-instruct" } else { "gemma-3-4b-persian" }
    } else {
        "qwen2.5-7b-instruct"
    }
}

/// A heuristic [`ExtractionProvider`] built from keyword/pattern scanning
/// over OCR text, standing in for the original's LLM + template lanes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractionProvider;

impl ExtractionProvider for HeuristicExtractionProvider {
    fn run_extraction(&self, ocr_text: &str, language: &str) -> Result<ExtractionResult, ExtractionError> {
        let has_tables = has_table_hints(ocr_text);
        let model_name = select_model_for_extraction(language, has_tables).to_string();

        let vendor_name = extract_vendor_from_text(ocr_text).unwrap_or_else(|| default_vendor(language));
        let invoice_no = extract_invoice_no(ocr_text).unwrap_or_else(|| stable_invoice_id(ocr_text));
        let invoice_date = extract_date_from_text(ocr_text).unwrap_or_else(today_as_iso_date);
        let currency = if language == "fa" { "IRR" } else { "USD" }.to_string();

        let subtotal = extract_number_by_keywords(ocr_text, &["subtotal", "sub total", "جمع جزء", "جمع"])
            .unwrap_or(if language == "fa" { 100_000.0 } else { 100.0 });
        let tax = extract_number_by_keywords(ocr_text, &["tax", "vat", "مالیات"])
            .unwrap_or_else(|| round2(subtotal * if language == "fa" { 0.09 } else { 0.08 }));
        let total =
            extract_number_by_keywords(ocr_text, &["total", "amount due", "grand total", "جمع کل", "قابل پرداخت"])
                .unwrap_or(subtotal + tax);

        let mut fields = BTreeMap::new();
        fields.insert("schema_version".to_string(), Value::String("invoice_v1".to_string()));
        fields.insert("vendor_name".to_string(), Value::String(vendor_name));
        fields.insert("invoice_no".to_string(), Value::String(invoice_no));
        fields.insert("invoice_date".to_string(), Value::String(invoice_date));
        fields.insert("subtotal".to_string(), serde_json::json!(round2(subtotal)));
        fields.insert("tax".to_string(), serde_json::json!(round2(tax)));
        fields.insert("total".to_string(), serde_json::json!(round2(total)));
        fields.insert("currency".to_string(), Value::String(currency));

        let confidence = estimate_extraction_confidence(&fields);
        let field_evidence = build_field_evidence(&fields, ocr_text);

        Ok(ExtractionResult {
            fields,
            field_evidence,
            confidence,
            model_name,
            route_name: "ocr_llm_pipeline".to_string(),
        })
    }
}

/// Fraction of [`REQUIRED_FIELDS`] present and non-empty in `fields`.
fn required_field_coverage(fields: &BTreeMap<String, Value>) -> f64 {
    if REQUIRED_FIELDS.is_empty() {
        return 1.0;
    }
    let present = REQUIRED_FIELDS
        .iter()
        .filter(|key| {
            fields
                .get(**key)
                .is_some_and(|value| !matches!(value, Value::Null) && value.as_str() != Some(""))
        })
        .count();
    #[allow(clippy::cast_precision_loss, reason = "field counts are small and exact below f64's integer precision limit")]
    let coverage = present as f64 / REQUIRED_FIELDS.len() as f64;
    coverage
}

/// Blends required-field coverage with an assumed OCR confidence baseline,
/// matching `_estimate_extraction_confidence`'s weighting.
fn estimate_extraction_confidence(fields: &BTreeMap<String, Value>) -> f64 {
    let coverage = required_field_coverage(fields);
    let blended = ASSUMED_OCR_CONFIDENCE.clamp(0.0, 1.0) * 0.55 + coverage * 0.45;
    blended.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

/// Builds a snippet-of-OCR-text evidence map for every populated field that
/// the review policy's evidence gate cares about.
fn build_field_evidence(fields: &BTreeMap<String, Value>, ocr_text: &str) -> BTreeMap<String, String> {
    let snippet: String = ocr_text.chars().take(EVIDENCE_SNIPPET_LENGTH).collect();
    let tracked = ["invoice_no", "invoice_date", "vendor_name", "currency", "total", "subtotal", "tax"];
    tracked
        .into_iter()
        .filter_map(|key| {
            let present = fields.get(key).is_some_and(|value| !matches!(value, Value::Null));
            present.then(|| (key.to_string(), snippet.clone()))
        })
        .collect()
}

/// Returns today's UTC date as an `YYYY-MM-DD` string, the same fallback the
/// original uses when no date can be parsed from the document.
fn today_as_iso_date() -> String {
    let date = OffsetDateTime::now_utc().date();
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Rounds to two decimal places, matching the original's `round(x, 2)`.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Returns `"نمونه فروشگاه"` for Persian documents, `"Sample Vendor"` otherwise.
fn default_vendor(language: &str) -> String {
    if language == "fa" { "نمونه فروشگاه".to_string() } else { "Sample Vendor".to_string() }
}

/// Synthesizes a stable invoice number from a content hash, the fallback
/// used when no invoice number can be parsed from the text.
fn stable_invoice_id(seed: &str) -> String {
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, seed.as_bytes());
    let short: String = digest.value.chars().take(STABLE_ID_DIGEST_LENGTH).collect();
    format!("INV-{}", short.to_uppercase())
}

/// Returns the first non-keyword, non-trivial line of text as a vendor name
/// guess, matching `_extract_vendor_from_text`.
fn extract_vendor_from_text(text: &str) -> Option<String> {
    const SKIP_KEYWORDS: [&str; 6] = ["invoice", "inv", "date", "total", "tax", "subtotal"];
    for line in text.lines() {
        let clean = line.trim();
        if clean.is_empty() {
            continue;
        }
        let lower = clean.to_lowercase();
        if SKIP_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
            continue;
        }
        if clean.chars().count() < 3 {
            continue;
        }
        return Some(clean.chars().take(120).collect());
    }
    None
}

/// Finds an invoice-number-shaped token following an "invoice"/"inv" keyword
/// on some line, matching `_extract_invoice_no`'s intent without a regex.
fn extract_invoice_no(text: &str) -> Option<String> {
    for line in text.lines() {
        let lower = line.to_lowercase();
        if !(lower.contains("invoice") || lower.contains("inv")) {
            continue;
        }
        for word in line.split_whitespace() {
            let trimmed = word.trim_matches(|ch: char| !ch.is_ascii_alphanumeric());
            if trimmed.len() < 2 {
                continue;
            }
            let lower_word = trimmed.to_lowercase();
            if lower_word == "invoice" || lower_word == "inv" || lower_word == "no" || lower_word == "number" {
                continue;
            }
            if trimmed.chars().any(|ch| ch.is_ascii_digit()) {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Scans for a `YYYY-MM-DD`/`DD-MM-YYYY`-shaped token and normalizes it,
/// matching `_extract_date_from_text` plus `_normalize_date`.
fn extract_date_from_text(text: &str) -> Option<String> {
    for word in text.split_whitespace() {
        let candidate: String = word
            .chars()
            .filter(|ch| ch.is_ascii_digit() || *ch == '-' || *ch == '/')
            .collect();
        if let Some(normalized) = normalize_date(&candidate) {
            return Some(normalized);
        }
    }
    None
}

/// Normalizes a `-`/`/`-separated three-part date into `YYYY-MM-DD`,
/// treating a first component over 1900 as a year, otherwise as a day.
fn normalize_date(candidate: &str) -> Option<String> {
    let normalized = candidate.replace('/', "-");
    let parts: Vec<&str> = normalized.split('-').filter(|part| !part.is_empty()).collect();
    if parts.len() != 3 {
        return None;
    }
    let p0 = parts[0].parse::<i32>().ok()?;
    let p1 = parts[1].parse::<i32>().ok()?;
    let p2 = parts[2].parse::<i32>().ok()?;

    let (year, month, day) = if p0 > 1900 {
        (p0, p1, p2)
    } else {
        let year = if p2 < 100 { 2000 + p2 } else { p2 };
        (year, p1, p0)
    };

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(format!("{year:04}-{month:02}-{day:02}"))
}

/// Finds the last numeric token on a line mentioning one of `keywords`,
/// matching `_extract_number_by_keywords`.
fn extract_number_by_keywords(text: &str, keywords: &[&str]) -> Option<f64> {
    for line in text.lines() {
        let lower = line.to_lowercase();
        if !keywords.iter().any(|keyword| lower.contains(keyword)) {
            continue;
        }
        let mut last_match = None;
        for word in line.split_whitespace() {
            if let Some(number) = parse_number(word) {
                last_match = Some(number);
            }
        }
        if last_match.is_some() {
            return last_match;
        }
    }
    None
}

/// Parses a loosely-formatted number, stripping thousands separators,
/// matching `_to_number`.
fn parse_number(word: &str) -> Option<f64> {
    let cleaned: String = word.chars().filter(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-' | '+' | ',')).collect();
    if cleaned.is_empty() || !cleaned.chars().any(|ch| ch.is_ascii_digit()) {
        return None;
    }
    cleaned.replace(',', "").parse::<f64>().ok()
}

/// Returns whether the text or filename hints at a tabular/line-item layout,
/// matching `_has_table_hints` (the filename half is dropped since this
/// provider only sees OCR text).
fn has_table_hints(text: &str) -> bool {
    const HINTS: [&str; 7] = ["qty", "quantity", "unit price", "line item", "item", "table", "rows"];
    let lower = text.to_lowercase();
    HINTS.iter().any(|hint| lower.contains(hint))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use super::*;

    #[test]
    fn model_routing_matches_the_original_table() {
        assert_eq!(select_model_for_extraction("fa", true), "qwen2.5-7b-instruct");
        assert_eq!(select_model_for_extraction("fa", false), "gemma-3-4b-persian");
        assert_eq!(select_model_for_extraction("en", false), "qwen2.5-7b-instruct");
    }

    #[test]
    fn extracts_vendor_invoice_number_and_amounts() {
        let provider = HeuristicExtractionProvider;
        let text = "Acme Supplies Co\nInvoice No: INV-4471\nDate: 2026-03-14\nSubtotal: 200.00\nTax: 16.00\nTotal: 216.00";
        let result = provider.run_extraction(text, "en").unwrap();
        assert_eq!(result.fields.get("vendor_name").unwrap(), "Acme Supplies Co");
        assert_eq!(result.fields.get("invoice_no").unwrap(), "INV-4471");
        assert_eq!(result.fields.get("invoice_date").unwrap(), "2026-03-14");
        assert_eq!(result.fields.get("total").unwrap(), &serde_json::json!(216.0));
        assert_eq!(result.model_name, "qwen2.5-7b-instruct");
    }

    #[test]
    fn falls_back_to_synthesized_fields_when_text_is_sparse() {
        let provider = HeuristicExtractionProvider;
        let result = provider.run_extraction("", "fa").unwrap();
        assert_eq!(result.fields.get("currency").unwrap(), "IRR");
        assert!(result.fields.get("invoice_no").unwrap().as_str().unwrap().starts_with("INV-"));
        assert_eq!(result.model_name, "gemma-3-4b-persian");
    }

    #[test]
    fn date_normalization_prefers_year_first_when_large() {
        assert_eq!(normalize_date("2026-03-14"), Some("2026-03-14".to_string()));
        assert_eq!(normalize_date("14-03-26"), Some("2026-03-14".to_string()));
        assert_eq!(normalize_date("99-99-2026"), None);
    }

    #[test]
    fn number_parsing_strips_thousands_separators() {
        assert_eq!(parse_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_number("no-digits"), None);
    }
}
