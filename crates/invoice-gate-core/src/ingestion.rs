// crates/invoice-gate-core/src/ingestion.rs
// ============================================================================
// Module: Invoice Gate Ingestion Contract
// Description: Stage A-D upload quality gating: mime/size, structural parse,
//              quality scoring, and schema fitness.
// Purpose: Decide ACCEPT/QUARANTINE/REJECT for an uploaded document before
//          any run is ever created against it.
// Dependencies: sha2, zip
// ============================================================================

//! ## Overview
//! The ingestion contract runs once per uploaded document, before a
//! [`crate::entities::Run`] exists. It is pure: given the same bytes,
//! filename, content type, and [`IngestionLimits`], it always returns the
//! same [`IngestionContractResult`]. Four stages run in order and the first
//! to produce a non-`ACCEPT` result short-circuits the rest:
//!
//! - **Stage A** — mime allow-list, size floor/ceiling.
//! - **Stage B** — structural parse (PDF header/encryption/page count, image
//!   magic bytes, XLSX zip structure).
//! - **Stage C** — quality scoring and resolution checks.
//! - **Stage D** is reserved for schema fitness checks on structured
//!   uploads; no content type in this system currently exercises it.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

/// Final disposition of an ingestion contract evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestionDecision {
    /// The document may proceed to have runs created against it.
    Accept,
    /// The document is held for review; it failed a recoverable gate.
    Quarantine,
    /// The document is refused outright; it failed a hard gate.
    Reject,
}

impl IngestionDecision {
    /// Maps the ingestion decision to the [`crate::entities::IngestionStatus`]
    /// a [`crate::entities::Document`] should be persisted with.
    #[must_use]
    pub const fn document_status(self) -> crate::entities::IngestionStatus {
        match self {
            Self::Accept => crate::entities::IngestionStatus::Accepted,
            Self::Quarantine => crate::entities::IngestionStatus::Quarantined,
            Self::Reject => crate::entities::IngestionStatus::Rejected,
        }
    }
}

/// Which ingestion stage produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestionStage {
    /// Mime/size gating.
    A,
    /// Structural parse gating.
    B,
    /// Quality scoring.
    C,
    /// Schema fitness gating.
    D,
}

/// Outcome of [`evaluate_ingestion_contract`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestionContractResult {
    /// The final decision.
    pub decision: IngestionDecision,
    /// The stage that produced the decision.
    pub stage: IngestionStage,
    /// Reason codes explaining the decision; empty when accepted.
    pub reason_codes: Vec<String>,
    /// Diagnostic details recorded alongside the decision.
    pub details: BTreeMap<String, serde_json::Value>,
    /// Quality score in `[0, 1]`, set from Stage C onward.
    pub quality_score: Option<f64>,
    /// Quality tier (`HIGH`/`MEDIUM`/`LOW`), set from Stage C onward.
    pub quality_tier: Option<String>,
}

impl IngestionContractResult {
    /// Maps a quarantine decision to the quarantine item status code a
    /// [`crate::entities::QuarantineItem`] should be created with. Returns
    /// `None` when the decision was not a quarantine.
    #[must_use]
    pub fn quarantine_status(&self) -> Option<&'static str> {
        if self.decision != IngestionDecision::Quarantine {
            return None;
        }
        Some(match self.stage {
            IngestionStage::A => {
                if self
                    .reason_codes
                    .iter()
                    .any(|code| code == "SECURITY_POLICY_VIOLATION")
                {
                    "QUARANTINED_SECURITY_POLICY"
                } else {
                    "QUARANTINED_UNKNOWN"
                }
            }
            IngestionStage::B => "QUARANTINED_PARSE_FAIL",
            IngestionStage::C => "QUARANTINED_LOW_QUALITY",
            IngestionStage::D => "QUARANTINED_SCHEMA_FAIL",
        })
    }
}

/// Limits and allow-lists the ingestion contract gates against. Sourced from
/// configuration so they are tunable without a code change.
#[derive(Debug, Clone)]
pub struct IngestionLimits {
    /// Content types permitted past Stage A.
    pub allowed_mime_types: Vec<String>,
    /// Maximum accepted upload size, in bytes.
    pub max_upload_size_bytes: u64,
    /// Maximum accepted PDF page count estimate.
    pub max_pdf_pages: u64,
    /// Maximum accepted row count per XLSX worksheet.
    pub max_xlsx_rows_per_sheet: u64,
    /// Whether a low-quality (but structurally valid) document is
    /// quarantined (`true`) or merely annotated and accepted (`false`).
    pub quarantine_low_quality: bool,
}

/// Evaluates the full ingestion contract against an uploaded document.
///
/// # Invariants
/// - Returns exactly one of [`IngestionDecision::Accept`],
///   [`IngestionDecision::Quarantine`], or [`IngestionDecision::Reject`].
/// - Never panics on malformed input; malformed structure is reported as a
///   reason code, not an error.
#[must_use]
pub fn evaluate_ingestion_contract(
    payload: &[u8],
    filename: &str,
    content_type: &str,
    limits: &IngestionLimits,
) -> IngestionContractResult {
    let mut details = BTreeMap::new();
    details.insert("filename".to_string(), serde_json::json!(filename));
    details.insert("content_type".to_string(), serde_json::json!(content_type));
    details.insert("size_bytes".to_string(), serde_json::json!(payload.len()));
    details.insert(
        "content_hash".to_string(),
        serde_json::json!(content_hash(payload)),
    );
    details.insert(
        "limits".to_string(),
        serde_json::json!({
            "max_upload_size_bytes": limits.max_upload_size_bytes,
            "max_pdf_pages": limits.max_pdf_pages,
            "max_xlsx_rows_per_sheet": limits.max_xlsx_rows_per_sheet,
        }),
    );

    if let Some(result) = validate_stage_a(payload, content_type, &details, limits) {
        return result;
    }
    if let Some(result) = validate_stage_b(payload, content_type, &details, limits) {
        return result;
    }

    let (quality_score, quality_tier, quality_reasons, quality_details) =
        validate_stage_c(payload, content_type);
    for (key, value) in quality_details {
        details.insert(key, value);
    }
    details.insert("quality_score".to_string(), serde_json::json!(quality_score));
    details.insert("quality_tier".to_string(), serde_json::json!(quality_tier.clone()));

    if !quality_reasons.is_empty() && limits.quarantine_low_quality {
        return IngestionContractResult {
            decision: IngestionDecision::Quarantine,
            stage: IngestionStage::C,
            reason_codes: quality_reasons,
            details,
            quality_score: Some(quality_score),
            quality_tier: Some(quality_tier),
        };
    }
    if !quality_reasons.is_empty() {
        details.insert(
            "quality_reason_codes".to_string(),
            serde_json::json!(quality_reasons),
        );
    }

    IngestionContractResult {
        decision: IngestionDecision::Accept,
        stage: IngestionStage::C,
        reason_codes: Vec::new(),
        details,
        quality_score: Some(quality_score),
        quality_tier: Some(quality_tier),
    }
}

fn content_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn reject(
    stage: IngestionStage,
    decision: IngestionDecision,
    reason: &str,
    details: &BTreeMap<String, serde_json::Value>,
) -> IngestionContractResult {
    IngestionContractResult {
        decision,
        stage,
        reason_codes: vec![reason.to_string()],
        details: details.clone(),
        quality_score: None,
        quality_tier: None,
    }
}

fn validate_stage_a(
    payload: &[u8],
    content_type: &str,
    details: &BTreeMap<String, serde_json::Value>,
    limits: &IngestionLimits,
) -> Option<IngestionContractResult> {
    if !limits.allowed_mime_types.iter().any(|mime| mime == content_type) {
        return Some(reject(
            IngestionStage::A,
            IngestionDecision::Reject,
            "UNSUPPORTED_MIME",
            details,
        ));
    }
    if payload.len() as u64 > limits.max_upload_size_bytes {
        return Some(reject(
            IngestionStage::A,
            IngestionDecision::Quarantine,
            "FILE_TOO_LARGE",
            details,
        ));
    }
    if payload.len() < 4 {
        return Some(reject(
            IngestionStage::A,
            IngestionDecision::Quarantine,
            "FILE_CORRUPT",
            details,
        ));
    }
    None
}

const SUPPORTED_IMAGE_MAGIC: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"RIFF", "image/webp"),
];

fn validate_stage_b(
    payload: &[u8],
    content_type: &str,
    details: &BTreeMap<String, serde_json::Value>,
    limits: &IngestionLimits,
) -> Option<IngestionContractResult> {
    if content_type == "application/pdf" {
        if !payload.starts_with(b"%PDF") {
            return Some(reject(
                IngestionStage::B,
                IngestionDecision::Quarantine,
                "PDF_PARSE_FAIL",
                details,
            ));
        }
        let head = &payload[..payload.len().min(65536)];
        if contains(head, b"/Encrypt") {
            return Some(reject(
                IngestionStage::B,
                IngestionDecision::Quarantine,
                "ENCRYPTED_PDF_UNSUPPORTED",
                details,
            ));
        }
        let page_count = count_occurrences(payload, b"/Type /Page");
        let mut details = details.clone();
        details.insert(
            "pdf_page_count_estimate".to_string(),
            serde_json::json!(page_count),
        );
        if page_count as u64 > limits.max_pdf_pages {
            return Some(reject(
                IngestionStage::B,
                IngestionDecision::Quarantine,
                "TOO_MANY_PAGES",
                &details,
            ));
        }
        return None;
    }

    if matches!(content_type, "image/png" | "image/jpeg" | "image/webp") {
        if !is_image_readable(payload) {
            return Some(reject(
                IngestionStage::B,
                IngestionDecision::Quarantine,
                "IMAGE_DECODE_FAIL",
                details,
            ));
        }
        return None;
    }

    if content_type == "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" {
        let (reason_codes, xlsx_details) = validate_xlsx(payload, limits);
        let mut details = details.clone();
        for (key, value) in xlsx_details {
            details.insert(key, value);
        }
        if let Some(reason) = reason_codes.into_iter().next() {
            return Some(reject(
                IngestionStage::B,
                IngestionDecision::Quarantine,
                &reason,
                &details,
            ));
        }
        return None;
    }

    None
}

fn validate_stage_c(
    payload: &[u8],
    content_type: &str,
) -> (f64, String, Vec<String>, BTreeMap<String, serde_json::Value>) {
    let mut quality_score: f64 = 0.8;
    let mut reasons: Vec<String> = Vec::new();
    let mut details = BTreeMap::new();

    if matches!(content_type, "image/png" | "image/jpeg" | "image/webp") {
        if let Some((width, height)) = read_image_dimensions(payload) {
            let megapixels = f64::from(width) * f64::from(height) / 1_000_000.0;
            quality_score = (0.25 + megapixels / 2.0).clamp(0.2, 1.0);
            details.insert(
                "image_dimensions".to_string(),
                serde_json::json!({"width": width, "height": height}),
            );
            if quality_score < 0.55 {
                reasons.push("OCR_PRECHECK_LOW_CONF".to_string());
            }
            if width.min(height) < 700 {
                reasons.push("LOW_RESOLUTION".to_string());
                quality_score = quality_score.min(0.5);
            }
        } else {
            quality_score = 0.75;
            if quality_score < 0.55 {
                reasons.push("OCR_PRECHECK_LOW_CONF".to_string());
            }
        }
    } else if content_type == "application/pdf" {
        quality_score = 0.75;
    } else if content_type == "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" {
        quality_score = 0.85;
    }

    let tier = if quality_score >= 0.8 {
        "HIGH"
    } else if quality_score >= 0.55 {
        "MEDIUM"
    } else {
        "LOW"
    };

    reasons.sort();
    reasons.dedup();
    (quality_score, tier.to_string(), reasons, details)
}

fn is_image_readable(payload: &[u8]) -> bool {
    let magic = &payload[..payload.len().min(12)];
    SUPPORTED_IMAGE_MAGIC
        .iter()
        .any(|(sig, _)| magic.starts_with(sig))
}

/// Reads width/height from a PNG `IHDR` chunk or a baseline JPEG `SOFn`
/// marker segment. Returns `None` for WEBP or malformed input, matching the
/// original's behavior when no image library is available.
fn read_image_dimensions(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.starts_with(b"\x89PNG\r\n\x1a\n") && payload.len() >= 24 {
        let width = u32::from_be_bytes(payload[16..20].try_into().ok()?);
        let height = u32::from_be_bytes(payload[20..24].try_into().ok()?);
        return Some((width, height));
    }
    if payload.starts_with(b"\xff\xd8\xff") {
        return read_jpeg_dimensions(payload);
    }
    None
}

fn read_jpeg_dimensions(payload: &[u8]) -> Option<(u32, u32)> {
    let mut offset = 2usize;
    while offset + 4 <= payload.len() {
        if payload[offset] != 0xFF {
            offset += 1;
            continue;
        }
        let marker = payload[offset + 1];
        if marker == 0xD8 || marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            offset += 2;
            continue;
        }
        if marker == 0xD9 {
            break;
        }
        let segment_len = u16::from_be_bytes(payload[offset + 2..offset + 4].try_into().ok()?) as usize;
        let is_sof = matches!(
            marker,
            0xC0 | 0xC1 | 0xC2 | 0xC3 | 0xC5 | 0xC6 | 0xC7 | 0xC9 | 0xCA | 0xCB | 0xCD | 0xCE | 0xCF
        );
        if is_sof && offset + 9 <= payload.len() {
            let height = u16::from_be_bytes(payload[offset + 5..offset + 7].try_into().ok()?);
            let width = u16::from_be_bytes(payload[offset + 7..offset + 9].try_into().ok()?);
            return Some((u32::from(width), u32::from(height)));
        }
        offset += 2 + segment_len;
    }
    None
}

fn validate_xlsx(
    payload: &[u8],
    limits: &IngestionLimits,
) -> (Vec<String>, BTreeMap<String, serde_json::Value>) {
    let mut details = BTreeMap::new();
    details.insert("xlsx_sheet_count".to_string(), serde_json::json!(0));
    let mut reason_codes: Vec<String> = Vec::new();

    let cursor = std::io::Cursor::new(payload);
    let mut archive = match zip::ZipArchive::new(cursor) {
        Ok(archive) => archive,
        Err(_) => {
            reason_codes.push("XLSX_PARSE_FAIL".to_string());
            return (reason_codes, details);
        }
    };

    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .collect();

    if !names.iter().any(|name| name == "xl/workbook.xml") {
        reason_codes.push("XLSX_PARSE_FAIL".to_string());
        return (reason_codes, details);
    }

    let sheet_files: Vec<&String> = names
        .iter()
        .filter(|name| name.starts_with("xl/worksheets/sheet"))
        .collect();
    details.insert(
        "xlsx_sheet_count".to_string(),
        serde_json::json!(sheet_files.len()),
    );
    if sheet_files.is_empty() {
        reason_codes.push("XLSX_PARSE_FAIL".to_string());
    }

    if names.iter().any(|name| name == "xl/sharedStrings.xml") {
        details.insert("xlsx_has_shared_strings".to_string(), serde_json::json!(true));
        if let Ok(mut entry) = archive.by_name("xl/sharedStrings.xml") {
            let mut buf = Vec::new();
            if std::io::Read::read_to_end(&mut entry, &mut buf).is_ok() {
                details.insert(
                    "xlsx_shared_strings_meta".to_string(),
                    serde_json::json!({"count": buf.len()}),
                );
            }
        }
    }

    for sheet in &sheet_files {
        let Ok(mut entry) = archive.by_name(sheet) else {
            continue;
        };
        let mut buf = Vec::new();
        if std::io::Read::read_to_end(&mut entry, &mut buf).is_err() {
            continue;
        }
        let rows = count_occurrences(&buf, b"<row");
        if rows as u64 > limits.max_xlsx_rows_per_sheet {
            reason_codes.push("XLSX_PARSE_FAIL".to_string());
            details.insert(format!("{sheet}_rows"), serde_json::json!(rows));
            break;
        }
    }

    reason_codes.sort();
    reason_codes.dedup();
    (reason_codes, details)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    (0..=haystack.len() - needle.len())
        .filter(|&i| &haystack[i..i + needle.len()] == needle)
        .count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use super::*;

    fn limits() -> IngestionLimits {
        IngestionLimits {
            allowed_mime_types: vec![
                "application/pdf".to_string(),
                "image/png".to_string(),
                "image/jpeg".to_string(),
                "image/webp".to_string(),
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
            ],
            max_upload_size_bytes: 10_000_000,
            max_pdf_pages: 50,
            max_xlsx_rows_per_sheet: 50_000,
            quarantine_low_quality: true,
        }
    }

    #[test]
    fn unsupported_mime_is_rejected_at_stage_a() {
        let result = evaluate_ingestion_contract(b"whatever", "f.txt", "text/plain", &limits());
        assert_eq!(result.decision, IngestionDecision::Reject);
        assert_eq!(result.reason_codes, vec!["UNSUPPORTED_MIME".to_string()]);
    }

    #[test]
    fn tiny_payload_is_quarantined_as_corrupt() {
        let result = evaluate_ingestion_contract(b"ab", "f.pdf", "application/pdf", &limits());
        assert_eq!(result.decision, IngestionDecision::Quarantine);
        assert_eq!(result.reason_codes, vec!["FILE_CORRUPT".to_string()]);
    }

    #[test]
    fn non_pdf_header_fails_stage_b() {
        let result = evaluate_ingestion_contract(b"not a pdf!", "f.pdf", "application/pdf", &limits());
        assert_eq!(result.decision, IngestionDecision::Quarantine);
        assert_eq!(result.reason_codes, vec!["PDF_PARSE_FAIL".to_string()]);
    }

    #[test]
    fn valid_minimal_pdf_is_accepted() {
        let payload = b"%PDF-1.4\n/Type /Page\n%%EOF";
        let result = evaluate_ingestion_contract(payload, "f.pdf", "application/pdf", &limits());
        assert_eq!(result.decision, IngestionDecision::Accept);
        assert_eq!(result.quality_tier.as_deref(), Some("MEDIUM"));
    }

    #[test]
    fn encrypted_pdf_is_quarantined() {
        let payload = b"%PDF-1.4\n/Encrypt 1 0 R\n%%EOF";
        let result = evaluate_ingestion_contract(payload, "f.pdf", "application/pdf", &limits());
        assert_eq!(result.reason_codes, vec!["ENCRYPTED_PDF_UNSUPPORTED".to_string()]);
    }

    #[test]
    fn png_dimensions_drive_quality_tier() {
        let mut payload = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
        payload.extend_from_slice(&[0, 0, 0, 13]);
        payload.extend_from_slice(b"IHDR");
        payload.extend_from_slice(&1920u32.to_be_bytes());
        payload.extend_from_slice(&1080u32.to_be_bytes());
        payload.extend_from_slice(&[0u8; 64]);
        let result = evaluate_ingestion_contract(&payload, "f.png", "image/png", &limits());
        assert_eq!(result.decision, IngestionDecision::Accept);
        assert!(result.quality_score.unwrap() > 0.5);
    }

    #[test]
    fn quarantine_status_maps_stage_b_to_parse_fail() {
        let result = evaluate_ingestion_contract(b"garbage!!", "f.pdf", "application/pdf", &limits());
        assert_eq!(result.quarantine_status(), Some("QUARANTINED_PARSE_FAIL"));
    }

    #[test]
    fn reject_decision_maps_to_rejected_document_status() {
        use crate::entities::IngestionStatus;
        assert_eq!(
            IngestionDecision::Reject.document_status(),
            IngestionStatus::Rejected
        );
        assert_eq!(
            IngestionDecision::Accept.document_status(),
            IngestionStatus::Accepted
        );
        assert_eq!(
            IngestionDecision::Quarantine.document_status(),
            IngestionStatus::Quarantined
        );
    }
}
