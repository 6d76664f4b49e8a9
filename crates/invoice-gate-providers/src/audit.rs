// crates/invoice-gate-providers/src/audit.rs
// ============================================================================
// Module: File Audit Chain
// Description: Append-only, hash-chained `AuditSink` backed by a flat file.
// Purpose: Give every run a tamper-evident record of lifecycle events.
// Dependencies: invoice_gate_core::{entities, hashing, identifiers,
//               interfaces}, serde_json, time
// ============================================================================

//! ## Overview
//! [`FileAuditChain`] reproduces the original system's `audit.py` chain
//! exactly: each event's hash covers RFC 8785 canonical JSON of
//! `{timestamp_utc, event_type, run_id, payload, prev_hash}` — the `hash`
//! field itself is never part of what gets hashed — and links to the
//! previous event's hash, starting from the `GENESIS` marker. The in-memory
//! chain head is lazily loaded from the last line of the log file on first
//! use and held behind a mutex so concurrent appenders never fork the chain.
//!
//! One deliberate divergence from the original: the *persisted* line here is
//! a straightforward `serde_json` serialization of [`AuditEvent`], whose
//! `payload` field is a `BTreeMap` and therefore always key-sorted. The
//! original persists insertion-ordered JSON and only sorts keys for the hash
//! computation. This does not affect chain verification, which always
//! recomputes the hash over canonical (sorted) JSON regardless of how the
//! line happened to be written.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use invoice_gate_core::entities::AuditEvent;
use invoice_gate_core::hashing::hash_canonical_json;
use invoice_gate_core::hashing::DEFAULT_HASH_ALGORITHM;
use invoice_gate_core::identifiers::RunId;
use invoice_gate_core::interfaces::AuditError;
use invoice_gate_core::interfaces::AuditSink;
use invoice_gate_core::interfaces::AuditVerification;
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Prev-hash value for the first event ever appended to a chain.
const GENESIS: &str = "GENESIS";

/// The subset of an [`AuditEvent`] that gets hashed. The `hash` field itself
/// is deliberately excluded.
#[derive(Serialize)]
struct HashableEvent<'a> {
    timestamp_utc: &'a str,
    event_type: &'a str,
    run_id: &'a Option<String>,
    payload: &'a BTreeMap<String, Value>,
    prev_hash: &'a str,
}

/// Mutable chain head, guarded by a mutex shared across appenders.
struct ChainState {
    initialized: bool,
    last_hash: String,
}

/// A file-backed, hash-chained [`AuditSink`].
pub struct FileAuditChain {
    log_path: PathBuf,
    mask_fields: HashSet<String>,
    state: Mutex<ChainState>,
}

impl FileAuditChain {
    /// Creates a chain writing to `log_path`, masking any payload leaf keyed
    /// (case-insensitively) by one of `mask_fields`.
    #[must_use]
    pub fn new(log_path: impl Into<PathBuf>, mask_fields: impl IntoIterator<Item = String>) -> Self {
        Self {
            log_path: log_path.into(),
            mask_fields: mask_fields.into_iter().map(|field| field.to_lowercase()).collect(),
            state: Mutex::new(ChainState {
                initialized: false,
                last_hash: GENESIS.to_string(),
            }),
        }
    }

    /// Lazily loads the chain head from disk the first time this chain is
    /// used in the current process.
    fn ensure_initialized(&self, state: &mut ChainState) -> Result<(), AuditError> {
        if state.initialized {
            return Ok(());
        }
        let events = read_events_from_disk(&self.log_path)?;
        state.last_hash = events.last().map_or_else(|| GENESIS.to_string(), |event| event.hash.clone());
        state.initialized = true;
        Ok(())
    }
}

impl AuditSink for FileAuditChain {
    fn append(
        &self,
        event_type: &str,
        run_id: Option<&RunId>,
        payload: serde_json::Map<String, Value>,
    ) -> Result<AuditEvent, AuditError> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).map_err(|err| AuditError::Io(err.to_string()))?;
        }

        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.ensure_initialized(&mut state)?;

        let masked_payload = mask_payload(payload, &self.mask_fields);
        let timestamp_utc = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| AuditError::Io(err.to_string()))?;
        let run_id_string = run_id.map(ToString::to_string);
        let prev_hash = state.last_hash.clone();

        let digest = hash_canonical_json(
            DEFAULT_HASH_ALGORITHM,
            &HashableEvent {
                timestamp_utc: &timestamp_utc,
                event_type,
                run_id: &run_id_string,
                payload: &masked_payload,
                prev_hash: &prev_hash,
            },
        )
        .map_err(|err| AuditError::Hashing(err.to_string()))?;

        let event = AuditEvent {
            timestamp_utc,
            event_type: event_type.to_string(),
            run_id: run_id_string,
            payload: masked_payload,
            prev_hash,
            hash: digest.value,
        };

        let mut line = serde_json::to_string(&event).map_err(|err| AuditError::Io(err.to_string()))?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|err| AuditError::Io(err.to_string()))?;
        file.write_all(line.as_bytes()).map_err(|err| AuditError::Io(err.to_string()))?;

        state.last_hash = event.hash.clone();
        Ok(event)
    }

    fn read_events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        read_events_from_disk(&self.log_path)
    }

    fn verify(&self) -> Result<AuditVerification, AuditError> {
        let events = read_events_from_disk(&self.log_path)?;
        let mut running_prev = GENESIS.to_string();

        for (index, event) in events.iter().enumerate() {
            if event.prev_hash != running_prev {
                return Ok(AuditVerification {
                    valid: false,
                    events_checked: index as u64 + 1,
                    head_hash: None,
                    first_error_index: Some(index as u64),
                    error: Some("prev_hash_mismatch".to_string()),
                });
            }

            let digest = hash_canonical_json(
                DEFAULT_HASH_ALGORITHM,
                &HashableEvent {
                    timestamp_utc: &event.timestamp_utc,
                    event_type: &event.event_type,
                    run_id: &event.run_id,
                    payload: &event.payload,
                    prev_hash: &event.prev_hash,
                },
            )
            .map_err(|err| AuditError::Hashing(err.to_string()))?;

            if digest.value != event.hash {
                return Ok(AuditVerification {
                    valid: false,
                    events_checked: index as u64 + 1,
                    head_hash: None,
                    first_error_index: Some(index as u64),
                    error: Some("hash_mismatch".to_string()),
                });
            }

            running_prev.clone_from(&event.hash);
        }

        Ok(AuditVerification {
            valid: true,
            events_checked: events.len() as u64,
            head_hash: Some(running_prev),
            first_error_index: None,
            error: None,
        })
    }
}

/// Reads every well-formed event from `path`, tolerating and skipping any
/// line that fails to parse, matching the original reader's tolerance.
fn read_events_from_disk(path: &Path) -> Result<Vec<AuditEvent>, AuditError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(|err| AuditError::Io(err.to_string()))?;
    let mut events = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<AuditEvent>(trimmed) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Masks every payload leaf whose immediate parent key (lowercased) appears
/// in `mask_fields`, recursing through nested objects and arrays.
fn mask_payload(payload: serde_json::Map<String, Value>, mask_fields: &HashSet<String>) -> BTreeMap<String, Value> {
    payload
        .into_iter()
        .map(|(key, value)| {
            let lower = key.to_lowercase();
            let masked = mask_value(value, &lower, mask_fields);
            (key, masked)
        })
        .collect()
}

/// Recursively masks `value`, keyed by `key` (the immediate parent object
/// key, lowercased). Leaf values — of any JSON type — are replaced wholesale
/// when `key` is in `mask_fields`.
fn mask_value(value: Value, key: &str, mask_fields: &HashSet<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(inner_key, inner_value)| {
                    let lower = inner_key.to_lowercase();
                    let masked = mask_value(inner_value, &lower, mask_fields);
                    (inner_key, masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|item| mask_value(item, key, mask_fields)).collect()),
        _ if mask_fields.contains(key) => Value::String("***REDACTED***".to_string()),
        leaf => leaf,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use serde_json::json;

    use super::*;

    fn mask_fields() -> HashSet<String> {
        ["password", "token", "bank_account", "tax_id"].into_iter().map(String::from).collect()
    }

    #[test]
    fn first_event_chains_from_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let chain = FileAuditChain::new(dir.path().join("audit/events.log"), mask_fields());
        let payload = serde_json::Map::new();
        let event = chain.append("run_created", None, payload).unwrap();
        assert_eq!(event.prev_hash, GENESIS);
        assert_eq!(event.hash.len(), 64);
    }

    #[test]
    fn chain_links_successive_events() {
        let dir = tempfile::tempdir().unwrap();
        let chain = FileAuditChain::new(dir.path().join("audit/events.log"), mask_fields());
        let run_id = RunId::generate();
        let first = chain.append("run_created", Some(&run_id), serde_json::Map::new()).unwrap();
        let second = chain.append("run_started", Some(&run_id), serde_json::Map::new()).unwrap();
        assert_eq!(second.prev_hash, first.hash);
    }

    #[test]
    fn verify_reports_valid_chain() {
        let dir = tempfile::tempdir().unwrap();
        let chain = FileAuditChain::new(dir.path().join("audit/events.log"), mask_fields());
        chain.append("run_created", None, serde_json::Map::new()).unwrap();
        chain.append("run_started", None, serde_json::Map::new()).unwrap();
        let verification = chain.verify().unwrap();
        assert!(verification.valid);
        assert_eq!(verification.events_checked, 2);
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("audit/events.log");
        let chain = FileAuditChain::new(&log_path, mask_fields());
        chain.append("run_created", None, serde_json::Map::new()).unwrap();
        let mut content = fs::read_to_string(&log_path).unwrap();
        content = content.replace("run_created", "run_created_tampered");
        fs::write(&log_path, content).unwrap();

        let reloaded = FileAuditChain::new(&log_path, mask_fields());
        let verification = reloaded.verify().unwrap();
        assert!(!verification.valid);
        assert_eq!(verification.first_error_index, Some(0));
    }

    #[test]
    fn masked_fields_are_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let chain = FileAuditChain::new(dir.path().join("audit/events.log"), mask_fields());
        let mut payload = serde_json::Map::new();
        payload.insert("tax_id".to_string(), json!("123-45-6789"));
        payload.insert("amount".to_string(), json!(100));
        let event = chain.append("document_ingested", None, payload).unwrap();
        assert_eq!(event.payload.get("tax_id"), Some(&json!("***REDACTED***")));
        assert_eq!(event.payload.get("amount"), Some(&json!(100)));
    }
}
