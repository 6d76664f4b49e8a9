// crates/invoice-gate-core/src/hashing.rs
// ============================================================================
// Module: Invoice Gate Canonical Hashing
// Description: RFC 8785 JSON canonicalization and content hashing utilities.
// Purpose: Provide deterministic, replayable digests for audit chain events
//          and review decision input snapshots.
// Dependencies: serde, serde_jcs, serde_json, sha2
// ============================================================================

//! ## Overview
//! Two distinct canonicalization conventions are needed and kept separate:
//! audit chain events are hashed over RFC 8785 (JCS) canonical JSON — sorted
//! keys, compact separators — while review decision input snapshots are
//! hashed over sorted-key JSON with the serializer's default (spaced)
//! separators. Mixing the two would silently change every downstream hash.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

/// Supported hash algorithms for Invoice Gate artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256 hashing.
    Sha256,
}

/// Default hash algorithm.
pub const DEFAULT_HASH_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;

/// Deterministic content hash representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDigest {
    /// Hash algorithm identifier.
    pub algorithm: HashAlgorithm,
    /// Lowercase hex-encoded digest bytes.
    pub value: String,
}

impl HashDigest {
    /// Creates a new digest from raw bytes.
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            value: hex_encode(bytes),
        }
    }
}

/// Errors raised when computing canonical hashes.
#[derive(Debug, Error)]
pub enum HashError {
    /// JSON canonicalization failed.
    #[error("failed to canonicalize json: {0}")]
    Canonicalization(String),
}

/// Returns RFC 8785 canonical JSON bytes (sorted keys, compact separators).
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

/// Hashes RFC 8785 canonical JSON using the given algorithm. Used for audit
/// chain event hashing.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn hash_canonical_json<T: Serialize + ?Sized>(
    algorithm: HashAlgorithm,
    value: &T,
) -> Result<HashDigest, HashError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(algorithm, &bytes))
}

/// Hashes raw bytes using the given algorithm.
#[must_use]
pub fn hash_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> HashDigest {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            let digest = hasher.finalize();
            HashDigest::new(HashAlgorithm::Sha256, &digest)
        }
    }
}

/// Returns sorted-key JSON bytes using the serializer's default (spaced)
/// separators, distinct from [`canonical_json_bytes`]. Used for review
/// decision input snapshots, which must remain stable under key reordering
/// but are not required to be byte-compact.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn sorted_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    let raw = serde_json::to_value(value)
        .map_err(|err| HashError::Canonicalization(err.to_string()))?;
    let sorted = sort_value_keys(raw);
    let mut out = String::new();
    write_spaced(&sorted, &mut out);
    Ok(out.into_bytes())
}

/// Writes `value` using `", "`/`": "` item and key separators, matching the
/// Python standard library's default (non-compact) `json.dumps` output.
/// `value` must already have sorted object keys.
fn write_spaced(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            for (idx, (key, val)) in map.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push_str(": ");
                write_spaced(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                write_spaced(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Hashes sorted-key, default-separator JSON. Used for review decision input
/// snapshots (see [`sorted_json_bytes`]).
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn hash_sorted_json<T: Serialize + ?Sized>(
    algorithm: HashAlgorithm,
    value: &T,
) -> Result<HashDigest, HashError> {
    let bytes = sorted_json_bytes(value)?;
    Ok(hash_bytes(algorithm, &bytes))
}

/// Recursively reorders object keys so that serialization is deterministic
/// regardless of insertion order, without otherwise changing formatting.
fn sort_value_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_value_keys(v))).collect();
            let mut out = serde_json::Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value_keys).collect()),
        other => other,
    }
}

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_is_key_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(
            canonical_json_bytes(&a).unwrap(),
            canonical_json_bytes(&b).unwrap()
        );
    }

    #[test]
    fn canonical_json_uses_compact_separators() {
        let value = json!({"a": 1, "b": 2});
        let bytes = canonical_json_bytes(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn sorted_json_uses_spaced_separators() {
        let value = json!({"b": 1, "a": 2});
        let bytes = sorted_json_bytes(&value).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\"a\": 2, \"b\": 1}");
    }

    #[test]
    fn hash_bytes_is_deterministic() {
        let d1 = hash_bytes(HashAlgorithm::Sha256, b"invoice");
        let d2 = hash_bytes(HashAlgorithm::Sha256, b"invoice");
        assert_eq!(d1, d2);
        assert_eq!(d1.value.len(), 64);
    }
}
