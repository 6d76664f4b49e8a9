// crates/invoice-gate-core/src/identifiers.rs
// ============================================================================
// Module: Invoice Gate Identifiers
// Description: Opaque string-backed identifier newtypes for core entities.
// Purpose: Prevent accidental mixing of document/run/tenant/quarantine ids.
// Dependencies: serde, uuid
// ============================================================================

//! ## Overview
//! Every entity identifier is a UUID-v4 string wrapped in a dedicated newtype,
//! matching the string primary keys generated by the system this crate
//! replaces. Newtypes stop a `RunId` and a `DocumentId` from being swapped at
//! a call site even though both are strings underneath.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generates a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wraps an existing raw identifier string without validation.
            #[must_use]
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id!(TenantId, "Identifies a tenant isolating documents and runs.");
string_id!(DocumentId, "Identifies an ingested document.");
string_id!(RunId, "Identifies a single processing run of a document.");
string_id!(
    QuarantineItemId,
    "Identifies a quarantine item produced by a rejected ingestion or run."
);

#[cfg(test)]
mod tests {
    use super::RunId;

    #[test]
    fn generate_produces_distinct_ids() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_round_trips_through_display() {
        let id = RunId::from_raw("fixed-id-123");
        assert_eq!(id.as_str(), "fixed-id-123");
        assert_eq!(id.to_string(), "fixed-id-123");
    }
}
