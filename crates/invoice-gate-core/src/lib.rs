// crates/invoice-gate-core/src/lib.rs
// ============================================================================
// Module: Invoice Gate Core
// Description: Entities, identifiers, hashing, error taxonomy, the ingestion
//              contract, and the review policy — the pure, backend-agnostic
//              core of the invoice run orchestrator.
// Purpose: Provide the shared vocabulary and deterministic decision logic
//          every other crate in this workspace builds on.
// Dependencies: serde, serde_json, serde_jcs, sha2, thiserror, time, uuid,
//               zip
// ============================================================================

//! ## Overview
//! This crate has no I/O. Everything in it — identifiers, entities, the
//! ingestion contract, the review policy, and the canonical hashing helpers
//! — is a pure function of its inputs. The orchestrator, store, and
//! provider crates depend on this one; it depends on none of them.
//!
//! Invariants:
//! - [`ingestion::evaluate_ingestion_contract`] and
//!   [`review::evaluate_review_decision`] are total, deterministic
//!   functions: same input, same output, every time.
//! - [`hashing::canonical_json_bytes`] and [`hashing::sorted_json_bytes`]
//!   are two distinct canonicalizations kept deliberately separate; do not
//!   unify them.

#![forbid(unsafe_code)]

pub mod admission;
pub mod entities;
pub mod errors;
pub mod hashing;
pub mod identifiers;
pub mod ingestion;
pub mod interfaces;
pub mod orchestrator;
pub mod review;
pub mod validation;
pub mod worker;
