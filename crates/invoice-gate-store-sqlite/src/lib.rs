// crates/invoice-gate-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQLite Repository
// Description: Durable Repository backend using SQLite WAL.
// Purpose: Provide production-grade persistence for documents, runs, run
//          stages, and quarantine items.
// Dependencies: invoice-gate-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a `SQLite`-backed [`Repository`](invoice_gate_core::interfaces::Repository)
//! implementation covering the four persisted tables of the pipeline:
//! documents, runs, run stages, and quarantine items. It is the durable
//! counterpart to the in-memory fakes used in tests elsewhere in the
//! workspace.

#![forbid(unsafe_code)]

pub mod store;

pub use store::SqliteRepository;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
