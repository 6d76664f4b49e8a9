// crates/invoice-gate-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Repository
// Description: Durable `Repository` backed by SQLite WAL.
// Purpose: Persist documents, runs, run stages, and quarantine items with
//          the same uniqueness/ordering invariants the in-memory fakes
//          enforce in tests.
// Dependencies: invoice-gate-core, rusqlite, serde_json, thiserror, time
// ============================================================================

//! ## Overview
//! [`SqliteRepository`] is the durable counterpart to the in-memory fakes
//! used elsewhere in the workspace's test suites. All access to the single
//! underlying connection is serialized through a mutex; `SQLite`'s own WAL
//! mode lets readers and the writer coexist without blocking each other at
//! the file level, but this crate does not attempt a multi-connection
//! reader pool — the run volumes this system targets do not need it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use invoice_gate_core::entities::Document;
use invoice_gate_core::entities::IngestionStatus;
use invoice_gate_core::entities::QuarantineItem;
use invoice_gate_core::entities::Run;
use invoice_gate_core::entities::RunStage;
use invoice_gate_core::entities::RunStatus;
use invoice_gate_core::entities::StageName;
use invoice_gate_core::entities::StageStatus;
use invoice_gate_core::identifiers::DocumentId;
use invoice_gate_core::identifiers::QuarantineItemId;
use invoice_gate_core::identifiers::RunId;
use invoice_gate_core::identifiers::TenantId;
use invoice_gate_core::interfaces::Repository;
use invoice_gate_core::interfaces::StoreError;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` repository.
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Builds a config pointing at `path` with the default WAL/full
    /// pragma settings.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: 5_000,
            journal_mode: SqliteStoreMode::Wal,
            sync_mode: SqliteSyncMode::Full,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store errors.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// I/O failure opening or configuring the database file.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// A stored JSON column failed to parse.
    #[error("sqlite store corrupt row: {0}")]
    Corrupt(String),
}

impl From<SqliteStoreError> for StoreError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Io(message) | SqliteStoreError::Db(message) | SqliteStoreError::Corrupt(message) => {
                Self::Backend(message)
            }
        }
    }
}

impl From<rusqlite::Error> for SqliteStoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Db(error.to_string())
    }
}

// ============================================================================
// SECTION: Connection Setup
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;

/// Opens a file-backed connection and applies the configured pragmas.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let connection = Connection::open(&config.path).map_err(|err| SqliteStoreError::Io(err.to_string()))?;
    connection
        .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(connection)
}

/// Creates the four core tables and their indexes if they do not already
/// exist, recording the schema version on first run.
fn run_migrations(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let current_version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    if current_version.is_none() {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                storage_path TEXT NOT NULL,
                language TEXT NOT NULL,
                ingestion_status TEXT NOT NULL,
                quality_tier TEXT,
                quality_score REAL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents (tenant_id);

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                idempotency_key TEXT,
                replay_of_run_id TEXT,
                status TEXT NOT NULL,
                error_code TEXT,
                model_name TEXT,
                route_name TEXT,
                review_decision TEXT,
                review_reason_codes TEXT,
                decision_log TEXT,
                result TEXT,
                validation_issues TEXT,
                cancel_requested INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_tenant ON runs (tenant_id);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_tenant_idempotency
                ON runs (tenant_id, idempotency_key)
                WHERE idempotency_key IS NOT NULL;

            CREATE TABLE IF NOT EXISTS run_stages (
                run_id TEXT NOT NULL,
                stage_name TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_code TEXT,
                details TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                PRIMARY KEY (run_id, stage_name, attempt)
            );

            CREATE TABLE IF NOT EXISTS quarantine_items (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                reason_codes TEXT NOT NULL,
                details TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                reprocess_count INTEGER NOT NULL,
                last_reprocessed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_quarantine_tenant ON quarantine_items (tenant_id);
            CREATE INDEX IF NOT EXISTS idx_quarantine_document ON quarantine_items (document_id);
            ",
        )
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    }
    tx.commit().map_err(|err| SqliteStoreError::Db(err.to_string()))
}

// ============================================================================
// SECTION: Serialization Helpers
// ============================================================================

/// Formats a timestamp as RFC 3339 for storage.
fn format_timestamp(value: OffsetDateTime) -> Result<String, SqliteStoreError> {
    value
        .format(&Rfc3339)
        .map_err(|err| SqliteStoreError::Corrupt(format!("failed to format timestamp: {err}")))
}

/// Parses a stored RFC 3339 timestamp column.
fn parse_timestamp(value: &str) -> Result<OffsetDateTime, SqliteStoreError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| SqliteStoreError::Corrupt(format!("failed to parse timestamp {value:?}: {err}")))
}

/// Formats an optional timestamp, passing `None` through.
fn format_timestamp_opt(value: Option<OffsetDateTime>) -> Result<Option<String>, SqliteStoreError> {
    value.map(format_timestamp).transpose()
}

/// Parses an optional stored timestamp column.
fn parse_timestamp_opt(value: Option<String>) -> Result<Option<OffsetDateTime>, SqliteStoreError> {
    value.map(|raw| parse_timestamp(&raw)).transpose()
}

/// Maps an ingestion status to its stored string code.
fn ingestion_status_code(status: IngestionStatus) -> &'static str {
    match status {
        IngestionStatus::Accepted => "ACCEPTED",
        IngestionStatus::Quarantined => "QUARANTINED",
        IngestionStatus::Rejected => "REJECTED",
    }
}

/// Parses a stored ingestion status code.
fn parse_ingestion_status(code: &str) -> Result<IngestionStatus, SqliteStoreError> {
    match code {
        "ACCEPTED" => Ok(IngestionStatus::Accepted),
        "QUARANTINED" => Ok(IngestionStatus::Quarantined),
        "REJECTED" => Ok(IngestionStatus::Rejected),
        other => Err(SqliteStoreError::Corrupt(format!("unknown ingestion_status: {other}"))),
    }
}

/// Maps a run status to its stored string code.
fn run_status_code(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "QUEUED",
        RunStatus::Running => "RUNNING",
        RunStatus::Success => "SUCCESS",
        RunStatus::Warn => "WARN",
        RunStatus::NeedsReview => "NEEDS_REVIEW",
        RunStatus::Failed => "FAILED",
        RunStatus::Cancelled => "CANCELLED",
    }
}

/// Parses a stored run status code.
fn parse_run_status(code: &str) -> Result<RunStatus, SqliteStoreError> {
    match code {
        "QUEUED" => Ok(RunStatus::Queued),
        "RUNNING" => Ok(RunStatus::Running),
        "SUCCESS" => Ok(RunStatus::Success),
        "WARN" => Ok(RunStatus::Warn),
        "NEEDS_REVIEW" => Ok(RunStatus::NeedsReview),
        "FAILED" => Ok(RunStatus::Failed),
        "CANCELLED" => Ok(RunStatus::Cancelled),
        other => Err(SqliteStoreError::Corrupt(format!("unknown run status: {other}"))),
    }
}

/// Maps a stage name to its stored string code.
fn stage_name_code(stage_name: StageName) -> &'static str {
    match stage_name {
        StageName::Preprocess => "PREPROCESS",
        StageName::Ocr => "OCR",
        StageName::Extract => "EXTRACT",
        StageName::Validate => "VALIDATE",
        StageName::Persist => "PERSIST",
        StageName::Export => "EXPORT",
    }
}

/// Parses a stored stage name code.
fn parse_stage_name(code: &str) -> Result<StageName, SqliteStoreError> {
    match code {
        "PREPROCESS" => Ok(StageName::Preprocess),
        "OCR" => Ok(StageName::Ocr),
        "EXTRACT" => Ok(StageName::Extract),
        "VALIDATE" => Ok(StageName::Validate),
        "PERSIST" => Ok(StageName::Persist),
        "EXPORT" => Ok(StageName::Export),
        other => Err(SqliteStoreError::Corrupt(format!("unknown stage_name: {other}"))),
    }
}

/// Maps a stage status to its stored string code.
fn stage_status_code(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Running => "RUNNING",
        StageStatus::Succeeded => "SUCCEEDED",
        StageStatus::Failed => "FAILED",
        StageStatus::Cancelled => "CANCELLED",
    }
}

/// Parses a stored stage status code.
fn parse_stage_status(code: &str) -> Result<StageStatus, SqliteStoreError> {
    match code {
        "RUNNING" => Ok(StageStatus::Running),
        "SUCCEEDED" => Ok(StageStatus::Succeeded),
        "FAILED" => Ok(StageStatus::Failed),
        "CANCELLED" => Ok(StageStatus::Cancelled),
        other => Err(SqliteStoreError::Corrupt(format!("unknown stage status: {other}"))),
    }
}

/// Serializes a value to a JSON text column.
fn json_to_text<T: serde::Serialize>(value: &T) -> Result<String, SqliteStoreError> {
    serde_json::to_string(value).map_err(|err| SqliteStoreError::Corrupt(format!("failed to serialize json: {err}")))
}

/// Deserializes a JSON text column.
fn json_from_text<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, SqliteStoreError> {
    serde_json::from_str(text).map_err(|err| SqliteStoreError::Corrupt(format!("failed to parse json: {err}")))
}

/// Maps a `documents` row to a [`Document`].
fn document_from_row(row: &Row<'_>) -> Result<Document, SqliteStoreError> {
    let created_at: String = row.get(10)?;
    Ok(Document {
        id: DocumentId::from_raw(row.get::<_, String>(0)?),
        tenant_id: TenantId::from_raw(row.get::<_, String>(1)?),
        filename: row.get(2)?,
        content_type: row.get(3)?,
        size_bytes: u64::try_from(row.get::<_, i64>(4)?)
            .map_err(|err| SqliteStoreError::Corrupt(format!("negative size_bytes: {err}")))?,
        storage_path: row.get(5)?,
        language: row.get(6)?,
        ingestion_status: parse_ingestion_status(&row.get::<_, String>(7)?)?,
        quality_tier: row.get(8)?,
        quality_score: row.get(9)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

/// Maps a `runs` row to a [`Run`].
fn run_from_row(row: &Row<'_>) -> Result<Run, SqliteStoreError> {
    let review_reason_codes: Option<String> = row.get(11)?;
    let decision_log: Option<String> = row.get(12)?;
    let result: Option<String> = row.get(13)?;
    let validation_issues: Option<String> = row.get(14)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;
    let finished_at: Option<String> = row.get(18)?;
    Ok(Run {
        id: RunId::from_raw(row.get::<_, String>(0)?),
        document_id: DocumentId::from_raw(row.get::<_, String>(1)?),
        tenant_id: TenantId::from_raw(row.get::<_, String>(2)?),
        requested_by: row.get(3)?,
        idempotency_key: row.get(4)?,
        replay_of_run_id: row.get::<_, Option<String>>(5)?.map(RunId::from_raw),
        status: parse_run_status(&row.get::<_, String>(6)?)?,
        error_code: row.get(7)?,
        model_name: row.get(8)?,
        route_name: row.get(9)?,
        review_decision: row.get(10)?,
        review_reason_codes: review_reason_codes.map(|text| json_from_text(&text)).transpose()?,
        decision_log: decision_log
            .map(|text| json_from_text::<BTreeMap<String, serde_json::Value>>(&text))
            .transpose()?,
        result: result.map(|text| json_from_text(&text)).transpose()?,
        validation_issues: validation_issues.map(|text| json_from_text(&text)).transpose()?,
        cancel_requested: row.get::<_, i64>(15)? != 0,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        finished_at: parse_timestamp_opt(finished_at)?,
    })
}

/// Maps a `run_stages` row to a [`RunStage`].
fn stage_from_row(row: &Row<'_>) -> Result<RunStage, SqliteStoreError> {
    let details: String = row.get(5)?;
    let started_at: Option<String> = row.get(6)?;
    let finished_at: Option<String> = row.get(7)?;
    Ok(RunStage {
        run_id: RunId::from_raw(row.get::<_, String>(0)?),
        stage_name: parse_stage_name(&row.get::<_, String>(1)?)?,
        attempt: u32::try_from(row.get::<_, i64>(2)?)
            .map_err(|err| SqliteStoreError::Corrupt(format!("negative attempt: {err}")))?,
        status: parse_stage_status(&row.get::<_, String>(3)?)?,
        error_code: row.get(4)?,
        details: json_from_text(&details)?,
        started_at: parse_timestamp_opt(started_at)?,
        finished_at: parse_timestamp_opt(finished_at)?,
    })
}

/// Maps a `quarantine_items` row to a [`QuarantineItem`].
fn quarantine_from_row(row: &Row<'_>) -> Result<QuarantineItem, SqliteStoreError> {
    let reason_codes: String = row.get(5)?;
    let details: String = row.get(6)?;
    let last_reprocessed_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    let resolved_at: Option<String> = row.get(12)?;
    Ok(QuarantineItem {
        id: QuarantineItemId::from_raw(row.get::<_, String>(0)?),
        document_id: DocumentId::from_raw(row.get::<_, String>(1)?),
        tenant_id: TenantId::from_raw(row.get::<_, String>(2)?),
        stage: row.get(3)?,
        status: row.get(4)?,
        reason_codes: json_from_text(&reason_codes)?,
        details: json_from_text(&details)?,
        storage_path: row.get(7)?,
        reprocess_count: u32::try_from(row.get::<_, i64>(8)?)
            .map_err(|err| SqliteStoreError::Corrupt(format!("negative reprocess_count: {err}")))?,
        last_reprocessed_at: parse_timestamp_opt(last_reprocessed_at)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        resolved_at: parse_timestamp_opt(resolved_at)?,
    })
}

/// Returns whether `error` is a `SQLite` uniqueness constraint violation.
fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(ffi_error, _) if ffi_error.code == ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// SECTION: Repository
// ============================================================================

/// `SQLite`-backed [`Repository`] implementation.
pub struct SqliteRepository {
    /// The single shared connection; every call serializes through this
    /// mutex.
    connection: Mutex<Connection>,
}

impl SqliteRepository {
    /// Opens (creating if necessary) a `SQLite` database at `config.path`,
    /// applies pragmas, and runs schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError::Io`] if the file cannot be opened, or
    /// [`SqliteStoreError::Db`] if pragma application or migration fails.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        let mut connection = open_connection(config)?;
        run_migrations(&mut connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Opens an in-memory database, primarily for tests.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError::Db`] if migration fails.
    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let mut connection = Connection::open_in_memory().map_err(|err| SqliteStoreError::Io(err.to_string()))?;
        connection
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        run_migrations(&mut connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Locks the shared connection, mapping mutex poisoning to a backend
    /// error rather than panicking.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.connection
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))
    }
}

impl Repository for SqliteRepository {
    fn create_document(&self, document: Document) -> Result<Document, StoreError> {
        let connection = self.lock()?;
        let created_at = format_timestamp(document.created_at).map_err(StoreError::from)?;
        connection
            .execute(
                "INSERT INTO documents (
                    id, tenant_id, filename, content_type, size_bytes, storage_path,
                    language, ingestion_status, quality_tier, quality_score, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    document.id.as_str(),
                    document.tenant_id.as_str(),
                    document.filename,
                    document.content_type,
                    i64::try_from(document.size_bytes)
                        .map_err(|err| StoreError::Backend(format!("size_bytes too large: {err}")))?,
                    document.storage_path,
                    document.language,
                    ingestion_status_code(document.ingestion_status),
                    document.quality_tier,
                    document.quality_score,
                    created_at,
                ],
            )
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(document)
    }

    fn update_document_ingestion(&self, document: &Document) -> Result<(), StoreError> {
        let connection = self.lock()?;
        let updated = connection
            .execute(
                "UPDATE documents SET
                    ingestion_status = ?1, quality_tier = ?2, quality_score = ?3,
                    storage_path = ?4
                WHERE id = ?5",
                params![
                    ingestion_status_code(document.ingestion_status),
                    document.quality_tier,
                    document.quality_score,
                    document.storage_path,
                    document.id.as_str(),
                ],
            )
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(document.id.to_string()));
        }
        Ok(())
    }

    fn get_document(
        &self,
        document_id: &DocumentId,
        tenant_id: Option<&TenantId>,
    ) -> Result<Option<Document>, StoreError> {
        let connection = self.lock()?;
        let document = match tenant_id {
            Some(tenant) => connection
                .query_row(
                    "SELECT id, tenant_id, filename, content_type, size_bytes, storage_path,
                        language, ingestion_status, quality_tier, quality_score, created_at
                    FROM documents WHERE id = ?1 AND tenant_id = ?2",
                    params![document_id.as_str(), tenant.as_str()],
                    |row| Ok(document_from_row(row)),
                )
                .optional(),
            None => connection
                .query_row(
                    "SELECT id, tenant_id, filename, content_type, size_bytes, storage_path,
                        language, ingestion_status, quality_tier, quality_score, created_at
                    FROM documents WHERE id = ?1",
                    params![document_id.as_str()],
                    |row| Ok(document_from_row(row)),
                )
                .optional(),
        }
        .map_err(|err| StoreError::Backend(err.to_string()))?;
        document.transpose().map_err(StoreError::from)
    }

    fn get_run_by_idempotency(&self, key: &str, tenant_id: &TenantId) -> Result<Option<Run>, StoreError> {
        let connection = self.lock()?;
        connection
            .query_row(
                &run_select_sql("WHERE tenant_id = ?1 AND idempotency_key = ?2"),
                params![tenant_id.as_str(), key],
                |row| Ok(run_from_row(row)),
            )
            .optional()
            .map_err(|err| StoreError::Backend(err.to_string()))?
            .transpose()
            .map_err(StoreError::from)
    }

    fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        let connection = self.lock()?;
        let created_at = format_timestamp(run.created_at).map_err(StoreError::from)?;
        let updated_at = format_timestamp(run.updated_at).map_err(StoreError::from)?;
        let finished_at = format_timestamp_opt(run.finished_at).map_err(StoreError::from)?;
        let review_reason_codes = run
            .review_reason_codes
            .as_ref()
            .map(json_to_text)
            .transpose()
            .map_err(StoreError::from)?;
        let decision_log = run.decision_log.as_ref().map(json_to_text).transpose().map_err(StoreError::from)?;
        let result = run.result.as_ref().map(json_to_text).transpose().map_err(StoreError::from)?;
        let validation_issues = run
            .validation_issues
            .as_ref()
            .map(json_to_text)
            .transpose()
            .map_err(StoreError::from)?;
        let outcome = connection.execute(
            "INSERT INTO runs (
                id, document_id, tenant_id, requested_by, idempotency_key, replay_of_run_id,
                status, error_code, model_name, route_name, review_decision,
                review_reason_codes, decision_log, result, validation_issues,
                cancel_requested, created_at, updated_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                run.id.as_str(),
                run.document_id.as_str(),
                run.tenant_id.as_str(),
                run.requested_by,
                run.idempotency_key,
                run.replay_of_run_id.as_ref().map(RunId::as_str),
                run_status_code(run.status),
                run.error_code,
                run.model_name,
                run.route_name,
                run.review_decision,
                review_reason_codes,
                decision_log,
                result,
                validation_issues,
                i64::from(run.cancel_requested),
                created_at,
                updated_at,
                finished_at,
            ],
        );
        match outcome {
            Ok(_) => Ok(run),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(format!(
                "idempotency key already used for tenant {}",
                run.tenant_id
            ))),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn get_run(&self, run_id: &RunId, tenant_id: Option<&TenantId>) -> Result<Option<Run>, StoreError> {
        let connection = self.lock()?;
        let run = match tenant_id {
            Some(tenant) => connection
                .query_row(
                    &run_select_sql("WHERE id = ?1 AND tenant_id = ?2"),
                    params![run_id.as_str(), tenant.as_str()],
                    |row| Ok(run_from_row(row)),
                )
                .optional(),
            None => connection
                .query_row(&run_select_sql("WHERE id = ?1"), params![run_id.as_str()], |row| {
                    Ok(run_from_row(row))
                })
                .optional(),
        }
        .map_err(|err| StoreError::Backend(err.to_string()))?;
        run.transpose().map_err(StoreError::from)
    }

    fn count_runs_by_status(&self, status: RunStatus, tenant_id: Option<&TenantId>) -> Result<u64, StoreError> {
        let connection = self.lock()?;
        let count: i64 = match tenant_id {
            Some(tenant) => connection
                .query_row(
                    "SELECT COUNT(*) FROM runs WHERE status = ?1 AND tenant_id = ?2",
                    params![run_status_code(status), tenant.as_str()],
                    |row| row.get(0),
                )
                .map_err(|err| StoreError::Backend(err.to_string()))?,
            None => connection
                .query_row("SELECT COUNT(*) FROM runs WHERE status = ?1", params![run_status_code(status)], |row| {
                    row.get(0)
                })
                .map_err(|err| StoreError::Backend(err.to_string()))?,
        };
        u64::try_from(count).map_err(|err| StoreError::Backend(format!("negative count: {err}")))
    }

    fn list_queued_runs(&self, limit: u32) -> Result<Vec<Run>, StoreError> {
        let connection = self.lock()?;
        let sql = run_select_sql("WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2");
        let mut statement = connection.prepare(&sql).map_err(|err| StoreError::Backend(err.to_string()))?;
        let rows = statement
            .query_map(params![run_status_code(RunStatus::Queued), i64::from(limit)], |row| Ok(run_from_row(row)))
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(|err| StoreError::Backend(err.to_string()))?.map_err(StoreError::from)?);
        }
        Ok(runs)
    }

    fn list_run_stages(&self, run_id: &RunId) -> Result<Vec<RunStage>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT run_id, stage_name, attempt, status, error_code, details, started_at, finished_at
                FROM run_stages WHERE run_id = ?1 ORDER BY started_at ASC, attempt ASC",
            )
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let rows = statement
            .query_map(params![run_id.as_str()], |row| Ok(stage_from_row(row)))
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row.map_err(|err| StoreError::Backend(err.to_string()))?.map_err(StoreError::from)?);
        }
        Ok(stages)
    }

    fn upsert_stage(&self, stage: RunStage) -> Result<RunStage, StoreError> {
        let connection = self.lock()?;
        let details = json_to_text(&stage.details).map_err(StoreError::from)?;
        let started_at = format_timestamp_opt(stage.started_at).map_err(StoreError::from)?;
        let finished_at = format_timestamp_opt(stage.finished_at).map_err(StoreError::from)?;
        connection
            .execute(
                "INSERT INTO run_stages (run_id, stage_name, attempt, status, error_code, details, started_at, finished_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (run_id, stage_name, attempt) DO UPDATE SET
                    status = excluded.status,
                    error_code = excluded.error_code,
                    details = excluded.details,
                    started_at = excluded.started_at,
                    finished_at = excluded.finished_at",
                params![
                    stage.run_id.as_str(),
                    stage_name_code(stage.stage_name),
                    i64::from(stage.attempt),
                    stage_status_code(stage.status),
                    stage.error_code,
                    details,
                    started_at,
                    finished_at,
                ],
            )
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(stage)
    }

    fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let connection = self.lock()?;
        let updated_at = format_timestamp(run.updated_at).map_err(StoreError::from)?;
        let finished_at = format_timestamp_opt(run.finished_at).map_err(StoreError::from)?;
        let review_reason_codes = run
            .review_reason_codes
            .as_ref()
            .map(json_to_text)
            .transpose()
            .map_err(StoreError::from)?;
        let decision_log = run.decision_log.as_ref().map(json_to_text).transpose().map_err(StoreError::from)?;
        let result = run.result.as_ref().map(json_to_text).transpose().map_err(StoreError::from)?;
        let validation_issues = run
            .validation_issues
            .as_ref()
            .map(json_to_text)
            .transpose()
            .map_err(StoreError::from)?;
        let updated = connection
            .execute(
                "UPDATE runs SET
                    status = ?1, error_code = ?2, model_name = ?3, route_name = ?4,
                    review_decision = ?5, review_reason_codes = ?6, decision_log = ?7,
                    result = ?8, validation_issues = ?9, cancel_requested = ?10,
                    updated_at = ?11, finished_at = ?12
                WHERE id = ?13",
                params![
                    run_status_code(run.status),
                    run.error_code,
                    run.model_name,
                    run.route_name,
                    run.review_decision,
                    review_reason_codes,
                    decision_log,
                    result,
                    validation_issues,
                    i64::from(run.cancel_requested),
                    updated_at,
                    finished_at,
                    run.id.as_str(),
                ],
            )
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(run.id.to_string()));
        }
        Ok(())
    }

    fn create_quarantine_item(&self, item: QuarantineItem) -> Result<QuarantineItem, StoreError> {
        let connection = self.lock()?;
        let reason_codes = json_to_text(&item.reason_codes).map_err(StoreError::from)?;
        let details = json_to_text(&item.details).map_err(StoreError::from)?;
        let created_at = format_timestamp(item.created_at).map_err(StoreError::from)?;
        let updated_at = format_timestamp(item.updated_at).map_err(StoreError::from)?;
        let resolved_at = format_timestamp_opt(item.resolved_at).map_err(StoreError::from)?;
        let last_reprocessed_at = format_timestamp_opt(item.last_reprocessed_at).map_err(StoreError::from)?;
        connection
            .execute(
                "INSERT INTO quarantine_items (
                    id, document_id, tenant_id, stage, status, reason_codes, details,
                    storage_path, reprocess_count, last_reprocessed_at, created_at,
                    updated_at, resolved_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    item.id.as_str(),
                    item.document_id.as_str(),
                    item.tenant_id.as_str(),
                    item.stage,
                    item.status,
                    reason_codes,
                    details,
                    item.storage_path,
                    i64::from(item.reprocess_count),
                    last_reprocessed_at,
                    created_at,
                    updated_at,
                    resolved_at,
                ],
            )
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(item)
    }

    fn get_quarantine_item(
        &self,
        item_id: &QuarantineItemId,
        tenant_id: Option<&TenantId>,
    ) -> Result<Option<QuarantineItem>, StoreError> {
        let connection = self.lock()?;
        let item = match tenant_id {
            Some(tenant) => connection
                .query_row(
                    &quarantine_select_sql("WHERE id = ?1 AND tenant_id = ?2"),
                    params![item_id.as_str(), tenant.as_str()],
                    |row| Ok(quarantine_from_row(row)),
                )
                .optional(),
            None => connection
                .query_row(&quarantine_select_sql("WHERE id = ?1"), params![item_id.as_str()], |row| {
                    Ok(quarantine_from_row(row))
                })
                .optional(),
        }
        .map_err(|err| StoreError::Backend(err.to_string()))?;
        item.transpose().map_err(StoreError::from)
    }

    fn list_quarantine_items(
        &self,
        tenant_id: &TenantId,
        status: Option<&str>,
        reason_code: Option<&str>,
        limit: u32,
    ) -> Result<Vec<QuarantineItem>, StoreError> {
        let connection = self.lock()?;
        let mut where_clauses = vec!["tenant_id = ?1".to_string()];
        if status.is_some() {
            where_clauses.push("status = ?2".to_string());
        }
        let sql = quarantine_select_sql(&format!(
            "WHERE {} ORDER BY created_at ASC LIMIT {}",
            where_clauses.join(" AND "),
            if status.is_some() { "?3" } else { "?2" }
        ));
        let mut statement = connection.prepare(&sql).map_err(|err| StoreError::Backend(err.to_string()))?;
        let rows = if let Some(status) = status {
            statement.query_map(params![tenant_id.as_str(), status, i64::from(limit)], |row| {
                Ok(quarantine_from_row(row))
            })
        } else {
            statement.query_map(params![tenant_id.as_str(), i64::from(limit)], |row| Ok(quarantine_from_row(row)))
        }
        .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut items = Vec::new();
        for row in rows {
            let item = row.map_err(|err| StoreError::Backend(err.to_string()))?.map_err(StoreError::from)?;
            if let Some(code) = reason_code
                && !item.reason_codes.iter().any(|existing| existing == code)
            {
                continue;
            }
            items.push(item);
        }
        Ok(items)
    }

    fn get_latest_open_quarantine_for_document(
        &self,
        document_id: &DocumentId,
        tenant_id: &TenantId,
    ) -> Result<Option<QuarantineItem>, StoreError> {
        let connection = self.lock()?;
        connection
            .query_row(
                &quarantine_select_sql(
                    "WHERE document_id = ?1 AND tenant_id = ?2 AND resolved_at IS NULL
                    ORDER BY created_at DESC LIMIT 1",
                ),
                params![document_id.as_str(), tenant_id.as_str()],
                |row| Ok(quarantine_from_row(row)),
            )
            .optional()
            .map_err(|err| StoreError::Backend(err.to_string()))?
            .transpose()
            .map_err(StoreError::from)
    }

    fn mark_quarantine_reprocessed(&self, item: &QuarantineItem) -> Result<(), StoreError> {
        let connection = self.lock()?;
        let updated_at = format_timestamp(item.updated_at).map_err(StoreError::from)?;
        let resolved_at = format_timestamp_opt(item.resolved_at).map_err(StoreError::from)?;
        let last_reprocessed_at = format_timestamp_opt(item.last_reprocessed_at).map_err(StoreError::from)?;
        let updated = connection
            .execute(
                "UPDATE quarantine_items SET
                    status = ?1, reprocess_count = ?2, last_reprocessed_at = ?3,
                    updated_at = ?4, resolved_at = ?5
                WHERE id = ?6",
                params![
                    item.status,
                    i64::from(item.reprocess_count),
                    last_reprocessed_at,
                    updated_at,
                    resolved_at,
                    item.id.as_str(),
                ],
            )
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(item.id.to_string()));
        }
        Ok(())
    }
}

/// Builds a `runs` SELECT statement with the given `WHERE`/`ORDER BY`/`LIMIT` suffix.
fn run_select_sql(predicate: &str) -> String {
    format!(
        "SELECT id, document_id, tenant_id, requested_by, idempotency_key, replay_of_run_id,
            status, error_code, model_name, route_name, review_decision,
            review_reason_codes, decision_log, result, validation_issues,
            cancel_requested, created_at, updated_at, finished_at
        FROM runs {predicate}"
    )
}

/// Builds a `quarantine_items` SELECT statement with the given suffix.
fn quarantine_select_sql(predicate: &str) -> String {
    format!(
        "SELECT id, document_id, tenant_id, stage, status, reason_codes, details,
            storage_path, reprocess_count, last_reprocessed_at, created_at, updated_at, resolved_at
        FROM quarantine_items {predicate}"
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn sample_document() -> Document {
        Document {
            id: DocumentId::generate(),
            tenant_id: TenantId::from_raw("tenant-a"),
            filename: "invoice.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 1024,
            storage_path: "raw/doc/invoice.pdf".to_string(),
            language: "en".to_string(),
            ingestion_status: IngestionStatus::Accepted,
            quality_tier: Some("HIGH".to_string()),
            quality_score: Some(0.9),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn sample_run(document_id: DocumentId, tenant_id: TenantId) -> Run {
        let now = OffsetDateTime::now_utc();
        Run {
            id: RunId::generate(),
            document_id,
            tenant_id,
            requested_by: "tester".to_string(),
            idempotency_key: None,
            replay_of_run_id: None,
            status: RunStatus::Queued,
            error_code: None,
            model_name: None,
            route_name: None,
            review_decision: None,
            review_reason_codes: None,
            decision_log: None,
            result: None,
            validation_issues: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[test]
    fn document_round_trips() {
        let store = SqliteRepository::open_in_memory().unwrap();
        let document = sample_document();
        let created = store.create_document(document.clone()).unwrap();
        let fetched = store.get_document(&created.id, Some(&document.tenant_id)).unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.quality_score, Some(0.9));
    }

    #[test]
    fn run_idempotency_key_is_unique_per_tenant() {
        let store = SqliteRepository::open_in_memory().unwrap();
        let document = sample_document();
        store.create_document(document.clone()).unwrap();
        let mut first = sample_run(document.id.clone(), document.tenant_id.clone());
        first.idempotency_key = Some("idem-1".to_string());
        store.create_run(first.clone()).unwrap();

        let mut second = sample_run(document.id.clone(), document.tenant_id.clone());
        second.idempotency_key = Some("idem-1".to_string());
        let err = store.create_run(second).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let found = store.get_run_by_idempotency("idem-1", &document.tenant_id).unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[test]
    fn list_queued_runs_orders_oldest_first() {
        let store = SqliteRepository::open_in_memory().unwrap();
        let document = sample_document();
        store.create_document(document.clone()).unwrap();
        let first = sample_run(document.id.clone(), document.tenant_id.clone());
        store.create_run(first.clone()).unwrap();
        let second = sample_run(document.id.clone(), document.tenant_id.clone());
        store.create_run(second).unwrap();

        let queued = store.list_queued_runs(10).unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, first.id);
    }

    #[test]
    fn stage_upsert_updates_existing_attempt() {
        let store = SqliteRepository::open_in_memory().unwrap();
        let document = sample_document();
        store.create_document(document.clone()).unwrap();
        let run = sample_run(document.id.clone(), document.tenant_id.clone());
        store.create_run(run.clone()).unwrap();

        let mut stage = RunStage {
            run_id: run.id.clone(),
            stage_name: StageName::Ocr,
            attempt: 1,
            status: StageStatus::Running,
            error_code: None,
            details: Map::new(),
            started_at: Some(OffsetDateTime::now_utc()),
            finished_at: None,
        };
        store.upsert_stage(stage.clone()).unwrap();
        stage.status = StageStatus::Succeeded;
        stage.finished_at = Some(OffsetDateTime::now_utc());
        store.upsert_stage(stage).unwrap();

        let stages = store.list_run_stages(&run.id).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Succeeded);
    }

    #[test]
    fn quarantine_lookup_finds_open_item_only() {
        let store = SqliteRepository::open_in_memory().unwrap();
        let document = sample_document();
        store.create_document(document.clone()).unwrap();
        let now = OffsetDateTime::now_utc();
        let item = QuarantineItem {
            id: QuarantineItemId::generate(),
            document_id: document.id.clone(),
            tenant_id: document.tenant_id.clone(),
            stage: "C".to_string(),
            status: "QUARANTINED_LOW_QUALITY".to_string(),
            reason_codes: vec!["OCR_PRECHECK_LOW_CONF".to_string()],
            details: Map::new(),
            storage_path: "quarantine/tenant-a/2026/07/29/doc/invoice.pdf".to_string(),
            reprocess_count: 0,
            last_reprocessed_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        store.create_quarantine_item(item.clone()).unwrap();

        let found = store
            .get_latest_open_quarantine_for_document(&document.id, &document.tenant_id)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, item.id);

        let mut resolved = found;
        resolved.resolved_at = Some(OffsetDateTime::now_utc());
        resolved.updated_at = OffsetDateTime::now_utc();
        store.mark_quarantine_reprocessed(&resolved).unwrap();

        let missing = store
            .get_latest_open_quarantine_for_document(&document.id, &document.tenant_id)
            .unwrap();
        assert!(missing.is_none());
    }
}
