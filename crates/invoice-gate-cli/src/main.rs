// crates/invoice-gate-cli/src/main.rs
// ============================================================================
// Module: Invoice Gate CLI Entry Point
// Description: Command dispatcher wiring config, storage, providers, and the
//              orchestrator into a single-process CLI.
// Purpose: Give operators and tests a way to ingest documents, create/cancel/
//          replay/inspect runs, drain the worker queue, and verify the audit
//          chain without a network-facing service.
// Dependencies: clap, invoice-gate-config, invoice-gate-core,
//               invoice-gate-providers, invoice-gate-store-sqlite, serde_json,
//               thiserror, time, tracing, tracing-subscriber.
// ============================================================================

//! ## Overview
//! The CLI is one of two equivalent drivers of [`Orchestrator::process_run`]
//! (a hypothetical HTTP layer would be the other): every subcommand opens
//! the same `SqliteRepository` + `FilesystemBlobStore` + `FileAuditChain`
//! backends a server process would, so behavior observed here generalizes.
//! Every user-facing line goes through [`write_stdout_line`]/
//! [`write_stderr_line`] rather than `println!`/`eprintln!`, since those
//! macros are denied at the workspace lint level.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use invoice_gate_config::ConfigError;
use invoice_gate_config::InvoiceGateConfig;
use invoice_gate_core::admission::AdmissionError;
use invoice_gate_core::admission::AdmissionOutcome;
use invoice_gate_core::admission::AdmissionService;
use invoice_gate_core::entities::AuditEvent;
use invoice_gate_core::entities::Document;
use invoice_gate_core::entities::QuarantineItem;
use invoice_gate_core::identifiers::DocumentId;
use invoice_gate_core::identifiers::QuarantineItemId;
use invoice_gate_core::identifiers::RunId;
use invoice_gate_core::identifiers::TenantId;
use invoice_gate_core::ingestion::evaluate_ingestion_contract;
use invoice_gate_core::ingestion::IngestionLimits;
use invoice_gate_core::interfaces::AuditError;
use invoice_gate_core::interfaces::AuditSink;
use invoice_gate_core::interfaces::AuditVerification;
use invoice_gate_core::interfaces::StoreError;
use invoice_gate_core::orchestrator::Orchestrator;
use invoice_gate_core::orchestrator::OrchestratorConfig;
use invoice_gate_core::worker::Worker;
use invoice_gate_core::worker::WorkerConfig;
use invoice_gate_providers::FileAuditChain;
use invoice_gate_providers::FilesystemBlobStore;
use invoice_gate_providers::HeuristicExtractionProvider;
use invoice_gate_providers::HeuristicOcrProvider;
use invoice_gate_providers::OcrFallbackMode;
use invoice_gate_store_sqlite::SqliteRepository;
use invoice_gate_store_sqlite::SqliteStoreConfig;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use time::OffsetDateTime;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "invoice-gate", disable_help_subcommand = true)]
struct Cli {
    /// Optional config file path (defaults to `invoice-gate.toml` or the
    /// `INVOICEGATE_CONFIG` env var).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingests a document through the quality gating contract.
    Ingest(IngestArgs),
    /// Run lifecycle commands.
    Run {
        /// Selected run subcommand.
        #[command(subcommand)]
        command: RunCommand,
    },
    /// Drains queued runs through the orchestrator.
    Worker(WorkerArgs),
    /// Audit chain commands.
    Audit {
        /// Selected audit subcommand.
        #[command(subcommand)]
        command: AuditCommand,
    },
}

/// Arguments for the `ingest` command.
#[derive(Args, Debug)]
struct IngestArgs {
    /// Path to the document file to ingest.
    path: PathBuf,
    /// Owning tenant id; defaults to the configured default tenant.
    #[arg(long)]
    tenant: Option<String>,
    /// Declared MIME content type; inferred from the file extension if omitted.
    #[arg(long = "content-type")]
    content_type: Option<String>,
    /// Declared document language.
    #[arg(long, default_value = "en")]
    language: String,
}

/// Run lifecycle subcommands.
#[derive(Subcommand, Debug)]
enum RunCommand {
    /// Admits a new run for an accepted document.
    Create(RunCreateArgs),
    /// Admits a replay of an existing run.
    Replay(RunReplayArgs),
    /// Requests cancellation of a run.
    Cancel(RunRef),
    /// Prints a run's current state.
    Show(RunRef),
}

/// Arguments for `run create`.
#[derive(Args, Debug)]
struct RunCreateArgs {
    /// Owning tenant id; defaults to the configured default tenant.
    #[arg(long)]
    tenant: Option<String>,
    /// Id of the document to run.
    #[arg(long)]
    document: String,
    /// Principal requesting the run.
    #[arg(long, default_value = "cli")]
    requested_by: String,
    /// Client-supplied idempotency key.
    #[arg(long)]
    idempotency_key: Option<String>,
}

/// Arguments for `run replay`.
#[derive(Args, Debug)]
struct RunReplayArgs {
    /// Owning tenant id; defaults to the configured default tenant.
    #[arg(long)]
    tenant: Option<String>,
    /// Id of the run to replay.
    #[arg(long)]
    run: String,
    /// Principal requesting the replay.
    #[arg(long, default_value = "cli")]
    requested_by: String,
}

/// A tenant-scoped reference to an existing run.
#[derive(Args, Debug)]
struct RunRef {
    /// Owning tenant id; defaults to the configured default tenant.
    #[arg(long)]
    tenant: Option<String>,
    /// Id of the run.
    #[arg(long)]
    run: String,
}

/// Arguments for the `worker` command.
#[derive(Args, Debug)]
struct WorkerArgs {
    /// Drain one batch of queued runs and exit, instead of polling forever.
    #[arg(long)]
    once: bool,
}

/// Audit chain subcommands.
#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Verifies the hash chain end to end.
    Verify,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper; every subcommand handler collapses its error sources
/// into this single type.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`] from any displayable source.
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<AdmissionError> for CliError {
    fn from(err: AdmissionError) -> Self {
        Self::new(err.to_string())
    }
}

/// CLI result alias for fallible subcommand handlers.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point, returning a process exit code.
fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Parses arguments, loads configuration, and dispatches the selected
/// subcommand.
fn run() -> CliResult<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = InvoiceGateConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest(args) => command_ingest(&config, args),
        Commands::Run { command } => command_run(&config, command),
        Commands::Worker(args) => command_worker(&config, args),
        Commands::Audit { command } => command_audit(&config, command),
    }
}

/// Installs a `tracing` subscriber honoring `RUST_LOG`, defaulting to `info`.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

// ============================================================================
// SECTION: Backend Wiring
// ============================================================================

/// Opens the SQLite-backed repository at the configured path, creating the
/// database file and schema if necessary.
fn open_repository(config: &InvoiceGateConfig) -> CliResult<SqliteRepository> {
    let store_config = SqliteStoreConfig::new(config.sqlite_path());
    SqliteRepository::open(&store_config).map_err(|err| CliError::new(err.to_string()))
}

/// Builds the filesystem blob store rooted at the configured storage directory.
fn open_blob_store(config: &InvoiceGateConfig) -> FilesystemBlobStore {
    FilesystemBlobStore::new(&config.storage_root)
}

/// Builds the configured audit sink: a hash-chained file sink, or a
/// no-op sink when `audit_log_enabled` is `false`.
fn open_audit_sink(config: &InvoiceGateConfig) -> AuditBackend {
    if !config.audit_log_enabled {
        return AuditBackend::Disabled;
    }
    let log_path = Path::new(&config.storage_root).join("audit").join("events.log");
    AuditBackend::File(FileAuditChain::new(log_path, config.audit_mask_fields.clone()))
}

/// Builds the configured OCR provider.
fn open_ocr_provider(config: &InvoiceGateConfig) -> HeuristicOcrProvider {
    let fallback_mode = match config.ocr_fallback_mode.as_str() {
        "fail_closed" => OcrFallbackMode::FailClosed,
        _ => OcrFallbackMode::Deterministic,
    };
    HeuristicOcrProvider::new(fallback_mode)
}

/// An [`AuditSink`] that either writes to a real hash chain or silently
/// discards events, selected by `InvoiceGateConfig::audit_log_enabled`.
enum AuditBackend {
    /// Persists to a file-backed hash chain.
    File(FileAuditChain),
    /// Discards every event; used when the audit log is turned off.
    Disabled,
}

impl AuditSink for AuditBackend {
    fn append(
        &self,
        event_type: &str,
        run_id: Option<&RunId>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AuditEvent, AuditError> {
        match self {
            Self::File(chain) => chain.append(event_type, run_id, payload),
            Self::Disabled => Ok(disabled_audit_event(event_type, run_id)),
        }
    }

    fn read_events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        match self {
            Self::File(chain) => chain.read_events(),
            Self::Disabled => Ok(Vec::new()),
        }
    }

    fn verify(&self) -> Result<AuditVerification, AuditError> {
        match self {
            Self::File(chain) => chain.verify(),
            Self::Disabled => Ok(AuditVerification {
                valid: true,
                events_checked: 0,
                head_hash: None,
                first_error_index: None,
                error: None,
            }),
        }
    }
}

/// Builds the synthetic, unchained event returned by a disabled audit sink.
fn disabled_audit_event(event_type: &str, run_id: Option<&RunId>) -> AuditEvent {
    AuditEvent {
        timestamp_utc: OffsetDateTime::now_utc().to_string(),
        event_type: event_type.to_string(),
        run_id: run_id.map(ToString::to_string),
        payload: std::collections::BTreeMap::new(),
        prev_hash: "DISABLED".to_string(),
        hash: "DISABLED".to_string(),
    }
}

/// Translates config into the ingestion contract's limits.
fn ingestion_limits(config: &InvoiceGateConfig) -> IngestionLimits {
    IngestionLimits {
        allowed_mime_types: config.allowed_mime_types.clone(),
        max_upload_size_bytes: config.max_upload_size_bytes,
        max_pdf_pages: u64::from(config.max_pdf_pages),
        max_xlsx_rows_per_sheet: u64::from(config.max_xlsx_rows_per_sheet),
        quarantine_low_quality: config.quarantine_low_quality,
    }
}

/// Translates config into the orchestrator's configuration.
fn orchestrator_config(config: &InvoiceGateConfig) -> OrchestratorConfig {
    OrchestratorConfig {
        stage_timeout: Duration::from_secs(config.stage_timeout_seconds),
        run_timeout: Duration::from_secs(config.run_timeout_seconds),
        max_stage_attempts: config.max_stage_attempts,
        low_extraction_confidence_threshold: config.low_confidence_threshold,
        low_ocr_confidence_threshold: config.low_ocr_confidence_threshold,
        allowed_currencies: config.allowed_currencies.clone(),
        review_thresholds: config.review_thresholds(),
        version_snapshot: config.version_snapshot(),
    }
}

/// Resolves a tenant id from an optional CLI flag, falling back to the
/// configured default tenant.
fn resolve_tenant(config: &InvoiceGateConfig, tenant: Option<String>) -> TenantId {
    TenantId::from_raw(tenant.unwrap_or_else(|| config.default_tenant_id.clone()))
}

/// Guesses a MIME content type from a filename's extension, for the common
/// invoice document formats the ingestion contract recognizes.
fn guess_content_type(filename: &str) -> String {
    let lower = filename.to_lowercase();
    if lower.ends_with(".pdf") {
        "application/pdf".to_string()
    } else if lower.ends_with(".png") {
        "image/png".to_string()
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg".to_string()
    } else if lower.ends_with(".webp") {
        "image/webp".to_string()
    } else if lower.ends_with(".xlsx") {
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

// ============================================================================
// SECTION: Ingest Command
// ============================================================================

/// Executes the `ingest` command: runs the ingestion contract over a file on
/// disk, stores the blob, and persists the resulting document (and, if
/// quarantined, a quarantine item).
fn command_ingest(config: &InvoiceGateConfig, args: IngestArgs) -> CliResult<ExitCode> {
    let repository = open_repository(config)?;
    let blob_store = open_blob_store(config);
    let audit_sink = open_audit_sink(config);

    let bytes = fs::read(&args.path).map_err(|err| CliError::new(format!("failed to read {}: {err}", args.path.display())))?;
    let filename = args
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let content_type = args.content_type.unwrap_or_else(|| guess_content_type(&filename));
    let tenant_id = resolve_tenant(config, args.tenant);

    let limits = ingestion_limits(config);
    let contract = evaluate_ingestion_contract(&bytes, &filename, &content_type, &limits);

    let document_id = DocumentId::generate();
    let storage_path = format!("raw/{document_id}/{filename}");
    blob_store.put(&storage_path, &bytes).map_err(|err| CliError::new(err.to_string()))?;

    let size_bytes = u64::try_from(bytes.len()).map_err(|err| CliError::new(err.to_string()))?;
    let now = OffsetDateTime::now_utc();
    let document = Document {
        id: document_id,
        tenant_id: tenant_id.clone(),
        filename,
        content_type,
        size_bytes,
        storage_path: storage_path.clone(),
        language: args.language,
        ingestion_status: contract.decision.document_status(),
        quality_tier: contract.quality_tier.clone(),
        quality_score: contract.quality_score,
        created_at: now,
    };
    let created = repository.create_document(document)?;

    let mut payload = serde_json::Map::new();
    payload.insert("document_id".to_string(), json!(created.id.to_string()));
    payload.insert("decision".to_string(), json!(format!("{:?}", contract.decision)));
    payload.insert("reason_codes".to_string(), json!(contract.reason_codes));
    audit_sink
        .append("document_ingested", None, payload)
        .map_err(|err| CliError::new(err.to_string()))?;

    if let Some(status) = contract.quarantine_status() {
        let item = QuarantineItem {
            id: QuarantineItemId::generate(),
            document_id: created.id.clone(),
            tenant_id,
            stage: format!("{:?}", contract.stage),
            status: status.to_string(),
            reason_codes: contract.reason_codes.clone(),
            storage_path,
            details: contract.details.clone(),
            reprocess_count: 0,
            last_reprocessed_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        repository.create_quarantine_item(item)?;
    }

    write_stdout_json(&created)
}

// ============================================================================
// SECTION: Run Commands
// ============================================================================

/// Dispatches a `run` subcommand.
fn command_run(config: &InvoiceGateConfig, command: RunCommand) -> CliResult<ExitCode> {
    match command {
        RunCommand::Create(args) => command_run_create(config, args),
        RunCommand::Replay(args) => command_run_replay(config, args),
        RunCommand::Cancel(args) => command_run_cancel(config, args),
        RunCommand::Show(args) => command_run_show(config, args),
    }
}

/// Executes `run create`: admits a new run and, unless the configured
/// execution mode leaves it for the worker, drives it to completion inline.
fn command_run_create(config: &InvoiceGateConfig, args: RunCreateArgs) -> CliResult<ExitCode> {
    let repository = open_repository(config)?;
    let blob_store = open_blob_store(config);
    let audit_sink = open_audit_sink(config);
    let ocr_provider = open_ocr_provider(config);
    let extraction_provider = HeuristicExtractionProvider;

    let tenant_id = resolve_tenant(config, args.tenant);
    let document_id = DocumentId::from_raw(args.document);
    let admission = AdmissionService::new(&repository, &audit_sink, config.admission_thresholds(), config.execution_mode);
    let outcome = admission.create_run(&tenant_id, &document_id, &args.requested_by, args.idempotency_key.as_deref())?;

    dispatch_if_inline(
        &repository,
        &blob_store,
        &audit_sink,
        &ocr_provider,
        &extraction_provider,
        config,
        &outcome,
    );
    write_stdout_json(&outcome.run)
}

/// Executes `run replay`: admits a replay of an existing run and, unless the
/// configured execution mode leaves it for the worker, drives it to
/// completion inline.
fn command_run_replay(config: &InvoiceGateConfig, args: RunReplayArgs) -> CliResult<ExitCode> {
    let repository = open_repository(config)?;
    let blob_store = open_blob_store(config);
    let audit_sink = open_audit_sink(config);
    let ocr_provider = open_ocr_provider(config);
    let extraction_provider = HeuristicExtractionProvider;

    let tenant_id = resolve_tenant(config, args.tenant);
    let run_id = RunId::from_raw(args.run);
    let admission = AdmissionService::new(&repository, &audit_sink, config.admission_thresholds(), config.execution_mode);
    let outcome = admission.replay_run(&tenant_id, &run_id, &args.requested_by)?;

    dispatch_if_inline(
        &repository,
        &blob_store,
        &audit_sink,
        &ocr_provider,
        &extraction_provider,
        config,
        &outcome,
    );
    write_stdout_json(&outcome.run)
}

/// Dispatches a freshly admitted run through the orchestrator inline, if the
/// configured execution mode calls for it.
fn dispatch_if_inline(
    repository: &SqliteRepository,
    blob_store: &FilesystemBlobStore,
    audit_sink: &AuditBackend,
    ocr_provider: &HeuristicOcrProvider,
    extraction_provider: &HeuristicExtractionProvider,
    config: &InvoiceGateConfig,
    outcome: &AdmissionOutcome,
) {
    if !outcome.dispatch_inline {
        return;
    }
    let orchestrator = Orchestrator::new(
        repository,
        blob_store,
        audit_sink,
        ocr_provider,
        extraction_provider,
        orchestrator_config(config),
    );
    orchestrator.process_run(&outcome.run.id, "cli-inline");
}

/// Executes `run cancel`.
fn command_run_cancel(config: &InvoiceGateConfig, args: RunRef) -> CliResult<ExitCode> {
    let repository = open_repository(config)?;
    let audit_sink = open_audit_sink(config);
    let tenant_id = resolve_tenant(config, args.tenant);
    let run_id = RunId::from_raw(args.run);

    let admission = AdmissionService::new(&repository, &audit_sink, config.admission_thresholds(), config.execution_mode);
    let run = admission.cancel_run(&tenant_id, &run_id)?;
    write_stdout_json(&run)
}

/// Executes `run show`.
fn command_run_show(config: &InvoiceGateConfig, args: RunRef) -> CliResult<ExitCode> {
    let repository = open_repository(config)?;
    let tenant_id = resolve_tenant(config, args.tenant);
    let run_id = RunId::from_raw(args.run);

    let run = repository
        .get_run(&run_id, Some(&tenant_id))?
        .ok_or_else(|| CliError::new(format!("run not found: {run_id}")))?;
    write_stdout_json(&run)
}

// ============================================================================
// SECTION: Worker Command
// ============================================================================

/// Executes the `worker` command: drains one batch of queued runs, or polls
/// forever when `--once` is not given.
fn command_worker(config: &InvoiceGateConfig, args: WorkerArgs) -> CliResult<ExitCode> {
    let repository = open_repository(config)?;
    let blob_store = open_blob_store(config);
    let audit_sink = open_audit_sink(config);
    let ocr_provider = open_ocr_provider(config);
    let extraction_provider = HeuristicExtractionProvider;

    let orchestrator = Orchestrator::new(
        &repository,
        &blob_store,
        &audit_sink,
        &ocr_provider,
        &extraction_provider,
        orchestrator_config(config),
    );
    let worker_config = WorkerConfig {
        poll_interval: Duration::from_secs_f64(config.worker_poll_seconds),
        batch_size: config.worker_batch_size,
    };
    let worker = Worker::new(&repository, &orchestrator, worker_config, "cli-worker");

    if args.once {
        let processed = worker.drain_once();
        write_stdout_line(&format!("processed {processed} run(s)"))?;
        Ok(ExitCode::SUCCESS)
    } else {
        worker.run_forever()
    }
}

// ============================================================================
// SECTION: Audit Command
// ============================================================================

/// Dispatches an `audit` subcommand.
fn command_audit(config: &InvoiceGateConfig, command: AuditCommand) -> CliResult<ExitCode> {
    match command {
        AuditCommand::Verify => command_audit_verify(config),
    }
}

/// Executes `audit verify`.
fn command_audit_verify(config: &InvoiceGateConfig) -> CliResult<ExitCode> {
    let audit_sink = open_audit_sink(config);
    let verification = audit_sink.verify().map_err(|err| CliError::new(err.to_string()))?;
    let valid = verification.valid;
    write_stdout_json(&verification)?;
    Ok(if valid { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> CliResult<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}").map_err(|err| CliError::new(output_error("stdout", &err)))
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Serializes `value` as pretty-printed JSON and writes it to stdout.
fn write_stdout_json<T: Serialize>(value: &T) -> CliResult<ExitCode> {
    let rendered = serde_json::to_string_pretty(value).map_err(|err| CliError::new(err.to_string()))?;
    write_stdout_line(&rendered)?;
    Ok(ExitCode::SUCCESS)
}

/// Formats an output-stream write failure.
fn output_error(stream: &str, error: &std::io::Error) -> String {
    format!("failed to write to {stream}: {error}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
