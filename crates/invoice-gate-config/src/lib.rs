// crates/invoice-gate-config/src/lib.rs
// ============================================================================
// Module: Invoice Gate Config
// Description: Typed configuration loaded from an optional TOML file with
//              environment-variable overrides, plus validate-then-freeze.
// Purpose: Single source of truth for invoice-gate.toml / INVOICEGATE_* env
//          semantics, and the conversions other crates need from it.
// Dependencies: invoice-gate-core, serde, serde_json, thiserror, toml
// ============================================================================

//! ## Overview
//! [`InvoiceGateConfig::load`] resolves a config file path (explicit argument,
//! `INVOICEGATE_CONFIG` env var, or the default filename), parses it as TOML
//! if present, then applies `INVOICEGATE_<FIELD>` environment overrides on
//! top — environment wins over file, matching the original system's
//! `os.getenv`-first configuration model. The result is validated once and
//! handed back as an owned, immutable value; there is no in-place mutation
//! after `load` returns.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use invoice_gate_core::admission::AdmissionThresholds;
use invoice_gate_core::admission::ExecutionMode;
use invoice_gate_core::review::ReviewThresholds;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "invoice-gate.toml";
/// Environment variable used to override the config file path.
const CONFIG_PATH_ENV_VAR: &str = "INVOICEGATE_CONFIG";
/// Prefix every other environment override carries.
const ENV_PREFIX: &str = "INVOICEGATE_";
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;
/// Maximum total path length accepted for the config file path.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while loading or validating [`InvoiceGateConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading the configuration file.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Raw (file) representation
// ============================================================================

/// Mirrors [`InvoiceGateConfig`] with every field optional, for TOML
/// deserialization. Absent fields fall through to the environment, then to
/// the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    environment: Option<String>,
    app_name: Option<String>,
    app_version: Option<String>,
    db_url: Option<String>,
    storage_root: Option<String>,
    jwt_secret: Option<String>,
    jwt_alg: Option<String>,
    token_exp_minutes: Option<u32>,
    rate_limit_per_minute: Option<u32>,
    default_tenant_id: Option<String>,
    execution_mode: Option<String>,
    queue_warn_depth: Option<u64>,
    queue_reject_depth: Option<u64>,
    max_stage_attempts: Option<u32>,
    stage_timeout_seconds: Option<u64>,
    run_timeout_seconds: Option<u64>,
    worker_poll_seconds: Option<f64>,
    worker_batch_size: Option<u32>,
    low_confidence_threshold: Option<f64>,
    low_ocr_confidence_threshold: Option<f64>,
    required_field_coverage_threshold: Option<f64>,
    evidence_coverage_threshold: Option<f64>,
    max_upload_size_bytes: Option<u64>,
    max_pdf_pages: Option<u32>,
    max_xlsx_rows_per_sheet: Option<u32>,
    quarantine_low_quality: Option<bool>,
    allowed_mime_types: Option<Vec<String>>,
    allowed_currencies: Option<Vec<String>>,
    calibration_uncertainty_threshold: Option<f64>,
    calibration_risk_threshold: Option<f64>,
    critical_false_accept_ceiling: Option<f64>,
    prompt_version: Option<String>,
    template_version: Option<String>,
    routing_version: Option<String>,
    policy_version: Option<String>,
    model_version: Option<String>,
    model_runtime: Option<String>,
    model_quantization: Option<String>,
    decoding_temperature: Option<f64>,
    decoding_top_p: Option<f64>,
    config_bundle_root: Option<String>,
    audit_log_enabled: Option<bool>,
    audit_mask_fields: Option<Vec<String>>,
    ocr_fallback_mode: Option<String>,
}

// ============================================================================
// SECTION: Configuration Type
// ============================================================================

/// Fully resolved, validated Invoice Gate configuration.
#[derive(Debug, Clone)]
pub struct InvoiceGateConfig {
    /// Deployment environment name (`dev`, `test`, `staging`, `prod`, ...).
    pub environment: String,
    /// Human-facing application name, carried into logs and audit metadata.
    pub app_name: String,
    /// Application version string.
    pub app_version: String,
    /// SQLite connection string, e.g. `sqlite:///./invoice-gate.db`.
    pub db_url: String,
    /// Root directory the filesystem blob store writes under.
    pub storage_root: String,
    /// Secret used to sign any future auth tokens; must not be the default
    /// value in `prod`/`production`.
    pub jwt_secret: String,
    /// JWT signing algorithm identifier, carried for a future auth layer.
    pub jwt_alg: String,
    /// Token expiry in minutes, carried for a future auth layer.
    pub token_exp_minutes: u32,
    /// Requests-per-minute rate limit, carried for a future HTTP layer.
    pub rate_limit_per_minute: u32,
    /// Tenant id used when a caller supplies none.
    pub default_tenant_id: String,
    /// How admitted runs are handed off for execution.
    pub execution_mode: ExecutionMode,
    /// Per-tenant queued-run count at which admission signals backpressure.
    pub queue_warn_depth: u64,
    /// Per-tenant queued-run count at which admission rejects outright.
    pub queue_reject_depth: u64,
    /// Maximum attempts for a retryable pipeline stage.
    pub max_stage_attempts: u32,
    /// Wall-clock deadline for a single stage attempt, in seconds.
    pub stage_timeout_seconds: u64,
    /// Wall-clock budget for an entire run, in seconds.
    pub run_timeout_seconds: u64,
    /// Worker poll interval when idle, in seconds.
    pub worker_poll_seconds: f64,
    /// Maximum queued runs the worker drains per poll cycle.
    pub worker_batch_size: u32,
    /// Extraction confidence floor below which `LOW_EXTRACTION_CONFIDENCE` fires.
    pub low_confidence_threshold: f64,
    /// OCR confidence floor below which `LOW_OCR_CONFIDENCE` fires.
    pub low_ocr_confidence_threshold: f64,
    /// Review policy Gate 1 required-field coverage floor.
    pub required_field_coverage_threshold: f64,
    /// Review policy Gate 3 evidence coverage floor.
    pub evidence_coverage_threshold: f64,
    /// Maximum accepted upload size in bytes.
    pub max_upload_size_bytes: u64,
    /// Maximum accepted PDF page count.
    pub max_pdf_pages: u32,
    /// Maximum accepted XLSX rows per sheet.
    pub max_xlsx_rows_per_sheet: u32,
    /// Whether low-quality documents are quarantined rather than rejected.
    pub quarantine_low_quality: bool,
    /// MIME types the ingestion contract accepts.
    pub allowed_mime_types: Vec<String>,
    /// Currency codes the review policy's consistency gate accepts.
    pub allowed_currencies: Vec<String>,
    /// Review policy Gate 5 uncertainty threshold.
    pub calibration_uncertainty_threshold: f64,
    /// Review policy Gate 5 risk threshold.
    pub calibration_risk_threshold: f64,
    /// Target false-accept ceiling for critical fields, carried for
    /// calibration reporting; not enforced by any gate directly.
    pub critical_false_accept_ceiling: f64,
    /// Prompt template version folded into the decision log's `versions` block.
    pub prompt_version: String,
    /// Extraction template version folded into the decision log.
    pub template_version: String,
    /// Routing table version folded into the decision log.
    pub routing_version: String,
    /// Review policy version folded into the decision log.
    pub policy_version: String,
    /// Extraction model version folded into the decision log.
    pub model_version: String,
    /// Model runtime identifier folded into the decision log.
    pub model_runtime: String,
    /// Model quantization identifier folded into the decision log.
    pub model_quantization: String,
    /// Decoding temperature folded into the decision log.
    pub decoding_temperature: f64,
    /// Decoding top-p folded into the decision log.
    pub decoding_top_p: f64,
    /// Root directory for static config bundles (field catalog, templates).
    pub config_bundle_root: String,
    /// Whether the audit chain sink is active.
    pub audit_log_enabled: bool,
    /// Payload key names (case-insensitive) masked before audit persistence.
    pub audit_mask_fields: Vec<String>,
    /// Behavior when no real OCR engine can decode a document:
    /// `"deterministic"` or `"fail_closed"`.
    pub ocr_fallback_mode: String,
}

impl InvoiceGateConfig {
    /// Loads configuration from `path` (or the default resolution rules if
    /// `None`), applies environment overrides, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if a resolved, existing file cannot be
    /// read, [`ConfigError::Parse`] if it is not valid TOML, or
    /// [`ConfigError::Invalid`] if path limits or field validation fail.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match resolve_existing_path(path)? {
            Some(resolved) => read_raw_config(&resolved)?,
            None => RawConfig::default(),
        };
        let config = Self::from_raw(raw);
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Self {
        Self {
            environment: resolve_string("ENV", raw.environment, "dev"),
            app_name: resolve_string("APP_NAME", raw.app_name, "Invoice Gate"),
            app_version: resolve_string("APP_VERSION", raw.app_version, "0.1.0"),
            db_url: resolve_string("DB_URL", raw.db_url, "sqlite:///./invoice-gate.db"),
            storage_root: resolve_string("STORAGE_ROOT", raw.storage_root, "storage"),
            jwt_secret: resolve_string("JWT_SECRET", raw.jwt_secret, DEFAULT_JWT_SECRET),
            jwt_alg: resolve_string("JWT_ALG", raw.jwt_alg, "HS256"),
            token_exp_minutes: resolve_u32("TOKEN_EXP_MINUTES", raw.token_exp_minutes, 120),
            rate_limit_per_minute: resolve_u32("RATE_LIMIT_PER_MINUTE", raw.rate_limit_per_minute, 60),
            default_tenant_id: resolve_string("DEFAULT_TENANT_ID", raw.default_tenant_id, "default"),
            execution_mode: parse_execution_mode(&resolve_string(
                "EXECUTION_MODE",
                raw.execution_mode,
                "background",
            )),
            queue_warn_depth: resolve_u64("QUEUE_WARN_DEPTH", raw.queue_warn_depth, 10),
            queue_reject_depth: resolve_u64("QUEUE_REJECT_DEPTH", raw.queue_reject_depth, 25),
            max_stage_attempts: resolve_u32("MAX_STAGE_ATTEMPTS", raw.max_stage_attempts, 2),
            stage_timeout_seconds: resolve_u64("STAGE_TIMEOUT_SECONDS", raw.stage_timeout_seconds, 20),
            run_timeout_seconds: resolve_u64("RUN_TIMEOUT_SECONDS", raw.run_timeout_seconds, 120),
            worker_poll_seconds: resolve_f64("WORKER_POLL_SECONDS", raw.worker_poll_seconds, 0.75),
            worker_batch_size: resolve_u32("WORKER_BATCH_SIZE", raw.worker_batch_size, 4),
            low_confidence_threshold: resolve_f64("LOW_CONFIDENCE_THRESHOLD", raw.low_confidence_threshold, 0.60),
            low_ocr_confidence_threshold: resolve_f64(
                "LOW_OCR_CONFIDENCE_THRESHOLD",
                raw.low_ocr_confidence_threshold,
                0.55,
            ),
            required_field_coverage_threshold: resolve_f64(
                "REQUIRED_FIELD_COVERAGE_THRESHOLD",
                raw.required_field_coverage_threshold,
                0.80,
            ),
            evidence_coverage_threshold: resolve_f64(
                "EVIDENCE_COVERAGE_THRESHOLD",
                raw.evidence_coverage_threshold,
                0.90,
            ),
            max_upload_size_bytes: resolve_u64(
                "MAX_UPLOAD_SIZE_BYTES",
                raw.max_upload_size_bytes,
                25 * 1024 * 1024,
            ),
            max_pdf_pages: resolve_u32("MAX_PDF_PAGES", raw.max_pdf_pages, 50),
            max_xlsx_rows_per_sheet: resolve_u32("MAX_XLSX_ROWS_PER_SHEET", raw.max_xlsx_rows_per_sheet, 20_000),
            quarantine_low_quality: resolve_bool("QUARANTINE_LOW_QUALITY", raw.quarantine_low_quality, false),
            allowed_mime_types: resolve_csv(
                "ALLOWED_MIME_TYPES",
                raw.allowed_mime_types,
                &[
                    "application/pdf",
                    "image/png",
                    "image/jpeg",
                    "image/webp",
                    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                ],
                false,
            ),
            allowed_currencies: resolve_csv("ALLOWED_CURRENCIES", raw.allowed_currencies, &["USD", "EUR", "IRR"], true),
            calibration_uncertainty_threshold: resolve_f64(
                "CALIBRATION_UNCERTAINTY_THRESHOLD",
                raw.calibration_uncertainty_threshold,
                0.40,
            ),
            calibration_risk_threshold: resolve_f64("CALIBRATION_RISK_THRESHOLD", raw.calibration_risk_threshold, 0.30),
            critical_false_accept_ceiling: resolve_f64(
                "CRITICAL_FALSE_ACCEPT_CEILING",
                raw.critical_false_accept_ceiling,
                0.001,
            ),
            prompt_version: resolve_string("PROMPT_VERSION", raw.prompt_version, "PRM-20260209-v1"),
            template_version: resolve_string("TEMPLATE_VERSION", raw.template_version, "TPL-20260209-v1"),
            routing_version: resolve_string("ROUTING_VERSION", raw.routing_version, "RTE-20260209-v1"),
            policy_version: resolve_string("POLICY_VERSION", raw.policy_version, "POL-20260209-v1"),
            model_version: resolve_string("MODEL_VERSION", raw.model_version, "MOD-qwen2.5-7b-instruct-20260209-v1"),
            model_runtime: resolve_string("MODEL_RUNTIME", raw.model_runtime, "local"),
            model_quantization: resolve_string("MODEL_QUANTIZATION", raw.model_quantization, "q4"),
            decoding_temperature: resolve_f64("DECODING_TEMPERATURE", raw.decoding_temperature, 0.1),
            decoding_top_p: resolve_f64("DECODING_TOP_P", raw.decoding_top_p, 0.9),
            config_bundle_root: resolve_string("CONFIG_BUNDLE_ROOT", raw.config_bundle_root, "config"),
            audit_log_enabled: resolve_bool("AUDIT_LOG_ENABLED", raw.audit_log_enabled, true),
            audit_mask_fields: resolve_csv(
                "AUDIT_MASK_FIELDS",
                raw.audit_mask_fields,
                &["password", "token", "bank_account", "tax_id"],
                false,
            ),
            ocr_fallback_mode: resolve_string("OCR_FALLBACK_MODE", raw.ocr_fallback_mode, "deterministic"),
        }
    }

    /// Validates internal consistency of every field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first failing
    /// constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const VALID_ENVIRONMENTS: &[&str] = &["local", "dev", "test", "staging", "prod", "production"];
        if !VALID_ENVIRONMENTS.contains(&self.environment.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!("invalid environment: {}", self.environment)));
        }

        if self.queue_reject_depth <= self.queue_warn_depth {
            return Err(ConfigError::Invalid(
                "queue_reject_depth must be > queue_warn_depth".to_string(),
            ));
        }
        if self.max_stage_attempts < 1 {
            return Err(ConfigError::Invalid("max_stage_attempts must be >= 1".to_string()));
        }
        if self.stage_timeout_seconds < 1 {
            return Err(ConfigError::Invalid("stage_timeout_seconds must be >= 1".to_string()));
        }
        if self.run_timeout_seconds < self.stage_timeout_seconds {
            return Err(ConfigError::Invalid(
                "run_timeout_seconds must be >= stage_timeout_seconds".to_string(),
            ));
        }
        if self.worker_poll_seconds <= 0.0 {
            return Err(ConfigError::Invalid("worker_poll_seconds must be > 0".to_string()));
        }
        if self.worker_batch_size < 1 {
            return Err(ConfigError::Invalid("worker_batch_size must be >= 1".to_string()));
        }

        let unit_interval_fields: [(&str, f64); 9] = [
            ("low_confidence_threshold", self.low_confidence_threshold),
            ("low_ocr_confidence_threshold", self.low_ocr_confidence_threshold),
            ("required_field_coverage_threshold", self.required_field_coverage_threshold),
            ("evidence_coverage_threshold", self.evidence_coverage_threshold),
            ("calibration_uncertainty_threshold", self.calibration_uncertainty_threshold),
            ("calibration_risk_threshold", self.calibration_risk_threshold),
            ("critical_false_accept_ceiling", self.critical_false_accept_ceiling),
            ("decoding_temperature", self.decoding_temperature),
            ("decoding_top_p", self.decoding_top_p),
        ];
        for (name, value) in unit_interval_fields {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be between 0 and 1")));
            }
        }

        if self.max_upload_size_bytes == 0 {
            return Err(ConfigError::Invalid("max_upload_size_bytes must be > 0".to_string()));
        }
        if self.max_pdf_pages == 0 {
            return Err(ConfigError::Invalid("max_pdf_pages must be > 0".to_string()));
        }
        if self.max_xlsx_rows_per_sheet == 0 {
            return Err(ConfigError::Invalid("max_xlsx_rows_per_sheet must be > 0".to_string()));
        }
        if self.allowed_mime_types.is_empty() {
            return Err(ConfigError::Invalid("allowed_mime_types must not be empty".to_string()));
        }
        if self.allowed_currencies.is_empty() {
            return Err(ConfigError::Invalid("allowed_currencies must not be empty".to_string()));
        }
        if !matches!(self.ocr_fallback_mode.as_str(), "deterministic" | "fail_closed") {
            return Err(ConfigError::Invalid(format!(
                "invalid ocr_fallback_mode: {}",
                self.ocr_fallback_mode
            )));
        }

        let env_lower = self.environment.to_lowercase();
        if (env_lower == "prod" || env_lower == "production") && self.jwt_secret == DEFAULT_JWT_SECRET {
            return Err(ConfigError::Invalid(
                "jwt_secret must be changed in production".to_string(),
            ));
        }

        Ok(())
    }

    /// Review policy gate thresholds derived from this config.
    #[must_use]
    pub const fn review_thresholds(&self) -> ReviewThresholds {
        ReviewThresholds {
            required_field_coverage_threshold: self.required_field_coverage_threshold,
            evidence_coverage_threshold: self.evidence_coverage_threshold,
            uncertainty_threshold: self.calibration_uncertainty_threshold,
            risk_threshold: self.calibration_risk_threshold,
        }
    }

    /// Admission queue-depth thresholds derived from this config.
    #[must_use]
    pub const fn admission_thresholds(&self) -> AdmissionThresholds {
        AdmissionThresholds {
            queue_warn_depth: self.queue_warn_depth,
            queue_reject_depth: self.queue_reject_depth,
        }
    }

    /// The static version/route metadata folded into the review policy's
    /// `decision_log.versions` block.
    #[must_use]
    pub fn version_snapshot(&self) -> BTreeMap<String, Value> {
        let mut snapshot = BTreeMap::new();
        snapshot.insert("prompt_version".to_string(), Value::String(self.prompt_version.clone()));
        snapshot.insert(
            "template_version".to_string(),
            Value::String(self.template_version.clone()),
        );
        snapshot.insert(
            "routing_version".to_string(),
            Value::String(self.routing_version.clone()),
        );
        snapshot.insert("policy_version".to_string(), Value::String(self.policy_version.clone()));
        snapshot.insert("model_version".to_string(), Value::String(self.model_version.clone()));
        snapshot.insert("model_runtime".to_string(), Value::String(self.model_runtime.clone()));
        snapshot.insert(
            "model_quantization".to_string(),
            Value::String(self.model_quantization.clone()),
        );
        snapshot.insert(
            "decoding_temperature".to_string(),
            serde_json::json!(self.decoding_temperature),
        );
        snapshot.insert("decoding_top_p".to_string(), serde_json::json!(self.decoding_top_p));
        snapshot
    }

    /// The filesystem path a `sqlite:///<path>` connection string names.
    #[must_use]
    pub fn sqlite_path(&self) -> PathBuf {
        PathBuf::from(
            self.db_url
                .strip_prefix("sqlite:///")
                .or_else(|| self.db_url.strip_prefix("sqlite://"))
                .unwrap_or(&self.db_url),
        )
    }
}

/// The placeholder secret that must not survive into a production environment.
const DEFAULT_JWT_SECRET: &str = "change-this-in-prod";

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config file path and returns it only if it exists on disk —
/// an absent config file is not an error, since every field has a built-in
/// default.
fn resolve_existing_path(path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let resolved = match path {
        Some(path) => path.to_path_buf(),
        None => match env::var(CONFIG_PATH_ENV_VAR) {
            Ok(env_path) => PathBuf::from(env_path),
            Err(_) => PathBuf::from(DEFAULT_CONFIG_NAME),
        },
    };
    validate_path(&resolved)?;
    if resolved.exists() {
        Ok(Some(resolved))
    } else {
        Ok(None)
    }
}

/// Validates a config path against length limits before it is ever opened.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Reads and parses a config file already known to exist, enforcing the size
/// cap and UTF-8 requirement.
fn read_raw_config(path: &Path) -> Result<RawConfig, ConfigError> {
    let metadata = fs::metadata(path).map_err(|err| ConfigError::Io(err.to_string()))?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
    }
    let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
    let content = std::str::from_utf8(&bytes).map_err(|_err| ConfigError::Invalid("config file must be utf-8".to_string()))?;
    toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
}

/// Resolves a string field: environment override, then TOML value, then
/// built-in default.
fn resolve_string(suffix: &str, toml_value: Option<String>, default: &str) -> String {
    env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .or(toml_value)
        .unwrap_or_else(|| default.to_string())
}

/// Resolves a `u64` field the same way as [`resolve_string`], falling back to
/// `default` if neither source parses.
fn resolve_u64(suffix: &str, toml_value: Option<u64>, default: u64) -> u64 {
    env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .or(toml_value)
        .unwrap_or(default)
}

/// Resolves a `u32` field the same way as [`resolve_string`].
fn resolve_u32(suffix: &str, toml_value: Option<u32>, default: u32) -> u32 {
    env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .or(toml_value)
        .unwrap_or(default)
}

/// Resolves an `f64` field the same way as [`resolve_string`].
fn resolve_f64(suffix: &str, toml_value: Option<f64>, default: f64) -> f64 {
    env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .and_then(|raw| raw.parse::<f64>().ok())
        .or(toml_value)
        .unwrap_or(default)
}

/// Resolves a boolean field using the original system's truthy-string set
/// (`1`, `true`, `yes`, `on`, case-insensitive).
fn resolve_bool(suffix: &str, toml_value: Option<bool>, default: bool) -> bool {
    if let Ok(raw) = env::var(format!("{ENV_PREFIX}{suffix}")) {
        return is_truthy(&raw);
    }
    toml_value.unwrap_or(default)
}

/// Returns whether `value` is one of the original system's truthy tokens.
fn is_truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Resolves a comma-separated list field, trimming and dropping empty
/// entries, optionally upper-casing each entry (used for currency codes).
fn resolve_csv(suffix: &str, toml_value: Option<Vec<String>>, defaults: &[&str], uppercase: bool) -> Vec<String> {
    let raw_list = match env::var(format!("{ENV_PREFIX}{suffix}")) {
        Ok(raw) => Some(split_csv(&raw)),
        Err(_) => toml_value,
    }
    .unwrap_or_else(|| defaults.iter().map(ToString::to_string).collect());
    raw_list
        .into_iter()
        .map(|entry| if uppercase { entry.to_uppercase() } else { entry })
        .collect()
}

/// Splits a comma-separated string into trimmed, non-empty parts.
fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parses the execution mode string, defaulting to [`ExecutionMode::Background`]
/// for any unrecognized value (validation rejects unrecognized values before
/// this would matter in practice).
fn parse_execution_mode(value: &str) -> ExecutionMode {
    match value {
        "worker" => ExecutionMode::Worker,
        "hybrid" => ExecutionMode::Hybrid,
        _ => ExecutionMode::Background,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
#[allow(unsafe_code, reason = "env::set_var/remove_var are unsafe; tests serialize access under ENV_LOCK")]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for (key, _) in env::vars() {
            if key.starts_with(ENV_PREFIX) {
                // SAFETY: tests run serially under ENV_LOCK.
                unsafe {
                    env::remove_var(key);
                }
            }
        }
    }

    #[test]
    fn defaults_validate_cleanly() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = InvoiceGateConfig::from_raw(RawConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.environment, "dev");
        assert_eq!(config.execution_mode, ExecutionMode::Background);
        assert_eq!(config.allowed_currencies, vec!["USD", "EUR", "IRR"]);
    }

    #[test]
    fn queue_reject_depth_must_exceed_warn_depth() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let mut config = InvoiceGateConfig::from_raw(RawConfig::default());
        config.queue_warn_depth = 10;
        config.queue_reject_depth = 10;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn production_rejects_default_jwt_secret() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let mut config = InvoiceGateConfig::from_raw(RawConfig::default());
        config.environment = "production".to_string();
        assert!(config.validate().is_err());
        config.jwt_secret = "a-real-secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_override_wins_over_toml_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        // SAFETY: tests run serially under ENV_LOCK.
        unsafe {
            env::set_var("INVOICEGATE_APP_NAME", "From Env");
        }
        let mut raw = RawConfig::default();
        raw.app_name = Some("From Toml".to_string());
        let config = InvoiceGateConfig::from_raw(raw);
        assert_eq!(config.app_name, "From Env");
        // SAFETY: tests run serially under ENV_LOCK.
        unsafe {
            env::remove_var("INVOICEGATE_APP_NAME");
        }
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let mut config = InvoiceGateConfig::from_raw(RawConfig::default());
        config.evidence_coverage_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_with_missing_file_uses_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.toml");
        let config = InvoiceGateConfig::load(Some(&missing)).unwrap();
        assert_eq!(config.app_name, "Invoice Gate");
    }

    #[test]
    fn load_parses_toml_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("invoice-gate.toml");
        fs::write(&config_path, "app_name = \"Custom Name\"\nqueue_warn_depth = 3\n").unwrap();
        let config = InvoiceGateConfig::load(Some(&config_path)).unwrap();
        assert_eq!(config.app_name, "Custom Name");
        assert_eq!(config.queue_warn_depth, 3);
    }

    #[test]
    fn sqlite_path_strips_scheme() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let mut config = InvoiceGateConfig::from_raw(RawConfig::default());
        config.db_url = "sqlite:///./data/invoice-gate.db".to_string();
        assert_eq!(config.sqlite_path(), PathBuf::from("./data/invoice-gate.db"));
    }
}
