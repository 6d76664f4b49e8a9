// crates/invoice-gate-cli/tests/cli_integration.rs
// ============================================================================
// Module: CLI Integration Tests
// Description: End-to-end exercises of the `invoice-gate` binary against a
//              temp-rooted SQLite repository and filesystem blob store.
// Purpose: Cover ingest -> run create -> show -> audit verify without a
//          network-facing service, using the heuristic providers.
// Dependencies: invoice-gate-cli binary, tempfile, serde_json
// ============================================================================

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Integration tests assert via panics on unexpected process output."
)]

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Output;

fn invoice_gate_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_invoice-gate"))
}

struct Fixture {
    _root: tempfile::TempDir,
    config_path: PathBuf,
}

fn fixture() -> Fixture {
    fixture_with_execution_mode("background")
}

fn fixture_with_execution_mode(execution_mode: &str) -> Fixture {
    let root = tempfile::tempdir().expect("create temp dir");
    let storage_root = root.path().join("storage");
    let db_path = root.path().join("invoice-gate.db");
    let config_path = root.path().join("invoice-gate.toml");

    let config = format!(
        "storage_root = \"{}\"\ndb_url = \"sqlite:///{}\"\nexecution_mode = \"{execution_mode}\"\n",
        storage_root.display(),
        db_path.display(),
    );
    fs::write(&config_path, config).expect("write config");

    Fixture {
        _root: root,
        config_path,
    }
}

fn run_cli(fixture: &Fixture, args: &[&str]) -> Output {
    let mut full_args = vec!["--config", fixture.config_path.to_str().expect("utf8 path")];
    full_args.extend_from_slice(args);
    Command::new(invoice_gate_bin())
        .args(&full_args)
        .output()
        .expect("run invoice-gate")
}

fn write_pdf(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"%PDF-1.4\n1 0 obj\n<< >>\nendobj\n%%EOF\n").expect("write pdf fixture");
    path
}

fn stdout_json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "expected success, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is valid JSON")
}

#[test]
fn ingest_accepts_a_well_formed_pdf() {
    let fx = fixture();
    let doc_path = write_pdf(fx._root.path(), "invoice.pdf");

    let output = run_cli(&fx, &["ingest", doc_path.to_str().expect("utf8 path")]);
    let document = stdout_json(&output);

    assert_eq!(document["ingestion_status"], "ACCEPTED");
    assert_eq!(document["filename"], "invoice.pdf");
}

#[test]
fn ingest_rejects_unsupported_mime_type() {
    let fx = fixture();
    let doc_path = fx._root.path().join("notes.txt");
    fs::write(&doc_path, b"plain text invoice notes").expect("write text fixture");

    let output = run_cli(&fx, &["ingest", doc_path.to_str().expect("utf8 path")]);
    let document = stdout_json(&output);

    assert_eq!(document["ingestion_status"], "REJECTED");
}

#[test]
fn run_create_dispatches_inline_and_reaches_a_terminal_status() {
    let fx = fixture();
    let doc_path = write_pdf(fx._root.path(), "invoice.pdf");

    let ingest_output = run_cli(&fx, &["ingest", doc_path.to_str().expect("utf8 path")]);
    let document = stdout_json(&ingest_output);
    let document_id = document["id"].as_str().expect("document id is a string").to_string();

    let run_output = run_cli(&fx, &["run", "create", "--document", &document_id]);
    let run = stdout_json(&run_output);
    let run_id = run["id"].as_str().expect("run id is a string").to_string();

    assert_ne!(run["status"], "QUEUED", "background execution mode should dispatch inline");

    let show_output = run_cli(&fx, &["run", "show", "--run", &run_id]);
    let shown = stdout_json(&show_output);
    assert_eq!(shown["id"], run_id);
}

#[test]
fn run_create_is_idempotent_for_a_repeated_key() {
    let fx = fixture();
    let doc_path = write_pdf(fx._root.path(), "invoice.pdf");
    let document = stdout_json(&run_cli(&fx, &["ingest", doc_path.to_str().expect("utf8 path")]));
    let document_id = document["id"].as_str().expect("document id is a string").to_string();

    let first = stdout_json(&run_cli(
        &fx,
        &["run", "create", "--document", &document_id, "--idempotency-key", "retry-1"],
    ));
    let second = stdout_json(&run_cli(
        &fx,
        &["run", "create", "--document", &document_id, "--idempotency-key", "retry-1"],
    ));

    assert_eq!(first["id"], second["id"], "repeated idempotency key must return the same run");
}

#[test]
fn run_create_fails_for_unknown_document() {
    let fx = fixture();
    let output = run_cli(&fx, &["run", "create", "--document", "doc_does_not_exist"]);
    assert!(!output.status.success());
}

#[test]
fn worker_once_reports_zero_when_queue_is_empty() {
    let fx = fixture();
    let output = run_cli(&fx, &["worker", "--once"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("processed 0 run(s)"), "unexpected stdout: {stdout}");
}

#[test]
fn audit_verify_reports_a_valid_chain_after_ingest() {
    let fx = fixture();
    let doc_path = write_pdf(fx._root.path(), "invoice.pdf");
    let _ = run_cli(&fx, &["ingest", doc_path.to_str().expect("utf8 path")]);

    let output = run_cli(&fx, &["audit", "verify"]);
    let verification = stdout_json(&output);
    assert_eq!(verification["valid"], true);
    assert!(verification["events_checked"].as_u64().expect("events_checked is u64") >= 1);
}

#[test]
fn run_cancel_marks_a_queued_run_cancelled() {
    let fx = fixture_with_execution_mode("worker");
    let doc_path = write_pdf(fx._root.path(), "invoice.pdf");
    let document = stdout_json(&run_cli(&fx, &["ingest", doc_path.to_str().expect("utf8 path")]));
    let document_id = document["id"].as_str().expect("document id is a string").to_string();

    let run = stdout_json(&run_cli(&fx, &["run", "create", "--document", &document_id]));
    let run_id = run["id"].as_str().expect("run id is a string").to_string();
    assert_eq!(run["status"], "QUEUED");

    let cancelled = stdout_json(&run_cli(&fx, &["run", "cancel", "--run", &run_id]));
    assert_eq!(cancelled["status"], "CANCELLED");
}
