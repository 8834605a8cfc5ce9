//! Basic CLI E2E tests.
//!
//! Each test runs the built binary against its own data directory.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

/// Run a CLI command and return (exit code, stdout, stderr).
fn run_cli(dir: &Path, args: &[&str]) -> (i32, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_machine-timeline"))
        .env("MACHINE_TIMELINE_DIR", dir)
        .env("RUST_LOG", "off")
        .args(args)
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (code, stdout, stderr)
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).expect("stdout is JSON")
}

#[test]
fn test_machine_add_and_list() {
    let dir = TempDir::new().unwrap();
    let (code, _, _) = run_cli(dir.path(), &["machine", "add", "1", "lathe"]);
    assert_eq!(code, 0);

    let (code, stdout, _) = run_cli(dir.path(), &["machine", "list"]);
    assert_eq!(code, 0);
    let machines = json(&stdout);
    assert_eq!(machines[0]["id"], 1);
    assert_eq!(machines[0]["name"], "lathe");
}

#[test]
fn test_machine_modes_lists_builtin_catalog() {
    let dir = TempDir::new().unwrap();
    let (code, stdout, _) = run_cli(dir.path(), &["machine", "modes"]);
    assert_eq!(code, 0);
    assert!(json(&stdout).as_array().unwrap().len() >= 6);
}

#[test]
fn test_fact_rejects_bad_timestamp() {
    let dir = TempDir::new().unwrap();
    run_cli(dir.path(), &["machine", "add", "1", "lathe"]);
    let (code, _, stderr) = run_cli(dir.path(), &["fact", "add", "1", "2", "yesterday"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("invalid timestamp"));
}

#[test]
fn test_fact_rejects_empty_range() {
    let dir = TempDir::new().unwrap();
    run_cli(dir.path(), &["machine", "add", "1", "lathe"]);
    let (code, _, _) = run_cli(
        dir.path(),
        &["fact", "add", "1", "2", "2024-01-01T10:00:00Z", "2024-01-01T10:00:00Z"],
    );
    assert_ne!(code, 0);
}

#[test]
fn test_analyze_builds_reason_slots_and_summary() {
    let dir = TempDir::new().unwrap();
    run_cli(dir.path(), &["machine", "add", "1", "lathe"]);
    let (code, _, _) = run_cli(
        dir.path(),
        &["fact", "add", "1", "4", "2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z"],
    );
    assert_eq!(code, 0);

    let (code, stdout, _) = run_cli(dir.path(), &["analyze", "run"]);
    assert_eq!(code, 0, "analyze failed");
    let report = json(&stdout);
    assert_eq!(report["machines"][0]["machine_id"], 1);
    assert_eq!(report["machines"][0]["status"]["state"], "completed");

    let (code, stdout, _) = run_cli(dir.path(), &["report", "slots", "1", "reason"]);
    assert_eq!(code, 0);
    let slots = json(&stdout);
    assert_eq!(slots.as_array().unwrap().len(), 1);

    let (code, stdout, _) = run_cli(dir.path(), &["report", "summary", "activity"]);
    assert_eq!(code, 0);
    let rows = json(&stdout);
    assert_eq!(rows[0]["duration_secs"], 3600);
}

#[test]
fn test_modification_add_and_list() {
    let dir = TempDir::new().unwrap();
    run_cli(dir.path(), &["machine", "add", "1", "lathe"]);
    let (code, stdout, _) = run_cli(
        dir.path(),
        &[
            "modification",
            "observation-state",
            "--machine",
            "1",
            "--begin",
            "2024-01-01T08:00:00Z",
            "--end",
            "2024-01-01T16:00:00Z",
            "Attended",
        ],
    );
    assert_eq!(code, 0);
    let id = json(&stdout)["id"].as_i64().unwrap();

    let (code, stdout, _) = run_cli(dir.path(), &["modification", "list", "--status", "pending"]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)[0]["id"].as_i64(), Some(id));

    run_cli(dir.path(), &["analyze", "run"]);
    let (_, stdout, _) = run_cli(dir.path(), &["modification", "list", "--status", "done"]);
    assert_eq!(json(&stdout)[0]["id"].as_i64(), Some(id));
}

#[test]
fn test_config_get_set() {
    let dir = TempDir::new().unwrap();
    let (code, _, _) = run_cli(dir.path(), &["config", "set", "summary.day_cutoff", "06:00"]);
    assert_eq!(code, 0);
    let (code, stdout, _) = run_cli(dir.path(), &["config", "get", "summary.day_cutoff"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "06:00");

    let (code, _, _) = run_cli(dir.path(), &["config", "set", "summary.day_cutoff", "25:00"]);
    assert_ne!(code, 0);
    let (code, _, _) = run_cli(dir.path(), &["config", "get", "nope"]);
    assert_ne!(code, 0);
}
