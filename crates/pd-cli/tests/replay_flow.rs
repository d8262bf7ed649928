//! End-to-end tests for the `pd` binary.
//!
//! Tests the full pipeline: init → reference → replay → status

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const REFERENCE: &str = r#"{
    "machines": [
        {"id": 1, "name": "lathe", "modules": [10]},
        {"id": 2, "name": "mill", "modules": [20]}
    ],
    "operations": [{"id": 1, "code": "OP1"}],
    "sequences": [{"id": 5, "operation": 1, "name": "roughing"}]
}"#;

fn pd_binary() -> String {
    env!("CARGO_BIN_EXE_pd").to_string()
}

/// Runs `pd` with its database and config isolated inside `temp`.
fn pd(temp: &Path, args: &[&str]) -> Output {
    Command::new(pd_binary())
        .env("HOME", temp)
        .env("XDG_CONFIG_HOME", temp.join(".config"))
        .env("XDG_DATA_HOME", temp.join(".local/share"))
        .env("PD_DATABASE_PATH", database_path(temp))
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("failed to run pd")
}

fn database_path(temp: &Path) -> PathBuf {
    temp.join("data/pd.db")
}

fn write(temp: &Path, name: &str, content: &str) -> String {
    let path = temp.join(name);
    std::fs::write(&path, content).unwrap();
    path.display().to_string()
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn prepared() -> TempDir {
    let temp = TempDir::new().unwrap();
    assert_success(&pd(temp.path(), &["init"]), "pd init");
    let reference = write(temp.path(), "reference.json", REFERENCE);
    assert_success(&pd(temp.path(), &["reference", &reference]), "pd reference");
    temp
}

#[test]
fn test_init_creates_database() {
    let temp = TempDir::new().unwrap();
    let output = pd(temp.path(), &["init"]);

    assert_success(&output, "pd init");
    assert!(database_path(temp.path()).exists());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pd.db"), "unexpected output: {stdout}");
}

#[test]
fn test_replay_then_status() {
    let temp = prepared();
    let events = write(
        temp.path(),
        "events.jsonl",
        r#"{"kind":"stamp","module":10,"date_time":"2025-01-01T08:00:00Z","stamp":{"id":1,"operation_cycle_begin":true,"sequence":5}}
{"kind":"stop_cycle","module":10,"date_time":"2025-01-01T08:01:00Z","quantity":1}
{"kind":"start_cycle","module":10,"date_time":"2025-01-01T08:01:10Z"}
{"kind":"stop_cycle","module":10,"date_time":"2025-01-01T08:02:10Z","quantity":1}
"#,
    );

    let output = pd(temp.path(), &["replay", &events]);
    assert_success(&output, "pd replay");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Applied: 4"), "unexpected output: {stdout}");

    let output = pd(temp.path(), &["status", "--machine", "1", "--json"]);
    assert_success(&output, "pd status");
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let machine = &status[0];
    assert_eq!(machine["machine"], 1);

    let cycles = machine["cycles"].as_array().unwrap();
    assert_eq!(cycles.len(), 2);
    assert!(cycles.iter().all(|cycle| cycle["full"] == true));
    assert!(cycles.iter().all(|cycle| cycle["quantity"] == 1));

    let slots = machine["operation_slots"].as_array().unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0]["operation"], 1);
    assert_eq!(slots[0]["total_cycles"], 2);

    let sequence_slots = machine["sequence_slots"].as_array().unwrap();
    assert_eq!(sequence_slots.len(), 1);
    assert_eq!(sequence_slots[0]["sequence"], 5);
}

#[test]
fn test_replay_is_idempotent() {
    let temp = prepared();
    let events = write(
        temp.path(),
        "events.jsonl",
        r#"{"kind":"start_cycle","module":10,"date_time":"2025-01-01T08:00:00Z"}
{"kind":"stop_cycle","module":10,"date_time":"2025-01-01T08:01:00Z","quantity":2}
"#,
    );

    assert_success(&pd(temp.path(), &["replay", &events]), "first replay");
    let first = pd(temp.path(), &["status", "--json"]);
    assert_success(&pd(temp.path(), &["replay", &events]), "second replay");
    let second = pd(temp.path(), &["status", "--json"]);

    let first: serde_json::Value = serde_json::from_slice(&first.stdout).unwrap();
    let second: serde_json::Value = serde_json::from_slice(&second.stdout).unwrap();
    assert_eq!(first[0]["cycles"], second[0]["cycles"]);
    assert_eq!(second[0]["cycles"].as_array().unwrap().len(), 1);
}

#[test]
fn test_replay_filters_machine() {
    let temp = prepared();
    let events = write(
        temp.path(),
        "events.jsonl",
        r#"{"kind":"start_cycle","module":10,"date_time":"2025-01-01T08:00:00Z"}
{"kind":"start_cycle","module":20,"date_time":"2025-01-01T08:00:00Z"}
"#,
    );

    let output = pd(temp.path(), &["replay", &events, "--machine", "2"]);
    assert_success(&output, "pd replay --machine 2");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Skipped: 1"), "unexpected output: {stdout}");

    let output = pd(temp.path(), &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status[0]["cycles"].as_array().unwrap().len(), 0);
    assert_eq!(status[1]["cycles"].as_array().unwrap().len(), 1);
}

#[test]
fn test_incoherent_stamp_aborts_with_line() {
    let temp = prepared();
    let events = write(
        temp.path(),
        "events.jsonl",
        r#"{"kind":"start_cycle","module":10,"date_time":"2025-01-01T08:00:00Z"}
{"kind":"stamp","module":10,"date_time":"2025-01-01T08:00:30Z","stamp":{"id":7,"operation_cycle_begin":true,"operation_cycle_end":true}}
"#,
    );

    let output = pd(temp.path(), &["replay", &events]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("event on line 2 failed"), "unexpected stderr: {stderr}");

    let output = pd(temp.path(), &["status", "--machine", "1"]);
    assert_success(&output, "pd status");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Stamp 7 is both an operation cycle begin and end"),
        "unexpected output: {stdout}"
    );
}
