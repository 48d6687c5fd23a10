//! Tests for the lag-sim binary

use assert_cmd::Command;
use predicates::prelude::*;

fn cli_command() -> Command {
    Command::cargo_bin("lag-sim").expect("Failed to find lag-sim binary")
}

#[test]
fn test_presets_listed() {
    let mut cmd = cli_command();
    cmd.arg("presets");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Built-in presets:"))
        .stdout(predicate::str::contains("perfect"))
        .stdout(predicate::str::contains("satellite"))
        .stdout(predicate::str::contains("lossy"));
}

#[test]
fn test_settings_default_control_addr() {
    let mut cmd = cli_command();
    cmd.arg("settings");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"controlAddr\": \"127.0.0.1:8080\""))
        .stdout(predicate::str::contains("\"maxPending\": 1024"));
}

#[test]
fn test_settings_flags_override_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(
        &path,
        r#"{"controlAddr": "127.0.0.1:9100", "shaper": {"seed": 1}}"#,
    )
    .unwrap();

    let mut cmd = cli_command();
    cmd.arg("settings")
        .arg("--settings")
        .arg(&path)
        .args(["--seed", "42", "--preset", "satellite"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("127.0.0.1:9100"))
        .stdout(predicate::str::contains("\"seed\": 42"))
        .stdout(predicate::str::contains("\"baseLatencyMs\": 300.0"));
}

#[test]
fn test_unknown_preset_fails() {
    let mut cmd = cli_command();
    cmd.args(["settings", "--preset", "dialup"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Unknown preset: dialup"));
}

#[test]
fn test_listen_without_upstream_fails() {
    let mut cmd = cli_command();
    cmd.args(["settings", "--listen", "127.0.0.1:5000"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--upstream"));
}

#[test]
fn test_serve_runs_for_duration_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("stats.jsonl");

    let mut cmd = cli_command();
    cmd.args(["serve", "--control-addr", "127.0.0.1:0", "--duration", "1"])
        .arg("--stats-log")
        .arg(&log);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Control surface at"));

    let recorded = std::fs::read_to_string(&log).unwrap();
    let first = recorded.lines().next().expect("at least one snapshot");
    let snapshot: serde_json::Value = serde_json::from_str(first).unwrap();
    assert_eq!(snapshot["delivered"], 0);
    assert!(snapshot["activeConfig"].is_object());
}

#[test]
fn test_help() {
    let mut cmd = cli_command();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("--verbose"));
}
