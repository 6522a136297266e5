//! Integration tests for `bosun init`, `bosun status`, and the layout.

mod common;

use common::TestEnv;
use predicates::prelude::*;

#[test]
fn test_init_creates_layout() {
    let env = TestEnv::new();

    env.bosun()
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\": true"));

    let dir = env.coordinator_dir();
    assert!(dir.join("state.json").is_file());
    assert!(dir.join("agents").is_dir());
    assert!(dir.join("messages").is_dir());
    assert!(dir.join("locks").is_dir());
    assert!(dir.join("tasks").is_dir());

    let gitignore = std::fs::read_to_string(dir.join(".gitignore")).unwrap();
    assert!(gitignore.contains("state.json"));
    assert!(gitignore.contains("agents/"));
    assert!(gitignore.contains("locks/"));
}

#[test]
fn test_init_is_idempotent() {
    let env = TestEnv::init();
    env.bosun().arg("init").assert().success();
}

#[test]
fn test_status_on_uninitialized_project_fails() {
    let env = TestEnv::new();
    env.bosun()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not initialized"));
}

#[test]
fn test_status_json_shape() {
    let env = TestEnv::init();

    let output = env.bosun().arg("status").output().unwrap();
    assert!(output.status.success());

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status must print valid JSON");
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["queue_depth"], 0);
    assert_eq!(json["data"]["active_locks"], 0);
}

#[test]
fn test_status_human_format() {
    let env = TestEnv::init();

    env.bosun()
        .args(["status", "--human"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue depth: 0"))
        .stdout(predicate::str::contains("Agents: none"));
}

#[test]
fn test_bare_invocation_hints_at_init() {
    let env = TestEnv::new();
    env.bosun()
        .assert()
        .success()
        .stdout(predicate::str::contains("bosun init"));
}

#[test]
fn test_state_file_round_trips_through_strict_parser() {
    let env = TestEnv::init();
    env.bosun()
        .args(["task", "create", "inspect the bilge"])
        .assert()
        .success();

    let raw = std::fs::read_to_string(env.coordinator_dir().join("state.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["version"], 1);
    assert_eq!(parsed["tasks"].as_object().unwrap().len(), 1);
    // Pretty-printed for human inspection.
    assert!(raw.contains("\n  "));
}

#[test]
fn test_clean_removes_nothing_when_fresh() {
    let env = TestEnv::init();
    let output = env
        .bosun()
        .args(["clean", "--max-age-ms", "60000"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["data"]["removed"], 0);
}

#[test]
fn test_watch_bounded_run_exits() {
    let env = TestEnv::init();
    env.bosun()
        .args(["watch", "--ticks", "1"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .success();
}

#[test]
fn test_ops_log_records_mutations() {
    let env = TestEnv::init();
    env.bosun()
        .args(["task", "create", "log me"])
        .assert()
        .success();

    let log = std::fs::read_to_string(env.coordinator_dir().join("ops.log")).unwrap();
    assert!(log.lines().any(|line| line.contains("\"create_task\"")));
}
