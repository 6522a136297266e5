//! Integration tests for the `bosun task` and `bosun lock` subcommands.

mod common;

use common::TestEnv;
use predicates::prelude::*;

/// Create a task and return its id from the JSON output.
fn create_task(env: &TestEnv, args: &[&str]) -> String {
    let output = env
        .bosun()
        .args(["task", "create"])
        .args(args)
        .output()
        .expect("failed to run bosun task create");
    assert!(output.status.success(), "{:?}", output);
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    json["data"]["id"].as_str().unwrap().to_string()
}

#[test]
fn test_task_create_returns_pending_task() {
    let env = TestEnv::init();
    let output = env
        .bosun()
        .args(["task", "create", "fix the rudder", "--priority", "critical"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["status"], "pending");
    assert_eq!(json["data"]["priority"], "critical");
    assert!(
        json["data"]["id"]
            .as_str()
            .unwrap()
            .starts_with("task-")
    );
}

#[test]
fn test_task_create_rejects_unknown_priority() {
    let env = TestEnv::init();
    env.bosun()
        .args(["task", "create", "x", "--priority", "urgent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown priority"));
}

#[test]
fn test_task_list_and_filter() {
    let env = TestEnv::init();
    create_task(&env, &["first"]);
    create_task(&env, &["second", "--priority", "low"]);

    let output = env.bosun().args(["task", "list"]).output().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["data"]["count"], 2);

    let output = env
        .bosun()
        .args(["task", "list", "--status", "completed"])
        .output()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["data"]["count"], 0);
}

#[test]
fn test_task_show_unknown_id_fails() {
    let env = TestEnv::init();
    env.bosun()
        .args(["task", "show", "task-ffff"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_task_dependency_chain_via_cli() {
    let env = TestEnv::init();
    let parent = create_task(&env, &["parent"]);
    let child_output = env
        .bosun()
        .args(["task", "create", "child", "--depends-on", &parent])
        .output()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&child_output.stdout).unwrap();
    assert_eq!(json["data"]["blocked_by"][0], parent.as_str());
}

#[test]
fn test_task_cancel() {
    let env = TestEnv::init();
    let id = create_task(&env, &["doomed"]);

    env.bosun()
        .args(["task", "cancel", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("cancelled"));

    let output = env.bosun().args(["task", "show", &id]).output().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["data"]["status"], "cancelled");

    // Cancelling twice is an illegal transition.
    env.bosun().args(["task", "cancel", &id]).assert().failure();
}

#[test]
fn test_task_show_human_output() {
    let env = TestEnv::init();
    let id = create_task(&env, &["readable", "--description", "for humans"]);

    env.bosun()
        .args(["task", "show", &id, "--human"])
        .assert()
        .success()
        .stdout(predicate::str::contains("readable"))
        .stdout(predicate::str::contains("for humans"))
        .stdout(predicate::str::contains("attempts 0/3"));
}

#[test]
fn test_agent_list_empty() {
    let env = TestEnv::init();
    let output = env.bosun().args(["agent", "list"]).output().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["data"]["count"], 0);
}

#[test]
fn test_lock_list_and_force_release() {
    let env = TestEnv::init();

    let output = env.bosun().args(["lock", "list"]).output().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["data"]["count"], 0);

    // Releasing a lock nobody holds reports released=false.
    let output = env
        .bosun()
        .args(["lock", "release", "src/free.rs"])
        .output()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["data"]["released"], false);
}
