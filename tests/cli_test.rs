//! CLI integration tests
//!
//! End-to-end tests for the hmcache command-line interface.
//!
//! Tests that touch the same workspace lock file are serialized to avoid
//! `server.lock.json` contention between test processes.

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

fn hmcache() -> Command {
    Command::cargo_bin("hmcache").expect("failed to find hmcache binary")
}

fn setup_project() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    let src_dir = dir.path().join("src");
    fs::create_dir(&src_dir).expect("failed to create src dir");
    fs::write(
        src_dir.join("lib.rs"),
        r#"
pub fn parse_config_file(path: &str) -> String {
    path.to_string()
}

pub fn unrelated_zebra_thing() -> i32 {
    42
}
"#,
    )
    .expect("failed to write fixture file");
    dir
}

#[test]
fn help_output_mentions_search() {
    hmcache()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("semantic code search"));
}

#[test]
fn version_output_succeeds() {
    hmcache().arg("--version").assert().success();
}

#[test]
#[serial]
fn init_creates_cache_directory() {
    let dir = TempDir::new().unwrap();
    hmcache().args(["init"]).current_dir(dir.path()).assert().success();
    assert!(dir.path().join(".hmcache").exists());
}

#[test]
#[serial]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    hmcache().args(["init"]).current_dir(dir.path()).assert().success();
    hmcache().args(["init"]).current_dir(dir.path()).assert().success();
}

#[test]
#[serial]
fn index_then_search_finds_relevant_chunk() {
    let dir = setup_project();

    hmcache().args(["index"]).current_dir(dir.path()).assert().success();

    hmcache()
        .args(["search", "parse config file", "--json"])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("lib.rs"));
}

#[test]
#[serial]
fn search_with_no_matches_exits_zero_with_empty_array() {
    let dir = TempDir::new().unwrap();
    hmcache().args(["init"]).current_dir(dir.path()).assert().success();

    hmcache()
        .args(["search", "anything", "--json"])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
#[serial]
fn second_index_run_reports_unchanged_files() {
    let dir = setup_project();
    hmcache().args(["index"]).current_dir(dir.path()).assert().success();

    hmcache()
        .args(["index"])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("unchanged 1"));
}

#[test]
#[serial]
fn clear_cache_removes_store_directory() {
    let dir = setup_project();
    hmcache().args(["index"]).current_dir(dir.path()).assert().success();
    assert!(dir.path().join(".hmcache").join("vectors.bin").exists());

    hmcache().args(["clear-cache"]).current_dir(dir.path()).assert().success();
    assert!(!dir.path().join(".hmcache").join("vectors.bin").exists());
}

#[test]
#[serial]
fn stats_reports_embedding_model() {
    let dir = setup_project();
    hmcache().args(["index"]).current_dir(dir.path()).assert().success();

    hmcache()
        .args(["stats"])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("embedding model"));
}

#[test]
fn completions_generates_nonempty_script() {
    hmcache()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hmcache"));
}
