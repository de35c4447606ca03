//! End-to-end CLI tests using assert_cmd.
//!
//! Each test points `CCR_HOME` at its own temp directory so no state leaks
//! between tests or into the real home.

use assert_cmd::Command;
use predicates::prelude::*;

fn ccr(home: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ccr").expect("binary");
    cmd.env("CCR_HOME", home.path());
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let home = tempfile::tempdir().unwrap();
    ccr(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("attach"))
        .stdout(predicate::str::contains("token"));
}

#[test]
fn test_unknown_subcommand_fails() {
    let home = tempfile::tempdir().unwrap();
    ccr(&home).arg("frobnicate").assert().failure();
}

#[test]
fn test_token_mints_and_persists() {
    let home = tempfile::tempdir().unwrap();
    ccr(&home)
        .arg("token")
        .assert()
        .success()
        // Compact token: three dot-separated segments.
        .stdout(predicate::str::is_match(r"^[\w-]+\.[\w-]+\.[\w-]+\n$").unwrap());

    // First run creates the config with a secret and saves the token file.
    let config = std::fs::read_to_string(home.path().join("config.json")).unwrap();
    assert!(config.contains("jwtSecret"));
    let token = std::fs::read_to_string(home.path().join("token")).unwrap();
    assert!(token.contains('.'));
}

#[test]
fn test_token_reuses_config_secret() {
    let home = tempfile::tempdir().unwrap();
    ccr(&home).arg("token").assert().success();
    let first = std::fs::read_to_string(home.path().join("config.json")).unwrap();
    ccr(&home).arg("token").assert().success();
    let second = std::fs::read_to_string(home.path().join("config.json")).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_status_without_server_fails() {
    let home = tempfile::tempdir().unwrap();
    ccr(&home)
        .arg("status")
        .arg("--url")
        .arg("http://127.0.0.1:1") // nothing listens there
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_list_without_server_fails() {
    let home = tempfile::tempdir().unwrap();
    ccr(&home)
        .arg("list")
        .arg("--url")
        .arg("ws://127.0.0.1:1")
        .assert()
        .failure();
}
