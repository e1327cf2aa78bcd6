//! CLI surface smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn help_describes_the_daemon() {
    Command::cargo_bin("warden")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("service supervisor"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("replan"));
}

#[test]
fn version_prints_the_crate_version() {
    Command::cargo_bin("warden")
        .expect("binary")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("warden"));
}

#[test]
fn client_commands_need_a_running_daemon() {
    let dir = tempdir().expect("tempdir");
    Command::cargo_bin("warden")
        .expect("binary")
        .args(["--dir", dir.path().to_str().expect("utf8"), "services"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("control socket not available"));
}

#[test]
fn start_requires_service_names() {
    Command::cargo_bin("warden")
        .expect("binary")
        .arg("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn unknown_level_is_rejected_locally() {
    let dir = tempdir().expect("tempdir");
    Command::cargo_bin("warden")
        .expect("binary")
        .args([
            "--dir",
            dir.path().to_str().expect("utf8"),
            "checks",
            "--level",
            "bogus",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid level"));
}
