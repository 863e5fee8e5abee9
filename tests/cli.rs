use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
[vvrun]
manifest = "tests.toml"
results_dir = "TestResults"
num_procs = 2

[report]
show_progress = false
"#;

fn project(manifest: &str, config: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("vvrun.toml"), config).unwrap();
    fs::write(dir.path().join("tests.toml"), manifest).unwrap();
    dir
}

fn vvrun(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vvrun").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_init_then_validate() {
    let dir = TempDir::new().unwrap();
    vvrun(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created vvrun.toml"));
    assert!(dir.path().join("vvrun.toml").exists());

    vvrun(dir.path()).arg("init").assert().failure();

    vvrun(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Adapter: local"));
}

#[test]
fn test_validate_rejects_bad_config() {
    let dir = project("", "[batch.adapter]\ntype = \"lsf\"\n");
    vvrun(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_direct_run_exit_status_and_status() {
    let dir = project(
        r#"
        [[test]]
        path = "ok.vvt"
        name = "ok"
        command = "echo hello"

        [[test]]
        path = "close.vvt"
        name = "close"
        command = "exit 64"
        "#,
        CONFIG,
    );

    vvrun(dir.path())
        .arg("run")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Test Results:"))
        .stdout(predicate::str::contains("Diffed:   1"));

    let log = dir.path().join("TestResults/ok/execute.log");
    assert!(fs::read_to_string(log).unwrap().contains("hello"));

    vvrun(dir.path())
        .arg("status")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Results:"))
        .stdout(predicate::str::contains("close"));
}

#[test]
fn test_failed_dependency_is_reported() {
    let dir = project(
        r#"
        [[test]]
        path = "a.vvt"
        name = "a"
        command = "exit 1"

        [[test]]
        path = "b.vvt"
        name = "b"
        command = "true"
        depends_on = [{ pattern = "a", result = "pass" }]
        "#,
        CONFIG,
    );

    vvrun(dir.path())
        .arg("run")
        .assert()
        .code(4 | 32)
        .stdout(predicate::str::contains(
            r#"*** Warning: test "b" notrun due to "failed dependency: a""#,
        ));
}

#[test]
fn test_status_without_results() {
    let dir = project("", CONFIG);
    vvrun(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No results found"));
}

#[test]
fn test_batch_run_with_local_adapter() {
    let config = format!(
        "{}\n[batch]\nenabled = true\nbatch_length = 100\n\n[batch.adapter]\ntype = \"local\"\n",
        CONFIG
    );
    let dir = project(
        r#"
        [[test]]
        path = "one.vvt"
        name = "one"
        command = "true"
        timeout = 30

        [[test]]
        path = "two.vvt"
        name = "two"
        command = "true"
        timeout = 30
        "#,
        &config,
    );

    vvrun(dir.path())
        .arg("run")
        .env("VVRUN_BATCH_SLEEP_LENGTH", "1")
        .env("VVRUN_BATCH_READ_INTERVAL", "0")
        .assert()
        .success()
        .stdout(predicate::str::contains("Finished batch IDS: 0"))
        .stdout(predicate::str::contains("All tests passed!"));

    let batch_dir = dir.path().join("TestResults/batchset0");
    let out = fs::read_to_string(batch_dir.join("qbat-out.0")).unwrap();
    assert!(out.contains("queue job finished cleanly"));
}
