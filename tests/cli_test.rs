/*!
 * Binary-level tests: the two-flag CLI contract and config-test exit codes
 */

use assert_fs::prelude::*;
use predicates::prelude::*;
use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_pulsar");

const VALID_CONFIG: &str = r#"
[server]
master = true
worker_processes = 2
pid_path = "/tmp/pulsar-cli-test.pid"

[[listen]]
addr = "127.0.0.1:0"

[events]
worker_connections = 32
"#;

fn write_config(content: &str) -> (assert_fs::TempDir, std::path::PathBuf) {
    let dir = assert_fs::TempDir::new().unwrap();
    let file = dir.child("pulsar.toml");
    file.write_str(content).unwrap();
    let path = file.path().to_path_buf();
    (dir, path)
}

#[test]
fn test_config_test_succeeds_on_valid_config() {
    let (_dir, path) = write_config(VALID_CONFIG);

    let output = Command::new(BIN)
        .arg("-t")
        .arg("-c")
        .arg(&path)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(predicate::str::contains("tested successfully").eval(&stdout));
}

#[test]
fn test_config_test_fails_on_syntax_error() {
    let (_dir, path) = write_config("[server\nmaster = yes");

    let output = Command::new(BIN)
        .arg("-t")
        .arg("-c")
        .arg(&path)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_config_test_fails_without_listener() {
    let (_dir, path) = write_config("[server]\nmaster = true\n");

    let output = Command::new(BIN)
        .arg("-t")
        .arg("-c")
        .arg(&path)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(predicate::str::contains("listen").eval(&stderr));
}

#[test]
fn test_missing_config_file_fails() {
    let output = Command::new(BIN)
        .arg("-t")
        .arg("-c")
        .arg("/nonexistent/pulsar.toml")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_unknown_flag_exits_one() {
    let output = Command::new(BIN).arg("--bogus").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_positional_argument_exits_one() {
    let output = Command::new(BIN).arg("serve").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_help_exits_zero() {
    let output = Command::new(BIN).arg("--help").output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(predicate::str::contains("-t").eval(&stdout));
    assert!(predicate::str::contains("-c").eval(&stdout));
}
