// tests/config_errors.rs

use std::fs;
use std::path::PathBuf;

use svcflow::config::{dependency_order, load_and_validate};
use svcflow::errors::SvcflowError;
use tempfile::TempDir;

fn write_config(contents: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Svcflow.toml");
    fs::write(&path, contents).unwrap();
    (dir, path)
}

fn config_error(contents: &str) -> String {
    let (_dir, path) = write_config(contents);
    match load_and_validate(&path) {
        Err(SvcflowError::ConfigError(msg)) => msg,
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn rejects_dependency_cycle() {
    let msg = config_error(
        r#"
[service.a]
cmd = "echo a"
after = ["c"]

[service.b]
cmd = "echo b"
after = ["a"]

[service.c]
cmd = "echo c"
after = ["b"]
"#,
    );
    assert!(msg.contains("cycle"), "{msg}");
}

#[test]
fn rejects_unknown_dependency() {
    let msg = config_error(
        r#"
[service.build]
cmd = "make"
after = ["fetch"]
"#,
    );
    assert!(msg.contains("unknown dependency 'fetch'"), "{msg}");
}

#[test]
fn rejects_bad_duration_with_field_name() {
    let msg = config_error(
        r#"
[service.slow]
cmd = "sleep 1"
timeout = "ten minutes"
"#,
    );
    assert!(msg.contains("service.slow.timeout"), "{msg}");
}

#[test]
fn rejects_zero_processing_slots() {
    let msg = config_error(
        r#"
[engine]
processing_slots = 0

[service.a]
cmd = "true"
"#,
    );
    assert!(msg.contains("engine.processing_slots"), "{msg}");
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let (_dir, path) = write_config("[service.a\ncmd = ");
    assert!(matches!(
        load_and_validate(&path),
        Err(SvcflowError::TomlError(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        load_and_validate(dir.path().join("absent.toml")),
        Err(SvcflowError::IoError(_))
    ));
}

#[test]
fn valid_file_orders_services_by_dependencies() {
    let (_dir, path) = write_config(
        r#"
[service.deploy]
cmd = "echo deploy"
after = ["test", "build"]

[service.build]
cmd = "echo build"

[service.test]
cmd = "echo test"
after = ["build"]
timeout = "2m"
"#,
    );
    let cfg = load_and_validate(&path).unwrap();
    assert_eq!(
        cfg.service["test"].timeout,
        Some(std::time::Duration::from_secs(120))
    );
    assert_eq!(
        dependency_order(&cfg).unwrap(),
        vec!["build".to_string(), "test".to_string(), "deploy".to_string()]
    );
}
