// tests/run_cli.rs

use std::fs;
use std::path::Path;
use std::time::Duration;

use svcflow::cli::CliArgs;
use svcflow::engine::RunSummary;
use svcflow::model::ServiceRecord;
use svcflow::run;
use svcflow::types::ServiceState;
use svcflow_test_utils::init_tracing;
use tempfile::TempDir;

const FAST_SETTINGS: &str = r#"
[engine]
dispatch_interval = "10ms"
refresh_interval = "50ms"

[scheduler]
inspector_interval = "5ms"
worker_pool_size = 4

[throttle]
sweep_interval = "20ms"
"#;

fn write_config(dir: &TempDir, services: &str) -> String {
    let workspace = dir.path().join("ws");
    let contents = format!(
        "{FAST_SETTINGS}\n[default]\nworkspace = {:?}\n\n{services}",
        workspace.display().to_string()
    );
    let path = dir.path().join("Svcflow.toml");
    fs::write(&path, contents).unwrap();
    path.display().to_string()
}

fn args(config: String, chain: bool, dry_run: bool) -> CliArgs {
    CliArgs {
        config,
        log_level: None,
        dry_run,
        chain,
    }
}

async fn run_with_deadline(args: CliArgs) -> Option<RunSummary> {
    tokio::time::timeout(Duration::from_secs(30), run(args))
        .await
        .expect("svcflow run did not finish in time")
        .expect("svcflow run failed")
}

fn named<'a>(summary: &'a RunSummary, name: &str) -> &'a ServiceRecord {
    summary
        .services
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| panic!("no service named {name}"))
}

fn workspace_exists(dir: &TempDir, record: &ServiceRecord) -> bool {
    record
        .workspace
        .as_deref()
        .is_some_and(|ws| ws.starts_with(dir.path().join("ws")) && Path::new(ws).is_dir())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runs_dependent_shell_services() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        r#"
[service.a]
cmd = "echo first"

[service.b]
cmd = "echo second"
after = ["a"]
"#,
    );

    let summary = run_with_deadline(args(config, false, false)).await.unwrap();
    assert!(summary.all_successful(), "{:?}", summary.services);

    let a = named(&summary, "a");
    let b = named(&summary, "b");
    assert_eq!(b.dependencies, vec![a.id.unwrap()]);
    assert!(workspace_exists(&dir, a));
    let stdout = a
        .result
        .as_ref()
        .and_then(|r| r["stdout"].as_str())
        .expect("stdout path recorded");
    assert_eq!(fs::read_to_string(stdout).unwrap().trim(), "first");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_service_cancels_its_dependents() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        r#"
[service.broken]
cmd = "exit 3"

[service.after_broken]
cmd = "echo never"
after = ["broken"]

[service.independent]
cmd = "echo fine"
"#,
    );

    let summary = run_with_deadline(args(config, false, false)).await.unwrap();
    assert!(!summary.all_successful());
    assert_eq!(named(&summary, "broken").state, ServiceState::Error);
    assert_eq!(named(&summary, "after_broken").state, ServiceState::Canceled);
    assert_eq!(named(&summary, "independent").state, ServiceState::Successful);
    assert_eq!(summary.count_in(ServiceState::Successful), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_mode_links_services_in_dependency_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        r#"
[service.x]
cmd = "echo x"

[service.y]
cmd = "echo y"
after = ["x"]

[service.z]
cmd = "echo z"
"#,
    );

    let summary = run_with_deadline(args(config, true, false)).await.unwrap();
    assert!(summary.all_successful(), "{:?}", summary.services);

    let x = named(&summary, "x");
    let y = named(&summary, "y");
    let z = named(&summary, "z");
    assert!(y.dependencies.contains(&x.id.unwrap()));
    assert!(z.dependencies.contains(&y.id.unwrap()));
    assert!(x.priority > y.priority && y.priority > z.priority);
}

#[tokio::test]
async fn dry_run_does_not_execute() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        r#"
[service.touch]
cmd = "touch should-not-exist"
"#,
    );

    let summary = run_with_deadline(args(config, false, true)).await;
    assert!(summary.is_none());
    assert!(!dir.path().join("ws").exists());
}
