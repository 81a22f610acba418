// src/lib.rs

pub mod cli;
pub mod computation;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod model;
pub mod store;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::computation::ComputationScheduler;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::config::validate::dependency_order;
use crate::engine::{
    ExecutionContext, RunSummary, Runtime, RuntimeEvent, ServiceDispatcher, ServiceEngine,
    ServiceRegistry, ServiceRequest,
};
use crate::exec::{CMD_ARG, ExeOptions, ExeServiceProcessor, JobThrottle};
use crate::model::ServiceArgs;
use crate::store::{InMemoryServiceStore, ServicePersistence};
use crate::types::ServiceId;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - store / scheduler / throttle
/// - one command processor per configured service
/// - engine, dispatcher and runtime
/// - Ctrl-C handling
///
/// Returns `None` for `--dry-run`, otherwise the final state of every
/// submitted service.
pub async fn run(args: CliArgs) -> Result<Option<RunSummary>> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    if args.dry_run {
        print_dry_run(&cfg, args.chain)?;
        return Ok(None);
    }

    let store: Arc<dyn ServicePersistence> = Arc::new(InMemoryServiceStore::new());

    let scheduler = ComputationScheduler::new(cfg.scheduler);
    let inspector = scheduler.start();

    let throttle = JobThrottle::new(cfg.throttle.clone());
    let sweeper = throttle.start_sweeper();

    let workspace_root = resolve_workspace(&config_path, &cfg.default.workspace);
    let registry = build_registry(&cfg, &store, &throttle, workspace_root);
    let engine = Arc::new(ServiceEngine::new(
        Arc::clone(&store),
        registry,
        cfg.engine.clone(),
    ));

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);
    let dispatcher =
        ServiceDispatcher::new(Arc::clone(&engine), scheduler.clone()).with_events(rt_tx.clone());

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    let ids = submit_configured(&engine, &cfg, args.chain)?;
    info!(count = ids.len(), chain = args.chain, "services submitted");
    rt_tx.send(RuntimeEvent::ServicesSubmitted(ids)).await?;

    let runtime = Runtime::new(dispatcher, rt_rx, cfg.runtime);
    let outcome = runtime.run().await;

    scheduler.shutdown();
    let _ = inspector.await;
    sweeper.abort();
    let summary = outcome?;

    print_summary(&summary);
    Ok(Some(summary))
}

/// Relative workspaces are resolved against the config file's directory.
fn resolve_workspace(config_path: &Path, workspace: &Path) -> PathBuf {
    if workspace.is_absolute() {
        return workspace.to_path_buf();
    }
    let root = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    root.join(workspace)
}

fn build_registry(
    cfg: &ConfigFile,
    store: &Arc<dyn ServicePersistence>,
    throttle: &JobThrottle,
    workspace_root: PathBuf,
) -> ServiceRegistry {
    let options = ExeOptions {
        default_location: cfg.default.processing_location,
        workspace_root,
        cluster_submit: cfg.default.cluster_submit.clone(),
        ..ExeOptions::default()
    };

    let mut registry = ServiceRegistry::new();
    for (label, service) in &cfg.service {
        let mut processor = ExeServiceProcessor::new(
            label.clone(),
            Arc::clone(store),
            throttle.clone(),
            Handle::current(),
            options.clone(),
        )
        .with_command(service.cmd.clone())
        .with_job_type(service.job_type_or(label));
        if let Some(pattern) = &cfg.default.error_pattern {
            processor = processor.with_error_pattern(pattern);
        }
        registry.register(Arc::new(processor));
    }
    registry
}

fn request_for(cfg: &ConfigFile, label: &str) -> ServiceRequest {
    let service = &cfg.service[label];
    let args = ServiceArgs {
        env: service.env.clone(),
        ..ServiceArgs::default()
    }
    .with_dictionary_arg(CMD_ARG, Value::String(service.cmd.clone()));
    let context = ExecutionContext {
        priority: service.priority,
        timeout: service.timeout,
        processing_location: service.processing_location,
        ..ExecutionContext::default()
    };
    ServiceRequest {
        name: label.to_string(),
        args,
        context,
    }
}

/// Submit every configured service and return their ids.
///
/// With `chain`, services go through `submit_multiple_services` in
/// dependency order; otherwise each service depends on its `after` list.
fn submit_configured(engine: &ServiceEngine, cfg: &ConfigFile, chain: bool) -> Result<Vec<ServiceId>> {
    let order = dependency_order(cfg)?;

    if chain {
        let requests = order.iter().map(|label| request_for(cfg, label)).collect();
        let records = engine.submit_multiple_services(requests)?;
        return Ok(records.iter().filter_map(|r| r.id).collect());
    }

    let mut ids: std::collections::BTreeMap<&str, ServiceId> = std::collections::BTreeMap::new();
    for label in &order {
        let mut request = request_for(cfg, label);
        request.context.dependencies = cfg.service[label.as_str()]
            .after
            .iter()
            .filter_map(|dep| ids.get(dep.as_str()).copied())
            .collect();
        let record = engine.submit_single_service(&request.name, request.args, &request.context)?;
        if let Some(id) = record.id {
            debug!(service = %id, label = %label, "configured service submitted");
            ids.insert(label.as_str(), id);
        }
    }
    Ok(order.iter().filter_map(|l| ids.get(l.as_str()).copied()).collect())
}

/// Simple dry-run output: print services, deps and commands.
fn print_dry_run(cfg: &ConfigFile, chain: bool) -> Result<()> {
    println!("svcflow dry-run");
    println!("  engine.processing_slots = {}", cfg.engine.processing_slots);
    println!("  engine.max_ready_capacity = {}", cfg.engine.max_ready_capacity);
    println!("  default.processing_location = {:?}", cfg.default.processing_location);
    println!();

    let order = dependency_order(cfg)?;
    println!(
        "services ({}, {} order):",
        order.len(),
        if chain { "chained" } else { "dependency" }
    );
    for label in &order {
        let service = &cfg.service[label.as_str()];
        println!("  - {label}");
        println!("      cmd: {}", service.cmd);
        if !service.after.is_empty() {
            println!("      after: {:?}", service.after);
        }
        if let Some(timeout) = service.timeout {
            println!("      timeout: {timeout:?}");
        }
        if let Some(priority) = service.priority {
            println!("      priority: {priority}");
        }
        println!("      job_type: {}", service.job_type_or(label));
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("svcflow summary");
    for record in &summary.services {
        println!("  {:<24} {}", record.label(), record.state);
    }
}
