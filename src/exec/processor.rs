// src/exec/processor.rs

//! Service processor that runs a shell command as an external job.
//!
//! The command comes from the record's `cmd` dictionary argument, falling
//! back to the processor's configured command. Where it runs is decided by
//! the record's processing location; how many run at once is decided by the
//! shared [`JobThrottle`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::cluster::{ClusterJob, DEFAULT_CLUSTER_SUBMIT};
use super::error_checker::DefaultErrorChecker;
use super::job::{JobHandle, JobSpec, job_id_for, output_files};
use super::local::LocalProcessJob;
use super::throttle::{JobThrottle, ThrottledJob};
use crate::computation::{
    Computation, ComputationScheduler, CondResult, SuspendCondition, SuspendOptions, budget_exceeded,
};
use crate::engine::lifecycle::{DEFAULT_DEPENDENCY_POLL, LifecycleStages, run_lifecycle};
use crate::engine::{
    DispatchGuard, ErrorChecker, ExecutionContext, ResultHandler, ServiceProcessor, ServiceResult,
};
use crate::errors::ComputationError;
use crate::model::{ServiceArgs, ServiceEvent, ServiceEventKind, ServiceRecord};
use crate::store::{FieldUpdate, ServicePersistence};
use crate::types::ProcessingLocation;

/// Dictionary argument holding the command line.
pub const CMD_ARG: &str = "cmd";

pub const DEFAULT_JOB_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ExeOptions {
    pub default_location: ProcessingLocation,
    /// Parent of per-service workspaces when a record has none.
    pub workspace_root: PathBuf,
    pub cluster_submit: String,
    pub job_poll: Duration,
    pub dependency_poll: Duration,
}

impl Default for ExeOptions {
    fn default() -> Self {
        Self {
            default_location: ProcessingLocation::Local,
            workspace_root: PathBuf::from(".svcflow"),
            cluster_submit: DEFAULT_CLUSTER_SUBMIT.to_string(),
            job_poll: DEFAULT_JOB_POLL,
            dependency_poll: DEFAULT_DEPENDENCY_POLL,
        }
    }
}

/// Result of a command service: where its output went.
#[derive(Debug, Clone)]
pub struct ExeResultHandler {
    workspace_root: PathBuf,
}

impl ExeResultHandler {
    fn workspace<'a>(&'a self, record: &'a ServiceRecord) -> &'a Path {
        record.workspace.as_deref().unwrap_or(&self.workspace_root)
    }
}

impl ResultHandler for ExeResultHandler {
    fn is_result_ready(&self, record: &ServiceRecord) -> bool {
        let [stdout, _] = output_files(record, self.workspace(record));
        stdout.exists()
    }

    fn collect_result(&self, record: &ServiceRecord) -> Result<Option<Value>, ComputationError> {
        let [stdout, stderr] = output_files(record, self.workspace(record));
        Ok(Some(json!({
            "stdout": stdout,
            "stderr": stderr,
        })))
    }
}

/// Runs records named `name` as shell commands.
pub struct ExeServiceProcessor {
    name: String,
    default_command: Option<String>,
    job_type: String,
    store: Arc<dyn ServicePersistence>,
    throttle: JobThrottle,
    runtime: Handle,
    options: ExeOptions,
    results: ExeResultHandler,
    errors: DefaultErrorChecker,
}

impl fmt::Debug for ExeServiceProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExeServiceProcessor")
            .field("name", &self.name)
            .field("job_type", &self.job_type)
            .field("default_command", &self.default_command)
            .finish_non_exhaustive()
    }
}

impl ExeServiceProcessor {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ServicePersistence>,
        throttle: JobThrottle,
        runtime: Handle,
        options: ExeOptions,
    ) -> Self {
        let name = name.into();
        Self {
            job_type: name.clone(),
            name,
            default_command: None,
            store,
            throttle,
            runtime,
            results: ExeResultHandler {
                workspace_root: options.workspace_root.clone(),
            },
            errors: DefaultErrorChecker::new(options.workspace_root.clone()),
            options,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.default_command = Some(command.into());
        self
    }

    /// Throttle bucket; defaults to the processor name.
    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn with_error_pattern(mut self, pattern: &str) -> Self {
        self.errors = self.errors.with_pattern(pattern);
        self
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    fn command_for(&self, record: &ServiceRecord) -> Result<String, ComputationError> {
        record
            .dictionary_str(CMD_ARG)
            .map(str::to_string)
            .or_else(|| self.default_command.clone())
            .ok_or_else(|| {
                ComputationError::Configuration(format!(
                    "service {} has no '{CMD_ARG}' argument",
                    record.label()
                ))
            })
    }

    fn job_handle(&self, record: &ServiceRecord, spec: JobSpec) -> Box<dyn JobHandle> {
        match record
            .processing_location
            .unwrap_or(self.options.default_location)
        {
            ProcessingLocation::Local => Box::new(LocalProcessJob::new(spec, self.runtime.clone())),
            ProcessingLocation::Cluster => Box::new(ClusterJob::new(
                spec,
                self.options.cluster_submit.clone(),
                self.runtime.clone(),
            )),
        }
    }
}

impl ServiceProcessor for ExeServiceProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_record(&self, ctx: &ExecutionContext, args: ServiceArgs) -> ServiceRecord {
        let mut record = ServiceRecord::new(&self.name);
        record.apply_args(args);
        ctx.apply_to(&mut record);
        if let Some(cmd) = &self.default_command
            && !record.dictionary_args.contains_key(CMD_ARG)
        {
            record
                .dictionary_args
                .insert(CMD_ARG.to_string(), Value::String(cmd.clone()));
        }
        record
    }

    fn process(
        self: Arc<Self>,
        scheduler: &ComputationScheduler,
        record: ServiceRecord,
    ) -> Computation<ServiceResult> {
        run_lifecycle(self, scheduler, record)
    }

    fn result_handler(&self) -> &dyn ResultHandler {
        &self.results
    }

    fn error_checker(&self) -> &dyn ErrorChecker {
        &self.errors
    }
}

impl LifecycleStages for ExeServiceProcessor {
    fn store(&self) -> &Arc<dyn ServicePersistence> {
        &self.store
    }

    fn result_handler(&self) -> &dyn ResultHandler {
        &self.results
    }

    fn dependency_poll_interval(&self) -> Duration {
        self.options.dependency_poll
    }

    fn prepare(&self, mut record: ServiceRecord) -> Result<ServiceRecord, ComputationError> {
        self.command_for(&record)?;
        if record.workspace.is_none() {
            let workspace = self.options.workspace_root.join(job_id_for(&record));
            self.store
                .update(&record, &[FieldUpdate::Workspace(Some(workspace.clone()))])?;
            record.workspace = Some(workspace);
        }
        Ok(record)
    }

    fn processing(
        &self,
        scheduler: &ComputationScheduler,
        record: ServiceRecord,
    ) -> Result<Computation<ServiceRecord>, ComputationError> {
        let command = self.command_for(&record)?;
        let workspace = record
            .workspace
            .clone()
            .unwrap_or_else(|| self.options.workspace_root.clone());
        let spec = JobSpec::for_record(&record, command, &workspace);
        let job = self
            .throttle
            .submit(&self.job_type, self.job_handle(&record, spec))?;

        let label = record.label();
        info!(service = %label, job_type = %self.job_type, "job submitted");
        self.store.update(
            &record,
            &[FieldUpdate::Event(ServiceEvent::new(
                ServiceEventKind::Submitted,
                format!("job submitted as {}", job_id_for(&record)),
            ))],
        )?;

        let finished = Arc::clone(&job);
        let checker = self.errors.clone();
        Ok(scheduler
            .completed(record)
            .suspend_until(
                JobCompletion::new(Arc::clone(&self.store), job),
                SuspendOptions::polling(self.options.job_poll),
            )
            .map(move |record| {
                if finished.has_failed() {
                    let info = finished.instance_info();
                    return Err(ComputationError::JobExecution {
                        service: record.id,
                        message: format!("job {} ended as {:?}", info.job_id, info.status),
                    });
                }
                let lines = checker.collect_errors(&record);
                if let Some(first) = lines.first() {
                    return Err(ComputationError::JobExecution {
                        service: record.id,
                        message: format!("{} error line(s) in output, first: {first}", lines.len()),
                    });
                }
                debug!(service = %label, "job finished cleanly");
                Ok(record)
            }))
    }

    fn finally(&self, record: &ServiceRecord, outcome: &Result<ServiceResult, ComputationError>) {
        match outcome {
            Ok(_) => info!(service = %record.label(), "command service finished"),
            Err(e) => warn!(service = %record.label(), error = %e, "command service failed"),
        }
    }
}

/// Holds the processing stage until the throttled job is over.
///
/// Also stops the job when the record is finished from outside (for example
/// canceled by an admin), when it is suspended or dispatched again, or when
/// it runs past its timeout.
pub struct JobCompletion {
    store: Arc<dyn ServicePersistence>,
    job: Arc<ThrottledJob>,
    guard: DispatchGuard,
}

impl JobCompletion {
    pub fn new(store: Arc<dyn ServicePersistence>, job: Arc<ThrottledJob>) -> Self {
        Self {
            store,
            job,
            guard: DispatchGuard::new(),
        }
    }
}

impl SuspendCondition<ServiceRecord> for JobCompletion {
    fn check(
        &mut self,
        record: ServiceRecord,
    ) -> Result<CondResult<ServiceRecord>, ComputationError> {
        let Some(id) = record.id else {
            return Ok(if self.job.is_done() {
                CondResult::satisfied(record)
            } else {
                CondResult::pending(record)
            });
        };
        let current = match self.store.find_by_id(id)? {
            Some(current) => current,
            None => record.clone(),
        };

        if current.state.is_terminal() {
            info!(service = %id, state = %current.state, "service finished externally; stopping job");
            self.job.terminate();
            return Err(ComputationError::Terminated {
                service: id,
                state: current.state,
            });
        }

        if let Err(e) = self.guard.check(&record, &current) {
            info!(service = %id, state = %current.state, "service suspended; stopping job");
            self.job.terminate();
            return Err(e);
        }

        if let Some(budget) = current.timeout {
            let elapsed = current.elapsed(Utc::now());
            if budget_exceeded(elapsed, budget) {
                warn!(service = %id, ?elapsed, ?budget, "job exceeded service timeout; terminating");
                self.job.terminate();
                return Err(ComputationError::Timeout {
                    service: Some(id),
                    elapsed,
                    budget,
                });
            }
        }

        if self.job.is_done() {
            Ok(CondResult::satisfied(current))
        } else {
            Ok(CondResult::pending(current))
        }
    }
}
