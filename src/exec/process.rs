// src/exec/process.rs

//! Child process supervision shared by the job backends.

use std::fs::{self, File};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::job::{JobSpec, JobStatus};
use crate::errors::ComputationError;

#[derive(Debug, Clone)]
struct MonitorState {
    status: JobStatus,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

/// Owns the lifecycle of one child process.
///
/// The child runs in a tokio task; the synchronous accessors only read the
/// shared state that task maintains.
#[derive(Debug)]
pub struct ProcessMonitor {
    runtime: Handle,
    state: Arc<Mutex<MonitorState>>,
    cancel: Arc<Notify>,
    started: AtomicBool,
}

fn lock(state: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build a shell command appropriate for the platform.
pub fn shell_command(command_line: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command_line);
        c
    }
}

/// Point stdout/stderr of `cmd` at the job's output files and set its
/// working directory and environment.
pub fn prepare_command(cmd: &mut Command, spec: &JobSpec) -> Result<(), ComputationError> {
    fs::create_dir_all(&spec.workspace).map_err(|e| {
        ComputationError::failed(format!(
            "creating workspace {}: {e}",
            spec.workspace.display()
        ))
    })?;
    let open = |path: std::path::PathBuf| {
        File::create(&path).map_err(|e| {
            ComputationError::failed(format!("creating output file {}: {e}", path.display()))
        })
    };
    let stdout = open(spec.stdout_path())?;
    let stderr = open(spec.stderr_path())?;

    cmd.current_dir(&spec.workspace)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);
    Ok(())
}

impl ProcessMonitor {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            state: Arc::new(Mutex::new(MonitorState {
                status: JobStatus::Pending,
                pid: None,
                exit_code: None,
            })),
            cancel: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn `cmd` under supervision. Only the first call launches anything.
    pub fn launch(
        &self,
        cmd: Command,
        job_id: &str,
        max_duration: Option<Duration>,
    ) -> Result<(), ComputationError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ComputationError::failed(format!(
                "job {job_id} was already started"
            )));
        }
        {
            let mut state = lock(&self.state);
            if state.status == JobStatus::Terminated {
                return Ok(());
            }
            state.status = JobStatus::Running;
        }

        let state = Arc::clone(&self.state);
        let cancel = Arc::clone(&self.cancel);
        let job_id = job_id.to_string();
        self.runtime
            .spawn(async move { supervise(cmd, job_id, state, cancel, max_duration).await });
        Ok(())
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.state).status.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.state).pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.state).exit_code
    }

    pub fn terminate(&self) {
        let mut state = lock(&self.state);
        match state.status {
            JobStatus::Pending => state.status = JobStatus::Terminated,
            JobStatus::Running => {
                drop(state);
                // `notify_one` keeps a permit if the supervisor is not
                // waiting yet.
                self.cancel.notify_one();
            }
            _ => {}
        }
    }
}

async fn supervise(
    mut cmd: Command,
    job_id: String,
    state: Arc<Mutex<MonitorState>>,
    cancel: Arc<Notify>,
    max_duration: Option<Duration>,
) {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(job = %job_id, error = %e, "failed to spawn job process");
            lock(&state).status = JobStatus::Failed(format!("spawning process: {e}"));
            return;
        }
    };
    lock(&state).pid = child.id();
    info!(job = %job_id, pid = ?child.id(), "job process started");

    let deadline = async {
        match max_duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    // Either the process exits on its own, or it is canceled, or it runs out
    // of time.
    let (status, exit_code) = tokio::select! {
        waited = child.wait() => match waited {
            Ok(exit) => {
                let code = exit.code();
                info!(job = %job_id, exit_code = ?code, success = exit.success(), "job process exited");
                if exit.success() {
                    (JobStatus::Succeeded, code)
                } else {
                    let shown = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                    (JobStatus::Failed(format!("exit code {shown}")), code)
                }
            }
            Err(e) => (JobStatus::Failed(format!("waiting for process: {e}")), None),
        },
        _ = cancel.notified() => {
            info!(job = %job_id, "termination requested; killing job process");
            if let Err(e) = child.kill().await {
                warn!(job = %job_id, error = %e, "failed to kill job process");
            }
            (JobStatus::Terminated, None)
        }
        _ = deadline => {
            warn!(job = %job_id, "job exceeded its max duration; killing");
            if let Err(e) = child.kill().await {
                warn!(job = %job_id, error = %e, "failed to kill job process");
            }
            (JobStatus::Failed("exceeded max duration".to_string()), None)
        }
    };

    debug!(job = %job_id, ?status, "job supervision finished");
    let mut state = lock(&state);
    state.status = status;
    state.exit_code = exit_code;
}
