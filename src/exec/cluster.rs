// src/exec/cluster.rs

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::info;

use super::job::{JobHandle, JobInstanceInfo, JobSpec};
use super::process::{ProcessMonitor, prepare_command};
use crate::errors::ComputationError;
use crate::types::ProcessingLocation;

pub const DEFAULT_CLUSTER_SUBMIT: &str = "sbatch --wait";

/// Runs the command through a blocking cluster submit command.
///
/// The command is written to a script in the workspace and handed to the
/// submit command (for example `sbatch --wait` or `bsub -K`), which must only
/// return once the cluster job is over. Its exit status is the job's status.
#[derive(Debug)]
pub struct ClusterJob {
    spec: JobSpec,
    submit_command: String,
    monitor: ProcessMonitor,
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

impl ClusterJob {
    pub fn new(spec: JobSpec, submit_command: impl Into<String>, runtime: Handle) -> Self {
        Self {
            spec,
            submit_command: submit_command.into(),
            monitor: ProcessMonitor::new(runtime),
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.spec.workspace.join(format!("{}.sh", self.spec.job_id))
    }

    /// Script body submitted to the cluster.
    pub fn script(&self) -> String {
        let mut script = String::from("#!/bin/sh\n");
        let _ = writeln!(
            script,
            "cd {}",
            shell_quote(&self.spec.workspace.display().to_string())
        );
        for (key, value) in &self.spec.env {
            let _ = writeln!(script, "export {key}={}", shell_quote(value));
        }
        let _ = writeln!(script, "{}", self.spec.command);
        script
    }

    fn submit_argv(&self) -> Result<(String, Vec<String>), ComputationError> {
        let mut parts = self.submit_command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            ComputationError::Configuration("cluster submit command is empty".to_string())
        })?;
        let mut args: Vec<String> = parts.collect();
        args.push(self.script_path().display().to_string());
        Ok((program, args))
    }
}

impl JobHandle for ClusterJob {
    fn start(&self) -> Result<(), ComputationError> {
        let (program, args) = self.submit_argv()?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        prepare_command(&mut cmd, &self.spec)?;

        let script_path = self.script_path();
        fs::write(&script_path, self.script()).map_err(|e| {
            ComputationError::failed(format!(
                "writing job script {}: {e}",
                script_path.display()
            ))
        })?;

        info!(
            job = %self.spec.job_id,
            submit = %self.submit_command,
            script = %script_path.display(),
            "submitting cluster job"
        );
        self.monitor
            .launch(cmd, &self.spec.job_id, self.spec.resources.max_duration)
    }

    fn is_done(&self) -> bool {
        self.monitor.status().is_done()
    }

    fn has_failed(&self) -> bool {
        self.monitor.status().is_failure()
    }

    fn terminate(&self) {
        self.monitor.terminate();
    }

    fn instance_info(&self) -> JobInstanceInfo {
        JobInstanceInfo {
            job_id: self.spec.job_id.clone(),
            backend: ProcessingLocation::Cluster,
            pid: self.monitor.pid(),
            exit_code: self.monitor.exit_code(),
            status: self.monitor.status(),
            stdout: self.spec.stdout_path(),
            stderr: self.spec.stderr_path(),
        }
    }
}
