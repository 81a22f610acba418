// src/exec/local.rs

use tokio::runtime::Handle;
use tracing::info;

use super::job::{JobHandle, JobInstanceInfo, JobSpec};
use super::process::{ProcessMonitor, prepare_command, shell_command};
use crate::errors::ComputationError;
use crate::types::ProcessingLocation;

/// Runs the command as a child process of this host.
#[derive(Debug)]
pub struct LocalProcessJob {
    spec: JobSpec,
    monitor: ProcessMonitor,
}

impl LocalProcessJob {
    pub fn new(spec: JobSpec, runtime: Handle) -> Self {
        Self {
            spec,
            monitor: ProcessMonitor::new(runtime),
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }
}

impl JobHandle for LocalProcessJob {
    fn start(&self) -> Result<(), ComputationError> {
        let mut cmd = shell_command(&self.spec.command);
        prepare_command(&mut cmd, &self.spec)?;
        info!(
            job = %self.spec.job_id,
            cmd = %self.spec.command,
            workspace = %self.spec.workspace.display(),
            "starting local job"
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
            backend: ProcessingLocation::Local,
            pid: self.monitor.pid(),
            exit_code: self.monitor.exit_code(),
            status: self.monitor.status(),
            stdout: self.spec.stdout_path(),
            stderr: self.spec.stderr_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::exec::job::JobStatus;
    use crate::model::ResourceHints;

    fn spec(dir: &std::path::Path, command: &str) -> JobSpec {
        JobSpec {
            job_id: "job-1".into(),
            command: command.into(),
            workspace: dir.to_path_buf(),
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            resources: ResourceHints::default(),
        }
    }

    async fn wait_done(job: &LocalProcessJob) {
        for _ in 0..200 {
            if job.is_done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn writes_output_to_workspace_files() {
        let dir = tempfile::tempdir().unwrap();
        let job = LocalProcessJob::new(spec(dir.path(), "echo $GREETING"), Handle::current());
        job.start().unwrap();
        wait_done(&job).await;

        assert!(!job.has_failed());
        let out = std::fs::read_to_string(job.spec().stdout_path()).unwrap();
        assert_eq!(out.trim(), "hello");
        assert_eq!(job.instance_info().exit_code, Some(0));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let job = LocalProcessJob::new(spec(dir.path(), "exit 3"), Handle::current());
        job.start().unwrap();
        wait_done(&job).await;

        assert!(job.has_failed());
        assert_eq!(
            job.instance_info().status,
            JobStatus::Failed("exit code 3".into())
        );
    }

    #[tokio::test]
    async fn terminate_kills_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let job = LocalProcessJob::new(spec(dir.path(), "sleep 30"), Handle::current());
        job.start().unwrap();
        job.terminate();
        wait_done(&job).await;
        assert_eq!(job.instance_info().status, JobStatus::Terminated);
    }
}
