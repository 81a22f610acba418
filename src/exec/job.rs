// src/exec/job.rs

//! Handles on external jobs.
//!
//! Every method is synchronous and cheap: condition checks call them from
//! worker threads, so none of them may wait for the job itself.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::ComputationError;
use crate::model::{ResourceHints, ServiceRecord};
use crate::types::ProcessingLocation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    Terminated,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed(_) | JobStatus::Terminated
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed(_) | JobStatus::Terminated)
    }
}

/// Snapshot of a job instance for logs and results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInstanceInfo {
    pub job_id: String,
    pub backend: ProcessingLocation,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub status: JobStatus,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

pub trait JobHandle: Send + Sync + Debug {
    fn start(&self) -> Result<(), ComputationError>;

    fn is_done(&self) -> bool;

    fn has_failed(&self) -> bool;

    /// Ask the job to stop. A job that never started will not start.
    fn terminate(&self);

    fn instance_info(&self) -> JobInstanceInfo;
}

/// What to run and where.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_id: String,
    pub command: String,
    pub workspace: PathBuf,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceHints,
}

impl JobSpec {
    pub fn for_record(record: &ServiceRecord, command: impl Into<String>, workspace: &Path) -> Self {
        Self {
            job_id: job_id_for(record),
            command: command.into(),
            workspace: workspace.to_path_buf(),
            env: record.env.clone(),
            resources: record.resources.clone(),
        }
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.workspace.join(format!("{}.out", self.job_id))
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.workspace.join(format!("{}.err", self.job_id))
    }
}

/// Stable file stem for a record's job files.
pub fn job_id_for(record: &ServiceRecord) -> String {
    let name: String = record
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    match record.id {
        Some(id) => format!("{name}-{id}"),
        None => name,
    }
}

/// Output files written by the job of `record` inside `workspace`.
pub fn output_files(record: &ServiceRecord, workspace: &Path) -> [PathBuf; 2] {
    let stem = job_id_for(record);
    [
        workspace.join(format!("{stem}.out")),
        workspace.join(format!("{stem}.err")),
    ]
}
