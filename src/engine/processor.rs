// src/engine/processor.rs

//! Service processors: the pluggable piece that knows how to run one kind of
//! service.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::computation::{Computation, ComputationScheduler};
use crate::errors::ComputationError;
use crate::model::{ServiceArgs, ServiceRecord};
use crate::types::{ProcessingLocation, ServiceId};

/// Where a submission comes from and how the new record should be placed.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub parent: Option<ServiceId>,
    pub dependencies: Vec<ServiceId>,
    pub priority: Option<i32>,
    pub timeout: Option<Duration>,
    pub processing_location: Option<ProcessingLocation>,
    pub workspace: Option<PathBuf>,
}

impl ExecutionContext {
    pub fn child_of(parent: &ServiceRecord) -> Self {
        Self {
            parent: parent.id,
            priority: Some(parent.priority),
            processing_location: parent.processing_location,
            workspace: parent.workspace.clone(),
            ..Self::default()
        }
    }

    /// Copy placement fields onto `record`.
    pub fn apply_to(&self, record: &mut ServiceRecord) {
        record.parent_id = self.parent;
        record.dependencies.extend(self.dependencies.iter().copied());
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if self.timeout.is_some() {
            record.timeout = self.timeout;
        }
        if self.processing_location.is_some() {
            record.processing_location = self.processing_location;
        }
        if self.workspace.is_some() {
            record.workspace = self.workspace.clone();
        }
    }
}

/// Final value of a processed service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResult {
    pub record: ServiceRecord,
    pub value: Option<Value>,
}

pub trait ResultHandler: Send + Sync {
    fn is_result_ready(&self, record: &ServiceRecord) -> bool;

    fn collect_result(&self, record: &ServiceRecord) -> Result<Option<Value>, ComputationError>;

    /// Result as stored on the record, if any.
    fn persisted_result(&self, record: &ServiceRecord) -> Option<Value> {
        record.result.clone()
    }
}

pub trait ErrorChecker: Send + Sync {
    /// Error lines found for `record`; empty means no errors.
    fn collect_errors(&self, record: &ServiceRecord) -> Vec<String>;
}

/// Result handler for services that produce no value.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyResult;

impl ResultHandler for EmptyResult {
    fn is_result_ready(&self, _record: &ServiceRecord) -> bool {
        true
    }

    fn collect_result(&self, _record: &ServiceRecord) -> Result<Option<Value>, ComputationError> {
        Ok(None)
    }
}

/// Error checker that never reports anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoErrors;

impl ErrorChecker for NoErrors {
    fn collect_errors(&self, _record: &ServiceRecord) -> Vec<String> {
        Vec::new()
    }
}

pub trait ServiceProcessor: Send + Sync + Debug {
    /// Registry key; records with this `name` are routed here.
    fn name(&self) -> &str;

    fn create_record(&self, ctx: &ExecutionContext, args: ServiceArgs) -> ServiceRecord {
        let mut record = ServiceRecord::new(self.name());
        record.apply_args(args);
        ctx.apply_to(&mut record);
        record
    }

    /// Build the computation that runs `record` to completion.
    ///
    /// Must not block: anything long-running belongs in a suspended stage.
    fn process(
        self: Arc<Self>,
        scheduler: &ComputationScheduler,
        record: ServiceRecord,
    ) -> Computation<ServiceResult>;

    fn result_handler(&self) -> &dyn ResultHandler;

    fn error_checker(&self) -> &dyn ErrorChecker;
}
