// src/engine/lifecycle.rs

//! Standard processing pipeline shared by processors.
//!
//! ```text
//! prepare -> persist child services -> wait for dependencies
//!         -> processing -> wait for result -> collect + persist result
//!         -> post-process -> finally
//! ```
//!
//! A processor implements [`LifecycleStages`] and calls [`run_lifecycle`]
//! from [`ServiceProcessor::process`](super::processor::ServiceProcessor::process).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::dependency_wait::WaitForDependencies;
use super::processor::{ResultHandler, ServiceResult};
use crate::computation::{
    Computation, ComputationScheduler, CondResult, SuspendOptions, budget_exceeded,
};
use crate::errors::ComputationError;
use crate::model::{ServiceEvent, ServiceEventKind, ServiceRecord};
use crate::store::{FieldUpdate, ServicePersistence};

pub const DEFAULT_DEPENDENCY_POLL: Duration = Duration::from_millis(500);
pub const DEFAULT_RESULT_POLL: Duration = Duration::from_millis(250);

pub trait LifecycleStages: Send + Sync + 'static {
    fn store(&self) -> &Arc<dyn ServicePersistence>;

    fn result_handler(&self) -> &dyn ResultHandler;

    fn dependency_poll_interval(&self) -> Duration {
        DEFAULT_DEPENDENCY_POLL
    }

    fn result_poll_interval(&self) -> Duration {
        DEFAULT_RESULT_POLL
    }

    fn prepare(&self, record: ServiceRecord) -> Result<ServiceRecord, ComputationError> {
        Ok(record)
    }

    /// Child services to persist before waiting on dependencies.
    fn child_services(&self, _record: &ServiceRecord) -> Result<Vec<ServiceRecord>, ComputationError> {
        Ok(Vec::new())
    }

    /// The actual work; resolves once the service's external job is over.
    fn processing(
        &self,
        scheduler: &ComputationScheduler,
        record: ServiceRecord,
    ) -> Result<Computation<ServiceRecord>, ComputationError>;

    fn post_process(&self, result: ServiceResult) -> Result<ServiceResult, ComputationError> {
        Ok(result)
    }

    /// Always called once with the final outcome.
    fn finally(&self, _record: &ServiceRecord, _outcome: &Result<ServiceResult, ComputationError>) {}
}

fn persist_children<L: LifecycleStages>(
    stages: &L,
    record: ServiceRecord,
) -> Result<ServiceRecord, ComputationError> {
    let children = stages.child_services(&record)?;
    if children.is_empty() {
        return Ok(record);
    }

    let store = stages.store();
    for mut child in children {
        child.parent_id = record.id;
        child.queue_id = None;
        child.push_event(ServiceEvent::new(
            ServiceEventKind::Created,
            format!("created as child of {}", record.label()),
        ));
        let id = store.save(&mut child)?;
        debug!(parent = %record.label(), child = %id, "child service persisted");
    }
    Ok(record)
}

/// Waits until the handler reports the result ready, enforcing the record's
/// timeout budget from its process start.
fn result_ready<L: LifecycleStages>(
    stages: Arc<L>,
) -> impl FnMut(ServiceRecord) -> Result<CondResult<ServiceRecord>, ComputationError> + Send {
    move |record: ServiceRecord| {
        if stages.result_handler().is_result_ready(&record) {
            return Ok(CondResult::satisfied(record));
        }
        if let Some(budget) = record.timeout {
            let elapsed = record.elapsed(Utc::now());
            if budget_exceeded(elapsed, budget) {
                return Err(ComputationError::Timeout {
                    service: record.id,
                    elapsed,
                    budget,
                });
            }
        }
        Ok(CondResult::pending(record))
    }
}

fn collect_result<L: LifecycleStages>(
    stages: &L,
    record: ServiceRecord,
) -> Result<ServiceResult, ComputationError> {
    let value = stages.result_handler().collect_result(&record)?;
    if value.is_some() {
        stages
            .store()
            .update(&record, &[FieldUpdate::Result(value.clone())])?;
    }
    let record = match record.id {
        Some(id) => stages.store().find_by_id(id)?.unwrap_or(record),
        None => record,
    };
    Ok(ServiceResult { record, value })
}

/// Build the full pipeline for `record`.
pub fn run_lifecycle<L: LifecycleStages>(
    stages: Arc<L>,
    scheduler: &ComputationScheduler,
    record: ServiceRecord,
) -> Computation<ServiceResult> {
    let label = record.label();
    let id = record.id;
    info!(service = %label, "starting service lifecycle");

    let prepare = Arc::clone(&stages);
    let children = Arc::clone(&stages);
    let processing = Arc::clone(&stages);
    let collect = Arc::clone(&stages);
    let post = Arc::clone(&stages);
    let finish = Arc::clone(&stages);
    let processing_scheduler = scheduler.clone();

    scheduler
        .completed(record)
        .map(move |r| prepare.prepare(r))
        .map(move |r| persist_children(children.as_ref(), r))
        .suspend_until(
            WaitForDependencies::new(Arc::clone(stages.store())),
            SuspendOptions::polling(stages.dependency_poll_interval()),
        )
        .flat_map(move |r| processing.processing(&processing_scheduler, r))
        .suspend_until(
            result_ready(Arc::clone(&stages)),
            SuspendOptions::polling(stages.result_poll_interval()),
        )
        .map(move |r| collect_result(collect.as_ref(), r))
        .map(move |result| post.post_process(result))
        .on_complete(move |outcome| {
            let record = match outcome {
                Ok(result) => {
                    debug!(service = %label, "service lifecycle finished");
                    Some(result.record.clone())
                }
                Err(e) => {
                    warn!(service = %label, error = %e, "service lifecycle failed");
                    id.and_then(|id| finish.store().find_by_id(id).ok().flatten())
                }
            };
            match record {
                Some(record) => finish.finally(&record, outcome),
                None => warn!(service = %label, "record unavailable for final stage"),
            }
        })
}
