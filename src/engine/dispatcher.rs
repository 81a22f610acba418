// src/engine/dispatcher.rs

//! Turns admitted services into running computations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::RuntimeEvent;
use super::core::{ServiceEngine, event_for};
use super::dependency_wait::WaitForDependencies;
use super::lifecycle::DEFAULT_DEPENDENCY_POLL;
use super::processor::ServiceResult;
use crate::computation::{Computation, ComputationScheduler, SuspendOptions};
use crate::errors::{ComputationError, Result};
use crate::model::ServiceRecord;
use crate::store::{FieldUpdate, ServicePersistence};
use crate::types::{ServiceId, ServiceState};

pub struct ServiceDispatcher {
    engine: Arc<ServiceEngine>,
    scheduler: ComputationScheduler,
    events: Option<mpsc::Sender<RuntimeEvent>>,
    dependency_poll: Duration,
}

impl fmt::Debug for ServiceDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDispatcher")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl ServiceDispatcher {
    pub fn new(engine: Arc<ServiceEngine>, scheduler: ComputationScheduler) -> Self {
        Self {
            engine,
            scheduler,
            events: None,
            dependency_poll: DEFAULT_DEPENDENCY_POLL,
        }
    }

    /// Send a [`RuntimeEvent::ServiceFinished`] for every finalized service.
    pub fn with_events(mut self, events: mpsc::Sender<RuntimeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_dependency_poll(mut self, poll: Duration) -> Self {
        self.dependency_poll = poll;
        self
    }

    pub fn engine(&self) -> &Arc<ServiceEngine> {
        &self.engine
    }

    /// Dispatch up to `dispatch_batch_size` services.
    ///
    /// Stops early when no slot is free or the queue is empty. An unknown
    /// processor name rejects that service from the queue for good and
    /// returns the `Configuration` error without touching its persisted
    /// state. A service whose SUBMITTED write fails is released from the
    /// queue before the error is returned.
    pub fn dispatch_services(&self) -> Result<Vec<(ServiceId, Computation<ServiceResult>)>> {
        let batch = self.engine.options().dispatch_batch_size.max(1);
        let queue = self.engine.queue();
        let mut dispatched = Vec::new();

        for _ in 0..batch {
            let Some(slot) = self.engine.acquire_slot() else {
                debug!("no processing slot available");
                break;
            };
            let Some(mut record) = queue.dequeue()? else {
                drop(slot);
                break;
            };
            let Some(id) = record.id else {
                queue.abort(&record);
                continue;
            };

            let processor = match self.engine.service_processor(&record.name) {
                Ok(processor) => processor,
                Err(e) => {
                    error!(service = %id, name = %record.name, "no processor registered");
                    queue.reject(&record);
                    drop(slot);
                    return Err(e.into());
                }
            };

            let store = self.engine.store();
            if let Err(e) = mark_submitted(store.as_ref(), &mut record) {
                warn!(service = %id, error = %e, "could not mark service submitted");
                queue.abort(&record);
                drop(slot);
                return Err(e);
            }
            drop(slot);
            info!(service = %id, name = %record.name, "service dispatched");

            let scheduler = self.scheduler.clone();
            let computation = self
                .scheduler
                .completed(record)
                .suspend_until(
                    WaitForDependencies::new(Arc::clone(store)),
                    SuspendOptions::polling(self.dependency_poll),
                )
                .flat_map(move |record| Ok(processor.process(&scheduler, record)))
                .on_complete(self.finalizer(id));
            dispatched.push((id, computation));
        }

        Ok(dispatched)
    }

    fn finalizer(
        &self,
        id: ServiceId,
    ) -> impl FnOnce(&std::result::Result<ServiceResult, ComputationError>) + Send + 'static {
        let engine = Arc::clone(&self.engine);
        let events = self.events.clone();
        move |outcome| {
            let state = finalize(&engine, id, outcome);
            if let (Some(tx), Some(state)) = (events, state)
                && let Err(e) = tx.try_send(RuntimeEvent::ServiceFinished { id, state })
            {
                debug!(service = %id, error = %e, "could not deliver completion event");
            }
        }
    }
}

/// Move a dequeued record to SUBMITTED and stamp its dispatch time.
fn mark_submitted(store: &dyn ServicePersistence, record: &mut ServiceRecord) -> Result<()> {
    store.update_state(
        record,
        ServiceState::Submitted,
        Some(event_for(ServiceState::Submitted, "submitted for processing")),
    )?;
    let started = Utc::now();
    store.update(record, &[FieldUpdate::ProcessStarted(started)])?;
    record.process_started_at = Some(started);
    Ok(())
}

/// Persist the terminal state implied by `outcome` and release the record
/// from the queue. Returns the state the record ended in.
///
/// A suspended outcome writes nothing. The queue entry is only released while
/// the service still waits to be dispatched again; otherwise it belongs to
/// the newer computation.
fn finalize(
    engine: &ServiceEngine,
    id: ServiceId,
    outcome: &std::result::Result<ServiceResult, ComputationError>,
) -> Option<ServiceState> {
    let store = engine.store();
    let mut record = match store.find_by_id(id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(service = %id, "finished service vanished from persistence");
            return None;
        }
        Err(e) => {
            error!(service = %id, error = %e, "could not load finished service");
            return None;
        }
    };

    if let Err(ComputationError::Suspended { .. }) = outcome {
        if record.is_suspended() || record.state.is_admissible() {
            engine.queue().complete(&record);
        }
        debug!(service = %id, state = %record.state, "suspended computation dropped");
        return None;
    }

    let (target, message) = match outcome {
        Ok(_) => (ServiceState::Successful, "service completed".to_string()),
        Err(e) => {
            let e = e.clone().with_service(id);
            (e.terminal_state(), e.to_string())
        }
    };

    if !record.has_completed() {
        write_terminal(engine, &mut record, target, message);
    }
    engine.queue().complete(&record);

    info!(service = %id, state = %record.state, "service finalized");
    Some(record.state)
}

fn write_terminal(
    engine: &ServiceEngine,
    record: &mut ServiceRecord,
    target: ServiceState,
    message: String,
) {
    let id = record.label();
    if !record.state.can_transition_to(target) {
        warn!(service = %id, from = %record.state, to = %target, "cannot finalize from current state");
        return;
    }
    if let Err(e) = engine
        .store()
        .update_state(record, target, Some(event_for(target, message)))
    {
        error!(service = %id, error = %e, "failed to persist final state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::core::{EngineOptions, ServiceRegistry};
    use crate::store::InMemoryServiceStore;

    fn engine() -> (Arc<InMemoryServiceStore>, ServiceEngine) {
        let store = Arc::new(InMemoryServiceStore::new());
        let engine = ServiceEngine::new(store.clone(), ServiceRegistry::new(), EngineOptions::default());
        (store, engine)
    }

    #[test]
    fn finalize_maps_errors_to_states() {
        let (store, engine) = engine();
        let mut record = ServiceRecord::new("x");
        record.state = ServiceState::Running;
        let id = store.save(&mut record).unwrap();

        let timeout = Err(ComputationError::Timeout {
            service: None,
            elapsed: Duration::from_millis(20),
            budget: Duration::from_millis(10),
        });
        assert_eq!(finalize(&engine, id, &timeout), Some(ServiceState::Timeout));

        // Terminal records are left alone.
        let ok = Ok(ServiceResult {
            record: record.clone(),
            value: None,
        });
        assert_eq!(finalize(&engine, id, &ok), Some(ServiceState::Timeout));
    }

    #[test]
    fn suspended_outcome_writes_nothing() {
        let (store, engine) = engine();
        let mut record = ServiceRecord::new("x");
        record.state = ServiceState::Suspended;
        let id = store.save(&mut record).unwrap();

        let suspended = Err(ComputationError::Suspended { service: id });
        assert_eq!(finalize(&engine, id, &suspended), None);
        let stored = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(stored.state, ServiceState::Suspended);
        assert!(stored.events.is_empty());
    }

    #[test]
    fn suspended_outcome_leaves_a_newer_dispatch_tracked() {
        let (store, engine) = engine();
        let mut record = ServiceRecord::new("x");
        let id = store.save(&mut record).unwrap();
        engine.queue().enqueue(record).unwrap();
        let mut taken = engine.queue().dequeue().unwrap().unwrap();
        mark_submitted(store.as_ref(), &mut taken).unwrap();
        assert!(taken.process_started_at.is_some());

        let suspended = Err(ComputationError::Suspended { service: id });
        assert_eq!(finalize(&engine, id, &suspended), None);
        assert_eq!(engine.queue().submitted_ids(), vec![id]);
    }
}
