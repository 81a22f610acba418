// src/engine/core.rs

//! Service engine: processing slots, the processor registry, submission and
//! admin operations.
//!
//! The engine itself never runs anything. The dispatcher pulls from the
//! admission queue it owns and builds the computations.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::processor::{ExecutionContext, ServiceProcessor};
use super::queue::{AdmissionQueue, DEFAULT_MAX_READY_CAPACITY, DEFAULT_STALE_SUBMISSION};
use crate::errors::{ComputationError, Result, SvcflowError};
use crate::model::{ServiceArgs, ServiceEvent, ServiceEventKind, ServiceRecord};
use crate::store::{FieldUpdate, ServicePersistence};
use crate::types::{ServiceId, ServiceState};

pub const DEFAULT_PROCESSING_SLOTS: usize = 1000;
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 20;

/// Engine sizing (`[engine]` in the config file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub queue_id: String,
    pub processing_slots: usize,
    pub max_ready_capacity: usize,
    pub dispatch_batch_size: usize,
    pub stale_submission: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            queue_id: "local".to_string(),
            processing_slots: DEFAULT_PROCESSING_SLOTS,
            max_ready_capacity: DEFAULT_MAX_READY_CAPACITY,
            dispatch_batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            stale_submission: DEFAULT_STALE_SUBMISSION,
        }
    }
}

/// Name → processor map, filled once at startup.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    processors: HashMap<String, Arc<dyn ServiceProcessor>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` under its own name, replacing any previous one.
    pub fn register(&mut self, processor: Arc<dyn ServiceProcessor>) -> &mut Self {
        let name = processor.name().to_string();
        if self.processors.insert(name.clone(), processor).is_some() {
            warn!(service = %name, "processor registered twice; keeping the last one");
        }
        self
    }

    pub fn with(mut self, processor: Arc<dyn ServiceProcessor>) -> Self {
        self.register(processor);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceProcessor>> {
        self.processors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One entry of a [`ServiceEngine::submit_multiple_services`] batch.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub name: String,
    pub args: ServiceArgs,
    pub context: ExecutionContext,
}

impl ServiceRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: ServiceArgs::default(),
            context: ExecutionContext::default(),
        }
    }
}

/// Admin changes accepted by [`ServiceEngine::update_service`].
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdate {
    pub priority: Option<i32>,
    pub timeout: Option<Option<Duration>>,
    pub workspace: Option<Option<PathBuf>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub available_slots: usize,
    pub waiting_capacity: usize,
    pub waiting_services_count: usize,
    pub running_services_count: usize,
    pub running_service_ids: Vec<ServiceId>,
}

pub struct ServiceEngine {
    store: Arc<dyn ServicePersistence>,
    queue: AdmissionQueue,
    registry: ServiceRegistry,
    slots: Arc<Semaphore>,
    /// Permits still to be withdrawn after a slot reduction.
    slot_debt: AtomicUsize,
    slot_total: AtomicUsize,
    options: EngineOptions,
}

impl fmt::Debug for ServiceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEngine")
            .field("queue", &self.queue)
            .field("registry", &self.registry)
            .field("available_slots", &self.available_slots())
            .finish_non_exhaustive()
    }
}

impl ServiceEngine {
    pub fn new(
        store: Arc<dyn ServicePersistence>,
        registry: ServiceRegistry,
        options: EngineOptions,
    ) -> Self {
        let queue = AdmissionQueue::new(
            Arc::clone(&store),
            options.queue_id.clone(),
            options.max_ready_capacity,
            options.stale_submission,
        );
        Self {
            store,
            queue,
            registry,
            slots: Arc::new(Semaphore::new(options.processing_slots)),
            slot_debt: AtomicUsize::new(0),
            slot_total: AtomicUsize::new(options.processing_slots),
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ServicePersistence> {
        &self.store
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Try to take a processing slot; released when the permit drops.
    pub fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        loop {
            let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;
            let debt = self.slot_debt.load(Ordering::Acquire);
            if debt == 0 {
                return Some(permit);
            }
            if self
                .slot_debt
                .compare_exchange(debt, debt - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                permit.forget();
            } else {
                drop(permit);
            }
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots
            .available_permits()
            .saturating_sub(self.slot_debt.load(Ordering::Acquire))
    }

    pub fn set_processing_slots(&self, slots: usize) {
        let previous = self.slot_total.swap(slots, Ordering::AcqRel);
        if slots > previous {
            let mut grow = slots - previous;
            // Cancel outstanding debt before adding fresh permits.
            let debt = self.slot_debt.swap(0, Ordering::AcqRel);
            let cancelled = debt.min(grow);
            self.slot_debt.fetch_add(debt - cancelled, Ordering::AcqRel);
            grow -= cancelled;
            self.slots.add_permits(grow);
        } else if slots < previous {
            let shrink = previous - slots;
            let forgotten = self.slots.forget_permits(shrink);
            self.slot_debt.fetch_add(shrink - forgotten, Ordering::AcqRel);
        }
        info!(previous, slots, "processing slots updated");
    }

    pub fn set_max_waiting_slots(&self, capacity: usize) {
        self.queue.set_max_ready_capacity(capacity);
    }

    pub fn service_processor(
        &self,
        name: &str,
    ) -> std::result::Result<Arc<dyn ServiceProcessor>, ComputationError> {
        self.registry
            .get(name)
            .ok_or_else(|| ComputationError::Configuration(format!("unknown service: {name}")))
    }

    /// Create, persist and offer one service to the admission queue.
    pub fn submit_single_service(
        &self,
        name: &str,
        args: ServiceArgs,
        context: &ExecutionContext,
    ) -> Result<ServiceRecord> {
        let processor = self
            .registry
            .get(name)
            .ok_or_else(|| SvcflowError::UnknownService(name.to_string()))?;

        let mut record = processor.create_record(context, args);
        record.push_event(ServiceEvent::new(ServiceEventKind::Created, "service created"));
        let id = self.store.save(&mut record)?;
        info!(service = %id, name = %record.name, priority = record.priority, "service submitted");

        if !self.queue.enqueue(record.clone())? {
            debug!(service = %id, "service left in backlog until the queue has room");
        }
        Ok(self.store.find_by_id(id)?.unwrap_or(record))
    }

    /// Submit `requests` as a chain: each one depends on the one before it and
    /// earlier entries get strictly higher priority.
    pub fn submit_multiple_services(
        &self,
        requests: Vec<ServiceRequest>,
    ) -> Result<Vec<ServiceRecord>> {
        let count = requests.len() as i32;
        let base = requests
            .iter()
            .filter_map(|r| r.context.priority)
            .max()
            .unwrap_or(0);

        let mut previous: Option<ServiceId> = None;
        let mut submitted = Vec::with_capacity(requests.len());
        for (index, request) in requests.into_iter().enumerate() {
            let mut context = request.context;
            context.priority = Some(base + (count - index as i32));
            if let Some(prev) = previous
                && !context.dependencies.contains(&prev)
            {
                context.dependencies.push(prev);
            }

            let record = self.submit_single_service(&request.name, request.args, &context)?;
            previous = record.id;
            submitted.push(record);
        }
        Ok(submitted)
    }

    pub fn server_stats(&self) -> ServerStats {
        ServerStats {
            available_slots: self.available_slots(),
            waiting_capacity: self.queue.max_ready_capacity(),
            waiting_services_count: self.queue.waiting_len(),
            running_services_count: self.queue.submitted_len(),
            running_service_ids: self.queue.submitted_ids(),
        }
    }

    fn load(&self, id: ServiceId) -> Result<ServiceRecord> {
        self.store
            .find_by_id(id)?
            .ok_or_else(|| SvcflowError::Persistence(format!("service {id} not found")))
    }

    /// Change priority, timeout or workspace of a service.
    pub fn update_service(&self, id: ServiceId, update: ServiceUpdate) -> Result<ServiceRecord> {
        let record = self.load(id)?;

        let mut updates = Vec::new();
        if let Some(priority) = update.priority {
            updates.push(FieldUpdate::Priority(priority));
        }
        if let Some(timeout) = update.timeout {
            updates.push(FieldUpdate::Timeout(timeout));
        }
        if let Some(workspace) = update.workspace {
            updates.push(FieldUpdate::Workspace(workspace));
        }

        if self.store.update(&record, &updates)? {
            self.store.update(
                &record,
                &[FieldUpdate::Event(ServiceEvent::new(
                    ServiceEventKind::Updated,
                    "service updated by admin",
                ))],
            )?;
            info!(service = %id, "service updated");
        }
        self.load(id)
    }

    /// Admin state change. Suspending or resuming applies to the whole
    /// hierarchy under `id`. An unsuccessful service may be sent to `Retry`,
    /// which puts it back in the queue.
    pub fn update_service_state(&self, id: ServiceId, state: ServiceState) -> Result<ServiceRecord> {
        self.change_service_state(id, state, false)
    }

    /// Same as [`Self::update_service_state`], without the transition checks.
    pub fn force_service_state(&self, id: ServiceId, state: ServiceState) -> Result<ServiceRecord> {
        self.change_service_state(id, state, true)
    }

    /// Re-run a service that ended in ERROR, CANCELED or TIMEOUT.
    pub fn retry_service(&self, id: ServiceId) -> Result<ServiceRecord> {
        self.change_service_state(id, ServiceState::Retry, false)
    }

    fn change_service_state(
        &self,
        id: ServiceId,
        state: ServiceState,
        force: bool,
    ) -> Result<ServiceRecord> {
        let record = self.load(id)?;
        if !admin_transition_allowed(record.state, state, force) {
            return Err(SvcflowError::InvalidTransition {
                service: id,
                from: record.state,
                to: state,
            });
        }

        let targets = match state {
            ServiceState::Suspended | ServiceState::Resumed => {
                self.store.find_service_hierarchy(id)?
            }
            _ => vec![record],
        };

        for mut target in targets {
            if target.state == state || !admin_transition_allowed(target.state, state, force) {
                continue;
            }
            let event = Some(event_for(state, format!("state set to {state} by admin")));
            let written = if target.state.can_transition_to(state) {
                self.store.update_state(&mut target, state, event)?
            } else {
                info!(
                    service = %target.label(),
                    from = %target.state,
                    to = %state,
                    force,
                    "overriding lifecycle transition"
                );
                self.store.force_state(&mut target, state, event)?
            };
            if !written {
                continue;
            }

            if state.is_terminal() || state == ServiceState::Suspended {
                self.queue.abort(&target);
            } else if state.is_admissible() {
                self.queue.enqueue(target)?;
            }
        }
        self.load(id)
    }
}

/// Admin moves: the lifecycle table, plus retrying an unsuccessful service,
/// plus anything at all when forced.
fn admin_transition_allowed(from: ServiceState, to: ServiceState, force: bool) -> bool {
    force || from.can_transition_to(to) || (to == ServiceState::Retry && from.can_retry())
}

fn event_kind_for(state: ServiceState) -> ServiceEventKind {
    match state {
        ServiceState::Created => ServiceEventKind::Created,
        ServiceState::Queued => ServiceEventKind::Queued,
        ServiceState::Submitted => ServiceEventKind::Submitted,
        ServiceState::Running => ServiceEventKind::Running,
        ServiceState::WaitingForDependencies => ServiceEventKind::WaitingForDependencies,
        ServiceState::Suspended => ServiceEventKind::Suspended,
        ServiceState::Resumed | ServiceState::Retry => ServiceEventKind::Resumed,
        ServiceState::Successful => ServiceEventKind::Completed,
        ServiceState::Error => ServiceEventKind::Failed,
        ServiceState::Canceled => ServiceEventKind::Canceled,
        ServiceState::Timeout => ServiceEventKind::Timeout,
    }
}

pub(crate) fn event_for(state: ServiceState, message: impl Into<String>) -> ServiceEvent {
    ServiceEvent::new(event_kind_for(state), message)
}
