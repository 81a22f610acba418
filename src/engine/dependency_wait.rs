// src/engine/dependency_wait.rs

//! Suspend condition that holds a service until its dependencies are done.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::computation::{CondResult, SuspendCondition, budget_exceeded};
use crate::errors::ComputationError;
use crate::model::{ServiceEvent, ServiceEventKind, ServiceRecord};
use crate::store::{FieldUpdate, ServicePersistence};
use crate::types::{ServiceId, ServiceState};

/// Tells a computation that its service has been taken away from it.
///
/// That is the case while the service is suspended or waits in the queue
/// again (resumed or retried), and once it was dispatched anew: every
/// dispatch stamps a fresh `process_started_at`, so a stamp that differs
/// from the one the computation started with means a newer computation
/// owns the service.
#[derive(Debug, Clone, Default)]
pub struct DispatchGuard {
    mark: Option<Option<DateTime<Utc>>>,
}

impl DispatchGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `carried` is the record this computation holds; the first call
    /// remembers its dispatch stamp. `current` is the persisted copy.
    pub fn check(
        &mut self,
        carried: &ServiceRecord,
        current: &ServiceRecord,
    ) -> Result<(), ComputationError> {
        let mark = *self.mark.get_or_insert(carried.process_started_at);
        let Some(id) = current.id else {
            return Ok(());
        };
        if current.is_suspended() || current.state.is_admissible() {
            debug!(service = %id, state = %current.state, "service no longer dispatched");
            return Err(ComputationError::Suspended { service: id });
        }
        if current.process_started_at != mark {
            debug!(service = %id, "service dispatched again; dropping this computation");
            return Err(ComputationError::Suspended { service: id });
        }
        Ok(())
    }
}

/// Re-checks the persisted dependencies of the carried record.
///
/// Dependencies are the declared ones plus any child services. Each check
/// writes a state change only when the state actually differs.
pub struct WaitForDependencies {
    store: Arc<dyn ServicePersistence>,
    guard: DispatchGuard,
}

impl fmt::Debug for WaitForDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForDependencies").finish_non_exhaustive()
    }
}

impl WaitForDependencies {
    pub fn new(store: Arc<dyn ServicePersistence>) -> Self {
        Self {
            store,
            guard: DispatchGuard::new(),
        }
    }

    fn move_to(
        &self,
        record: &mut ServiceRecord,
        state: ServiceState,
        kind: ServiceEventKind,
        message: String,
    ) -> Result<(), ComputationError> {
        if record.state == state || !record.state.can_transition_to(state) {
            return Ok(());
        }
        self.store
            .update_state(record, state, Some(ServiceEvent::new(kind, message)))?;
        Ok(())
    }

    fn evaluate(&mut self, record: ServiceRecord) -> Result<CondResult<ServiceRecord>, ComputationError> {
        let id = record.id.ok_or_else(|| {
            ComputationError::Configuration(format!("service '{}' was never saved", record.name))
        })?;
        let mut current = self.store.find_by_id(id)?.ok_or_else(|| {
            ComputationError::failed(format!("service {id} disappeared from persistence"))
        })?;

        if current.state.is_terminal() {
            return Err(ComputationError::Terminated {
                service: id,
                state: current.state,
            });
        }
        self.guard.check(&record, &current)?;

        let deps = self.store.find_direct_dependencies(&current)?;

        let failed: Vec<ServiceId> = deps
            .iter()
            .filter(|d| d.has_completed_unsuccessfully())
            .filter_map(|d| d.id)
            .collect();
        if !failed.is_empty() {
            info!(service = %id, ?failed, "canceling service: dependencies failed");
            self.store.update_state(
                &mut current,
                ServiceState::Canceled,
                Some(ServiceEvent::new(
                    ServiceEventKind::Canceled,
                    format!("canceled because dependencies {failed:?} did not succeed"),
                )),
            )?;
            return Err(ComputationError::DependencyFailed {
                service: id,
                failed,
            });
        }

        if deps.iter().any(ServiceRecord::is_suspended) {
            self.move_to(
                &mut current,
                ServiceState::WaitingForDependencies,
                ServiceEventKind::WaitingForDependencies,
                "waiting for suspended dependencies".to_string(),
            )?;
            return Ok(CondResult::pending(current));
        }

        if deps.iter().all(ServiceRecord::has_completed_successfully) {
            if current.state != ServiceState::Running {
                if current.process_started_at.is_none() {
                    let started = Utc::now();
                    self.store
                        .update(&current, &[FieldUpdate::ProcessStarted(started)])?;
                    current.process_started_at = Some(started);
                }
                self.move_to(
                    &mut current,
                    ServiceState::Running,
                    ServiceEventKind::Running,
                    "all dependencies completed".to_string(),
                )?;
            }
            debug!(service = %id, deps = deps.len(), "dependencies satisfied");
            return Ok(CondResult::satisfied(current));
        }

        if let Some(budget) = current.timeout {
            let elapsed = current.elapsed(Utc::now());
            if budget_exceeded(elapsed, budget) {
                info!(service = %id, ?elapsed, ?budget, "service timed out waiting for dependencies");
                self.store.update_state(
                    &mut current,
                    ServiceState::Timeout,
                    Some(ServiceEvent::new(
                        ServiceEventKind::Timeout,
                        format!("timed out after {}ms waiting for dependencies", elapsed.as_millis()),
                    )),
                )?;
                return Err(ComputationError::Timeout {
                    service: Some(id),
                    elapsed,
                    budget,
                });
            }
        }

        let pending = deps.iter().filter(|d| !d.has_completed()).count();
        self.move_to(
            &mut current,
            ServiceState::WaitingForDependencies,
            ServiceEventKind::WaitingForDependencies,
            format!("waiting for {pending} dependencies"),
        )?;
        Ok(CondResult::pending(current))
    }
}

impl SuspendCondition<ServiceRecord> for WaitForDependencies {
    fn check(&mut self, record: ServiceRecord) -> Result<CondResult<ServiceRecord>, ComputationError> {
        self.evaluate(record)
    }
}
