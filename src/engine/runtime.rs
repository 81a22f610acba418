// src/engine/runtime.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::dispatcher::ServiceDispatcher;
use super::{RuntimeEvent, RuntimeOptions};
use crate::errors::{ComputationError, Result, SvcflowError};
use crate::model::ServiceRecord;
use crate::types::{ServiceId, ServiceState};

/// Final view of the services a runtime tracked.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub services: Vec<ServiceRecord>,
}

impl RunSummary {
    pub fn all_successful(&self) -> bool {
        self.services
            .iter()
            .all(ServiceRecord::has_completed_successfully)
    }

    pub fn count_in(&self, state: ServiceState) -> usize {
        self.services.iter().filter(|r| r.state == state).count()
    }
}

/// Drives the dispatcher on timers and in response to `RuntimeEvent`s.
///
/// The dispatcher, queue and engine hold the semantics; this struct only
/// decides *when* to call them and when to stop.
pub struct Runtime {
    dispatcher: ServiceDispatcher,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    options: RuntimeOptions,
    tracked: BTreeSet<ServiceId>,
    finished: BTreeMap<ServiceId, ServiceState>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.options)
            .field("tracked", &self.tracked.len())
            .field("finished", &self.finished.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        dispatcher: ServiceDispatcher,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            dispatcher,
            event_rx,
            options,
            tracked: BTreeSet::new(),
            finished: BTreeMap::new(),
        }
    }

    /// Main event loop.
    pub async fn run(mut self) -> Result<RunSummary> {
        info!("svcflow runtime started");

        let mut dispatch = tokio::time::interval(self.options.dispatch_interval);
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.options.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = dispatch.tick() => {
                    self.dispatch()?;
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.dispatcher.engine().queue().refresh() {
                        warn!(error = %e, "admission queue refresh failed");
                    }
                }
                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        info!("runtime event channel closed; exiting");
                        break;
                    };
                    debug!(?event, "runtime received event");
                    if !self.handle_event(event)? {
                        info!("shutdown requested; stopping runtime");
                        break;
                    }
                }
            }

            if self.options.exit_when_idle && self.is_idle()? {
                info!(services = self.tracked.len(), "all tracked services finished");
                break;
            }
        }

        let summary = self.summary()?;
        info!("runtime exiting");
        Ok(summary)
    }

    /// Returns `Ok(false)` when the runtime should stop.
    fn handle_event(&mut self, event: RuntimeEvent) -> Result<bool> {
        match event {
            RuntimeEvent::ServicesSubmitted(ids) => {
                self.tracked.extend(ids);
                self.dispatch()?;
                Ok(true)
            }
            RuntimeEvent::ServiceFinished { id, state } => {
                self.finished.insert(id, state);
                // A slot or queue position may have opened up.
                self.dispatch()?;
                Ok(true)
            }
            RuntimeEvent::ShutdownRequested => Ok(false),
        }
    }

    /// Configuration errors are fatal and stop the runtime; anything else is
    /// logged and retried on the next tick.
    fn dispatch(&self) -> Result<()> {
        match self.dispatcher.dispatch_services() {
            Ok(started) if !started.is_empty() => {
                debug!(count = started.len(), "dispatched services");
            }
            Ok(_) => {}
            Err(e @ SvcflowError::Computation(ComputationError::Configuration(_))) => {
                error!(error = %e, "fatal configuration error; stopping runtime");
                return Err(e);
            }
            Err(e) => error!(error = %e, "dispatch failed"),
        }
        Ok(())
    }

    /// Every tracked service has reached a terminal state.
    fn is_idle(&self) -> Result<bool> {
        if self.tracked.is_empty() {
            return Ok(false);
        }
        let store = self.dispatcher.engine().store();
        for id in &self.tracked {
            if matches!(self.finished.get(id), Some(s) if s.is_terminal()) {
                continue;
            }
            match store.find_by_id(*id)? {
                Some(record) if record.has_completed() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn summary(&self) -> Result<RunSummary> {
        let store = self.dispatcher.engine().store();
        let mut services = Vec::with_capacity(self.tracked.len());
        for id in &self.tracked {
            if let Some(record) = store.find_by_id(*id)? {
                services.push(record);
            }
        }
        Ok(RunSummary { services })
    }
}
