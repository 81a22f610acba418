// src/engine/mod.rs

//! Orchestration engine for svcflow.
//!
//! This module ties together:
//! - the admission queue (bounded, priority-ordered window of ready services)
//! - the service engine (slots, processor registry, submission, admin)
//! - the dispatcher that turns admitted services into computations
//! - the processing lifecycle shared by processors
//! - the runtime loop that reacts to:
//!   - dispatch / refresh timer ticks
//!   - service completion events
//!   - shutdown signals
//!
//! The synchronous pieces live in [`core`], [`queue`] and [`dispatcher`]; the
//! async/IO shell is implemented in [`runtime`].

use std::time::Duration;

use crate::types::{ServiceId, ServiceState};

/// Runtime options for the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub dispatch_interval: Duration,
    pub refresh_interval: Duration,
    /// Exit once every submitted service has reached a terminal state.
    pub exit_when_idle: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(100),
            refresh_interval: Duration::from_secs(1),
            exit_when_idle: true,
        }
    }
}

/// Events flowing into the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// New services were persisted and should be tracked.
    ServicesSubmitted(Vec<ServiceId>),
    /// A dispatched service reached its final state.
    ServiceFinished { id: ServiceId, state: ServiceState },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod core;
pub mod dependency_wait;
pub mod dispatcher;
pub mod lifecycle;
pub mod processor;
pub mod queue;
pub mod runtime;

pub use core::{
    EngineOptions, ServerStats, ServiceEngine, ServiceRegistry, ServiceRequest, ServiceUpdate,
};
pub use dependency_wait::{DispatchGuard, WaitForDependencies};
pub use dispatcher::ServiceDispatcher;
pub use lifecycle::{LifecycleStages, run_lifecycle};
pub use processor::{
    EmptyResult, ErrorChecker, ExecutionContext, NoErrors, ResultHandler, ServiceProcessor,
    ServiceResult,
};
pub use queue::AdmissionQueue;
pub use runtime::{RunSummary, Runtime};
