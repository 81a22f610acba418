// src/store/mod.rs

//! Persistence collaborator.
//!
//! The engine never talks to a database directly; everything goes through
//! [`ServicePersistence`]. [`memory::InMemoryServiceStore`] is the
//! implementation used by the binary and the tests.

use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::Result;
use crate::model::{ServiceEvent, ServiceRecord};
use crate::types::{ServiceId, ServiceState};

pub mod memory;

pub use memory::InMemoryServiceStore;

/// Offset/limit window for paged queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matches before the window was applied.
    pub total: usize,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Single-field update applied by [`ServicePersistence::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Priority(i32),
    Timeout(Option<Duration>),
    Workspace(Option<PathBuf>),
    Result(Option<Value>),
    ProcessStarted(DateTime<Utc>),
    Event(ServiceEvent),
}

/// Storage interface for service records.
///
/// Implementations must be safe to share between the dispatcher, the
/// computation workers and the admin surface.
pub trait ServicePersistence: Send + Sync + Debug {
    fn find_by_id(&self, id: ServiceId) -> Result<Option<ServiceRecord>>;

    /// The record with `id` followed by all of its descendants.
    fn find_service_hierarchy(&self, id: ServiceId) -> Result<Vec<ServiceRecord>>;

    /// Declared dependencies of `record` plus its child services.
    fn find_direct_dependencies(&self, record: &ServiceRecord) -> Result<Vec<ServiceRecord>>;

    /// Move `record` to `state`, appending `event` when given.
    ///
    /// Returns `Ok(false)` without writing when the stored state already is
    /// `state` or is terminal. `record` is refreshed from storage either way.
    fn update_state(
        &self,
        record: &mut ServiceRecord,
        state: ServiceState,
        event: Option<ServiceEvent>,
    ) -> Result<bool>;

    /// Move `record` to `state` without consulting the transition table, even
    /// out of a terminal state. Only admin overrides and retries use this.
    ///
    /// Returns `Ok(false)` without writing when the stored state already is
    /// `state`. `record` is refreshed from storage either way.
    fn force_state(
        &self,
        record: &mut ServiceRecord,
        state: ServiceState,
        event: Option<ServiceEvent>,
    ) -> Result<bool>;

    /// Return the stored copy of `record`, saving it first when unknown.
    fn create_if_not_found(&self, record: ServiceRecord) -> Result<ServiceRecord>;

    /// Insert or overwrite `record`, assigning an id when it has none.
    fn save(&self, record: &mut ServiceRecord) -> Result<ServiceId>;

    /// Claim records in one of `states` that are unowned or owned by
    /// `queue_id`, ordered by priority (desc) then creation time (asc).
    fn claim_by_queue_and_state(
        &self,
        queue_id: &str,
        states: &[ServiceState],
        page: PageRequest,
    ) -> Result<Page<ServiceRecord>>;

    /// Apply `updates` to the stored copy of `record`.
    fn update(&self, record: &ServiceRecord, updates: &[FieldUpdate]) -> Result<bool>;
}
