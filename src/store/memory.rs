// src/store/memory.rs

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, trace};

use super::{FieldUpdate, Page, PageRequest, ServicePersistence};
use crate::errors::{Result, SvcflowError};
use crate::model::{ServiceEvent, ServiceRecord};
use crate::types::{ServiceId, ServiceState};

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    records: BTreeMap<ServiceId, ServiceRecord>,
}

/// Shared, clonable in-memory store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServiceStore {
    inner: Arc<Mutex<StoreState>>,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A panicking writer cannot leave a record half-updated: every write
        // replaces whole fields, so the data is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of every stored record, in id order.
    pub fn all(&self) -> Vec<ServiceRecord> {
        self.lock().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn require_id(record: &ServiceRecord) -> Result<ServiceId> {
    record.id.ok_or_else(|| {
        SvcflowError::Persistence(format!("service '{}' has not been saved", record.name))
    })
}

impl ServicePersistence for InMemoryServiceStore {
    fn find_by_id(&self, id: ServiceId) -> Result<Option<ServiceRecord>> {
        Ok(self.lock().records.get(&id).cloned())
    }

    fn find_service_hierarchy(&self, id: ServiceId) -> Result<Vec<ServiceRecord>> {
        let state = self.lock();
        let Some(root) = state.records.get(&id) else {
            return Ok(Vec::new());
        };

        let mut hierarchy = vec![root.clone()];
        let mut pending = VecDeque::from([id]);
        while let Some(parent) = pending.pop_front() {
            for child in state
                .records
                .values()
                .filter(|r| r.parent_id == Some(parent))
            {
                if let Some(child_id) = child.id {
                    pending.push_back(child_id);
                }
                hierarchy.push(child.clone());
            }
        }
        Ok(hierarchy)
    }

    fn find_direct_dependencies(&self, record: &ServiceRecord) -> Result<Vec<ServiceRecord>> {
        let state = self.lock();
        let mut deps: Vec<ServiceRecord> = Vec::new();

        for dep_id in &record.dependencies {
            match state.records.get(dep_id) {
                Some(dep) => deps.push(dep.clone()),
                None => {
                    return Err(SvcflowError::Persistence(format!(
                        "service {} depends on unknown service {}",
                        record.label(),
                        dep_id
                    )));
                }
            }
        }

        if let Some(id) = record.id {
            for child in state.records.values().filter(|r| r.parent_id == Some(id)) {
                if !deps.iter().any(|d| d.id == child.id) {
                    deps.push(child.clone());
                }
            }
        }
        Ok(deps)
    }

    fn update_state(
        &self,
        record: &mut ServiceRecord,
        to: ServiceState,
        event: Option<ServiceEvent>,
    ) -> Result<bool> {
        let id = require_id(record)?;
        let mut state = self.lock();
        let stored = state
            .records
            .get_mut(&id)
            .ok_or_else(|| SvcflowError::Persistence(format!("service {id} not found")))?;

        let from = stored.state;
        if from == to || from.is_terminal() {
            trace!(service = %id, ?from, ?to, "state update skipped");
            *record = stored.clone();
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            *record = stored.clone();
            return Err(SvcflowError::InvalidTransition {
                service: id,
                from,
                to,
            });
        }

        stored.state = to;
        stored.modified_at = Utc::now();
        if let Some(event) = event {
            stored.push_event(event);
        }
        debug!(service = %id, ?from, ?to, "service state updated");
        *record = stored.clone();
        Ok(true)
    }

    fn force_state(
        &self,
        record: &mut ServiceRecord,
        to: ServiceState,
        event: Option<ServiceEvent>,
    ) -> Result<bool> {
        let id = require_id(record)?;
        let mut state = self.lock();
        let stored = state
            .records
            .get_mut(&id)
            .ok_or_else(|| SvcflowError::Persistence(format!("service {id} not found")))?;

        let from = stored.state;
        if from != to {
            stored.state = to;
            stored.modified_at = Utc::now();
            if let Some(event) = event {
                stored.push_event(event);
            }
            debug!(service = %id, ?from, ?to, "service state forced");
        }
        *record = stored.clone();
        Ok(from != to)
    }

    fn create_if_not_found(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        if let Some(id) = record.id
            && let Some(existing) = self.lock().records.get(&id)
        {
            return Ok(existing.clone());
        }
        self.save(&mut record)?;
        Ok(record)
    }

    fn save(&self, record: &mut ServiceRecord) -> Result<ServiceId> {
        let mut state = self.lock();
        let id = match record.id {
            Some(id) => {
                state.next_id = state.next_id.max(id.0);
                id
            }
            None => {
                state.next_id += 1;
                ServiceId(state.next_id)
            }
        };
        record.id = Some(id);
        record.modified_at = Utc::now();
        state.records.insert(id, record.clone());
        Ok(id)
    }

    fn claim_by_queue_and_state(
        &self,
        queue_id: &str,
        states: &[ServiceState],
        page: PageRequest,
    ) -> Result<Page<ServiceRecord>> {
        let mut state = self.lock();

        let mut matches: Vec<&ServiceRecord> = state
            .records
            .values()
            .filter(|r| states.contains(&r.state))
            .filter(|r| r.queue_id.as_deref().is_none_or(|q| q == queue_id))
            .collect();
        matches.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let total = matches.len();
        let claimed: Vec<ServiceId> = matches
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .filter_map(|r| r.id)
            .collect();

        let mut items = Vec::with_capacity(claimed.len());
        for id in claimed {
            if let Some(record) = state.records.get_mut(&id) {
                if record.queue_id.is_none() {
                    record.queue_id = Some(queue_id.to_string());
                }
                items.push(record.clone());
            }
        }
        Ok(Page { items, total })
    }

    fn update(&self, record: &ServiceRecord, updates: &[FieldUpdate]) -> Result<bool> {
        let id = require_id(record)?;
        let mut state = self.lock();
        let stored = state
            .records
            .get_mut(&id)
            .ok_or_else(|| SvcflowError::Persistence(format!("service {id} not found")))?;

        let mut changed = false;
        for update in updates {
            changed |= match update {
                FieldUpdate::Priority(p) => replace(&mut stored.priority, *p),
                FieldUpdate::Timeout(t) => replace(&mut stored.timeout, *t),
                FieldUpdate::Workspace(w) => replace(&mut stored.workspace, w.clone()),
                FieldUpdate::Result(v) => replace(&mut stored.result, v.clone()),
                FieldUpdate::ProcessStarted(at) => {
                    replace(&mut stored.process_started_at, Some(*at))
                }
                FieldUpdate::Event(event) => {
                    stored.events.push(event.clone());
                    true
                }
            };
        }
        if changed {
            stored.modified_at = Utc::now();
        }
        Ok(changed)
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceEventKind;

    fn saved(store: &InMemoryServiceStore, name: &str, priority: i32) -> ServiceRecord {
        let mut record = ServiceRecord::new(name);
        record.priority = priority;
        store.save(&mut record).unwrap();
        record
    }

    #[test]
    fn terminal_records_are_never_rewritten() {
        let store = InMemoryServiceStore::new();
        let mut record = saved(&store, "a", 0);

        assert!(store
            .update_state(&mut record, ServiceState::Submitted, None)
            .unwrap());
        assert!(store
            .update_state(&mut record, ServiceState::Error, None)
            .unwrap());
        assert!(!store
            .update_state(
                &mut record,
                ServiceState::Successful,
                Some(ServiceEvent::new(ServiceEventKind::Completed, "late"))
            )
            .unwrap());

        let stored = store.find_by_id(record.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.state, ServiceState::Error);
        assert!(!stored.has_event(ServiceEventKind::Completed));
    }

    #[test]
    fn forced_state_leaves_a_terminal_state() {
        let store = InMemoryServiceStore::new();
        let mut record = saved(&store, "a", 0);
        store
            .update_state(&mut record, ServiceState::Canceled, None)
            .unwrap();

        assert!(store
            .force_state(
                &mut record,
                ServiceState::Retry,
                Some(ServiceEvent::new(ServiceEventKind::Resumed, "retry"))
            )
            .unwrap());
        assert_eq!(record.state, ServiceState::Retry);
        assert!(record.has_event(ServiceEventKind::Resumed));
        assert!(!store
            .force_state(&mut record, ServiceState::Retry, None)
            .unwrap());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let store = InMemoryServiceStore::new();
        let mut record = saved(&store, "a", 0);
        let err = store
            .update_state(&mut record, ServiceState::Resumed, None)
            .unwrap_err();
        assert!(matches!(err, SvcflowError::InvalidTransition { .. }));
    }

    #[test]
    fn claim_orders_by_priority_then_age_and_sets_owner() {
        let store = InMemoryServiceStore::new();
        let low = saved(&store, "low", 1);
        let high = saved(&store, "high", 5);
        let mut other = ServiceRecord::new("other");
        other.queue_id = Some("elsewhere".into());
        store.save(&mut other).unwrap();

        let page = store
            .claim_by_queue_and_state("q1", &ServiceState::ADMISSIBLE, PageRequest::first(10))
            .unwrap();
        let ids: Vec<_> = page.items.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
        assert!(page.items.iter().all(|r| r.queue_id.as_deref() == Some("q1")));
    }

    #[test]
    fn direct_dependencies_include_children() {
        let store = InMemoryServiceStore::new();
        let dep = saved(&store, "dep", 0);
        let mut parent = ServiceRecord::new("parent");
        parent.dependencies = vec![dep.id.unwrap()];
        store.save(&mut parent).unwrap();
        let mut child = ServiceRecord::new("child");
        child.parent_id = parent.id;
        store.save(&mut child).unwrap();

        let deps = store.find_direct_dependencies(&parent).unwrap();
        let names: Vec<_> = deps.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["dep", "child"]);

        let hierarchy = store.find_service_hierarchy(parent.id.unwrap()).unwrap();
        assert_eq!(hierarchy.len(), 2);
    }
}
