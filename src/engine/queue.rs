// src/engine/queue.rs

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::errors::{Result, SvcflowError};
use crate::model::{ServiceEvent, ServiceEventKind, ServiceRecord};
use crate::store::{PageRequest, ServicePersistence};
use crate::types::{ServiceId, ServiceState};

pub const DEFAULT_MAX_READY_CAPACITY: usize = 20;
pub const DEFAULT_STALE_SUBMISSION: Duration = Duration::from_secs(5 * 60);

/// Heap entry; the greatest entry is dequeued first.
#[derive(Debug)]
struct Entry {
    priority: i32,
    created_at: DateTime<Utc>,
    id: ServiceId,
    record: ServiceRecord,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then older, then lower id.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    waiting: HashSet<ServiceId>,
    /// Dequeued but not yet completed or aborted.
    submitted: HashMap<ServiceId, DateTime<Utc>>,
    /// Never admitted again, e.g. no processor is registered for them.
    rejected: HashSet<ServiceId>,
    max_ready_capacity: usize,
}

impl QueueState {
    fn is_tracked(&self, id: ServiceId) -> bool {
        self.waiting.contains(&id) || self.submitted.contains_key(&id)
    }

    fn forget(&mut self, id: ServiceId) {
        if self.waiting.remove(&id) {
            self.heap.retain(|e| e.id != id);
        }
        self.submitted.remove(&id);
    }
}

/// Bounded, priority-ordered window of services ready for dispatch.
///
/// Semantics:
/// - At most `max_ready_capacity` records wait at any time; the rest stay in
///   persistence and are pulled in by backfill as room frees up.
/// - Every tracked id is either "waiting" (in the heap) or "submitted"
///   (handed to the dispatcher), never both.
/// - `complete` and `abort` release a submitted id.
/// - A `reject`ed id is dropped and never admitted again, neither by
///   `enqueue` nor by backfill.
/// - A submitted record whose persisted state still says it was never
///   picked up, and that has not been touched for `stale_submission`, is
///   assumed lost and re-admitted by `refresh`.
pub struct AdmissionQueue {
    store: Arc<dyn ServicePersistence>,
    queue_id: String,
    stale_submission: Duration,
    state: Mutex<QueueState>,
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("AdmissionQueue")
            .field("queue_id", &self.queue_id)
            .field("waiting", &state.waiting.len())
            .field("submitted", &state.submitted.len())
            .field("max_ready_capacity", &state.max_ready_capacity)
            .finish()
    }
}

impl AdmissionQueue {
    /// `max_ready_capacity` is clamped to at least 1.
    pub fn new(
        store: Arc<dyn ServicePersistence>,
        queue_id: impl Into<String>,
        max_ready_capacity: usize,
        stale_submission: Duration,
    ) -> Self {
        Self {
            store,
            queue_id: queue_id.into(),
            stale_submission,
            state: Mutex::new(QueueState {
                max_ready_capacity: max_ready_capacity.max(1),
                ..QueueState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Offer a record to the waiting window.
    ///
    /// Returns `Ok(true)` when the record is (or already was) tracked and
    /// `Ok(false)` when the window is full. A rejected root service is
    /// aborted; it stays persisted and backfill picks it up later.
    pub fn enqueue(&self, mut record: ServiceRecord) -> Result<bool> {
        let id = record.id.ok_or_else(|| {
            SvcflowError::Persistence(format!(
                "cannot enqueue unsaved service '{}'",
                record.name
            ))
        })?;

        let mut state = self.lock();
        if state.rejected.contains(&id) {
            debug!(service = %id, "service was rejected; not admitting it");
            return Ok(false);
        }
        if state.is_tracked(id) {
            debug!(service = %id, "service already tracked by the admission queue");
            return Ok(true);
        }

        if state.waiting.len() >= state.max_ready_capacity {
            let capacity = state.max_ready_capacity;
            drop(state);
            warn!(service = %id, capacity, "admission queue full; rejecting service");
            if !record.has_parent() {
                self.abort(&record);
            }
            return Ok(false);
        }

        if record.state == ServiceState::Created {
            self.store.update_state(
                &mut record,
                ServiceState::Queued,
                Some(ServiceEvent::new(
                    ServiceEventKind::Queued,
                    format!("queued on {}", self.queue_id),
                )),
            )?;
        }

        state.waiting.insert(id);
        state.heap.push(Entry {
            priority: record.priority,
            created_at: record.created_at,
            id,
            record,
        });
        debug!(service = %id, waiting = state.waiting.len(), "service admitted");
        Ok(true)
    }

    /// Take the next record to dispatch.
    ///
    /// Backfills from persistence when the window is empty. Records that were
    /// finished elsewhere while waiting are dropped on the way.
    pub fn dequeue(&self) -> Result<Option<ServiceRecord>> {
        if self.lock().heap.is_empty() {
            self.refresh()?;
        }

        loop {
            let entry = {
                let mut state = self.lock();
                let Some(entry) = state.heap.pop() else {
                    return Ok(None);
                };
                state.waiting.remove(&entry.id);
                state.submitted.insert(entry.id, Utc::now());
                entry
            };

            match self.store.find_by_id(entry.id)? {
                Some(current) if !current.has_completed() => return Ok(Some(current)),
                _ => {
                    debug!(service = %entry.id, "skipping finished or missing service");
                    self.lock().submitted.remove(&entry.id);
                }
            }
        }
    }

    /// Re-admit stale submissions and backfill the window from persistence.
    pub fn refresh(&self) -> Result<()> {
        self.readmit_stale()?;

        let (remaining, tracked) = {
            let state = self.lock();
            (
                state.max_ready_capacity.saturating_sub(state.waiting.len()),
                state.waiting.len() + state.submitted.len() + state.rejected.len(),
            )
        };
        if remaining == 0 {
            return Ok(());
        }

        // Tracked and rejected records may match the claim too; ask for
        // enough to skip them.
        let page = self.store.claim_by_queue_and_state(
            &self.queue_id,
            &ServiceState::ADMISSIBLE,
            PageRequest::first(remaining + tracked),
        )?;

        let mut admitted = 0usize;
        for record in page.items {
            if admitted >= remaining {
                break;
            }
            let id = record.id;
            let skip = id.is_some_and(|id| {
                let state = self.lock();
                state.is_tracked(id) || state.rejected.contains(&id)
            });
            if !skip && self.enqueue(record)? {
                admitted += 1;
            }
        }

        if admitted > 0 {
            debug!(admitted, backlog = page.total, "backfilled admission queue");
        }
        Ok(())
    }

    fn readmit_stale(&self) -> Result<()> {
        let submitted: Vec<ServiceId> = self.lock().submitted.keys().copied().collect();
        let now = Utc::now();

        for id in submitted {
            let Some(record) = self.store.find_by_id(id)? else {
                self.lock().submitted.remove(&id);
                continue;
            };
            let idle = (now - record.modified_at).to_std().unwrap_or(Duration::ZERO);
            if record.state.is_admissible() && idle > self.stale_submission {
                info!(service = %id, ?idle, "re-admitting stale submission");
                self.abort(&record);
                self.enqueue(record)?;
            }
        }
        Ok(())
    }

    /// Stop tracking `record`.
    pub fn abort(&self, record: &ServiceRecord) {
        if let Some(id) = record.id {
            self.lock().forget(id);
            debug!(service = %id, "service aborted in admission queue");
        }
    }

    /// Stop tracking `record` and refuse to admit it again.
    pub fn reject(&self, record: &ServiceRecord) {
        if let Some(id) = record.id {
            let mut state = self.lock();
            state.forget(id);
            state.rejected.insert(id);
            warn!(service = %id, "service rejected by the admission queue");
        }
    }

    pub fn is_rejected(&self, id: ServiceId) -> bool {
        self.lock().rejected.contains(&id)
    }

    /// Release a dispatched record.
    pub fn complete(&self, record: &ServiceRecord) {
        if let Some(id) = record.id {
            self.lock().submitted.remove(&id);
        }
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn submitted_len(&self) -> usize {
        self.lock().submitted.len()
    }

    pub fn submitted_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.lock().submitted.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn max_ready_capacity(&self) -> usize {
        self.lock().max_ready_capacity
    }

    pub fn set_max_ready_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        self.lock().max_ready_capacity = capacity;
        info!(capacity, "admission queue capacity updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryServiceStore;

    fn queue(capacity: usize) -> (Arc<InMemoryServiceStore>, AdmissionQueue) {
        let store = Arc::new(InMemoryServiceStore::new());
        let queue = AdmissionQueue::new(store.clone(), "q", capacity, DEFAULT_STALE_SUBMISSION);
        (store, queue)
    }

    fn saved(store: &InMemoryServiceStore, priority: i32) -> ServiceRecord {
        let mut record = ServiceRecord::new("svc");
        record.priority = priority;
        store.save(&mut record).unwrap();
        record
    }

    #[test]
    fn admitting_created_record_persists_queued() {
        let (store, queue) = queue(2);
        let record = saved(&store, 0);
        assert!(queue.enqueue(record.clone()).unwrap());
        // Second offer is accepted without re-admission.
        assert!(queue.enqueue(record.clone()).unwrap());
        assert_eq!(queue.waiting_len(), 1);

        let stored = store.find_by_id(record.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.state, ServiceState::Queued);
        assert!(stored.has_event(ServiceEventKind::Queued));
    }

    #[test]
    fn full_window_rejects() {
        let (store, queue) = queue(1);
        assert!(queue.enqueue(saved(&store, 0)).unwrap());
        let second = saved(&store, 0);
        assert!(!queue.enqueue(second.clone()).unwrap());
        assert_eq!(queue.waiting_len(), 1);

        let stored = store.find_by_id(second.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.state, ServiceState::Created);
    }

    #[test]
    fn dequeue_moves_to_submitted_until_complete() {
        let (store, queue) = queue(5);
        let low = saved(&store, 1);
        let high = saved(&store, 9);
        queue.enqueue(low.clone()).unwrap();
        queue.enqueue(high.clone()).unwrap();

        let first = queue.dequeue().unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(queue.submitted_ids(), vec![high.id.unwrap()]);
        assert_eq!(queue.waiting_len(), 1);

        queue.complete(&first);
        assert_eq!(queue.submitted_len(), 0);
    }

    #[test]
    fn empty_dequeue_backfills_from_persistence() {
        let (store, queue) = queue(2);
        for p in 0..3 {
            saved(&store, p);
        }

        let first = queue.dequeue().unwrap().unwrap();
        assert_eq!(first.priority, 2);
        assert_eq!(queue.waiting_len(), 1);
        assert_eq!(queue.submitted_len(), 1);
    }

    #[test]
    fn rejected_record_is_never_backfilled() {
        let (store, queue) = queue(2);
        let rejected = saved(&store, 9);
        let other = saved(&store, 1);

        let taken = queue.dequeue().unwrap().unwrap();
        assert_eq!(taken.id, rejected.id);
        queue.reject(&taken);
        assert!(queue.is_rejected(rejected.id.unwrap()));
        assert_eq!(queue.submitted_len(), 0);

        queue.refresh().unwrap();
        assert!(!queue.enqueue(rejected.clone()).unwrap());
        assert_eq!(queue.dequeue().unwrap().unwrap().id, other.id);
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn stale_submission_is_readmitted() {
        let store = Arc::new(InMemoryServiceStore::new());
        let queue = AdmissionQueue::new(store.clone(), "q", 5, Duration::ZERO);
        let record = saved(&store, 0);
        queue.enqueue(record).unwrap();
        let taken = queue.dequeue().unwrap().unwrap();
        assert_eq!(queue.submitted_len(), 1);

        // Still QUEUED in persistence, never marked SUBMITTED.
        std::thread::sleep(Duration::from_millis(2));
        queue.refresh().unwrap();
        assert_eq!(queue.submitted_len(), 0);
        assert_eq!(queue.waiting_len(), 1);
        assert_eq!(queue.dequeue().unwrap().unwrap().id, taken.id);
    }
}
