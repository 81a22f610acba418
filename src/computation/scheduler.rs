// src/computation/scheduler.rs

//! Inspector loop that drives computation tasks.
//!
//! Pending tasks sit in a FIFO. Each cycle visits the tasks that were queued
//! when the cycle began, exactly once:
//! - done tasks are dropped,
//! - ready tasks run one attempt on the blocking pool (bounded by the worker
//!   semaphore) and are re-queued if they suspended,
//! - everything else goes to the back of the queue.
//!
//! Only one inspector exists per scheduler, so cycles never overlap. A task is
//! out of the queue while its attempt runs, so no two workers share a task.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::computation::Computation;
use super::task::{ComputationTask, Schedulable, Step};
use crate::errors::ComputationError;

/// Scheduler tuning knobs (`[scheduler]` in the config file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub inspector_interval: Duration,
    pub worker_pool_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            inspector_interval: Duration::from_millis(100),
            worker_pool_size: 8,
        }
    }
}

struct SchedulerInner {
    queue: Mutex<VecDeque<Arc<dyn Schedulable>>>,
    workers: Arc<Semaphore>,
    options: SchedulerOptions,
    next_id: AtomicU64,
    /// Woken when a task completes so dependents do not wait a full interval.
    wake: Notify,
    stopped: AtomicBool,
    stop: Notify,
}

/// Cheaply clonable handle to a shared scheduler.
#[derive(Clone)]
pub struct ComputationScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for ComputationScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationScheduler")
            .field("options", &self.inner.options)
            .field("pending", &self.pending_tasks())
            .finish_non_exhaustive()
    }
}

impl ComputationScheduler {
    /// Create a scheduler without starting the inspector.
    ///
    /// Call [`Self::start`] for the background loop, or drive it by hand with
    /// [`Self::run_cycle`].
    pub fn new(options: SchedulerOptions) -> Self {
        let workers = options.worker_pool_size.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(VecDeque::new()),
                workers: Arc::new(Semaphore::new(workers)),
                options,
                next_id: AtomicU64::new(1),
                wake: Notify::new(),
                stopped: AtomicBool::new(false),
                stop: Notify::new(),
            }),
        }
    }

    pub fn options(&self) -> SchedulerOptions {
        self.inner.options
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Arc<dyn Schedulable>>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn submit(&self, task: Arc<dyn Schedulable>) {
        trace!(task = task.task_id(), "task queued");
        self.queue().push_back(task);
        self.inner.wake.notify_one();
    }

    /// Number of tasks waiting in the queue (in-flight attempts excluded).
    pub fn pending_tasks(&self) -> usize {
        self.queue().len()
    }

    /// A computation that is already complete with `value`.
    pub fn completed<T>(&self, value: T) -> Computation<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let task = ComputationTask::finished(self.next_task_id(), Ok(value));
        Computation::from_task(self.clone(), Arc::new(task))
    }

    /// A computation that has already failed with `error`.
    pub fn failed<T>(&self, error: ComputationError) -> Computation<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let task = ComputationTask::finished(self.next_task_id(), Err(error));
        Computation::from_task(self.clone(), Arc::new(task))
    }

    /// A computation whose value is produced by `f` on a worker.
    pub fn supply<T, F>(&self, f: F) -> Computation<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, ComputationError> + Send + 'static,
    {
        let mut f = Some(f);
        self.stage(Vec::new(), move || match f.take() {
            Some(f) => Step::Complete(f()),
            None => Step::Complete(Err(ComputationError::failed("supplier already consumed"))),
        })
    }

    /// Build and queue a stage depending on `dependencies`.
    pub(crate) fn stage<T, F>(&self, dependencies: Vec<Arc<dyn Schedulable>>, body: F) -> Computation<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Step<T> + Send + 'static,
    {
        let task = Arc::new(ComputationTask::new(self.next_task_id(), dependencies, body));
        self.submit(task.clone());
        Computation::from_task(self.clone(), task)
    }

    /// Start the inspector loop on the current tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.inspect().await })
    }

    async fn inspect(self) {
        let mut interval = tokio::time::interval(self.inner.options.inspector_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.inner.options.inspector_interval.as_millis() as u64,
            workers = self.inner.options.worker_pool_size,
            "computation scheduler started"
        );

        loop {
            if self.inner.stopped.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.inner.wake.notified() => {}
                _ = self.inner.stop.notified() => break,
            }
            self.run_cycle();
        }

        info!("computation scheduler stopped");
    }

    /// Run one inspection cycle and return the attempts it started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_cycle(&self) -> Vec<JoinHandle<()>> {
        let count = self.pending_tasks();
        let mut started = Vec::new();

        for _ in 0..count {
            let Some(task) = self.queue().pop_front() else {
                break;
            };

            if task.is_done() {
                continue;
            }
            if !task.is_ready() {
                self.queue().push_back(task);
                continue;
            }

            let permit = match Arc::clone(&self.inner.workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.queue().push_back(task);
                    continue;
                }
            };

            let scheduler = self.clone();
            started.push(tokio::task::spawn_blocking(move || {
                let done = task.run();
                drop(permit);
                if done {
                    scheduler.inner.wake.notify_one();
                } else {
                    scheduler.queue().push_back(task);
                }
            }));
        }

        if !started.is_empty() {
            trace!(started = started.len(), "inspection cycle dispatched attempts");
        }
        started
    }

    /// Run a cycle and wait for the attempts it started.
    pub async fn step(&self) {
        for handle in self.run_cycle() {
            let _ = handle.await;
        }
    }

    /// Stop the inspector loop. Queued tasks stay queued.
    pub fn shutdown(&self) {
        debug!("computation scheduler shutdown requested");
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.stop.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}
