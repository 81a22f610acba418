// src/exec/throttle.rs

//! Per-job-type limit on concurrently running external jobs.
//!
//! Jobs beyond the limit wait in a FIFO per job type. A sweep promotes
//! waiting jobs as running ones finish; sweeps happen periodically and
//! whenever a running job is first seen done.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::job::{JobHandle, JobInstanceInfo};
use crate::errors::ComputationError;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// `[throttle]` in the config file. A limit of 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleOptions {
    pub sweep_interval: Duration,
    pub default_max_running: usize,
    pub max_running: HashMap<String, usize>,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            default_max_running: 0,
            max_running: HashMap::new(),
        }
    }
}

impl ThrottleOptions {
    pub fn limit_for(&self, job_type: &str) -> usize {
        self.max_running
            .get(job_type)
            .copied()
            .unwrap_or(self.default_max_running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleStatus {
    Waiting,
    Running,
    Done,
    /// Terminated while waiting; never started.
    DoNotRun,
}

type DoneCallback = Box<dyn FnOnce(&ThrottledJob) + Send>;

/// A job admitted through the throttle.
pub struct ThrottledJob {
    id: u64,
    job_type: String,
    handle: Box<dyn JobHandle>,
    throttle: Weak<ThrottleInner>,
    status: Mutex<ThrottleStatus>,
    on_done: Mutex<Option<DoneCallback>>,
}

impl fmt::Debug for ThrottledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledJob")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ThrottledJob {
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn status(&self) -> ThrottleStatus {
        *lock(&self.status)
    }

    /// Register a callback run once when the job is first seen done.
    pub fn on_done<F>(&self, f: F)
    where
        F: FnOnce(&ThrottledJob) + Send + 'static,
    {
        *lock(&self.on_done) = Some(Box::new(f));
    }

    /// Whether the job is over. The first observer of a finished running job
    /// releases its throttle slot and triggers a sweep.
    pub fn is_done(&self) -> bool {
        match self.status() {
            ThrottleStatus::Waiting => false,
            ThrottleStatus::Done | ThrottleStatus::DoNotRun => true,
            ThrottleStatus::Running => {
                if !self.handle.is_done() {
                    return false;
                }
                if let Some(throttle) = self.throttle.upgrade() {
                    throttle.release(self.id, &self.job_type);
                    throttle.sweep();
                }
                self.mark_done();
                true
            }
        }
    }

    pub fn has_failed(&self) -> bool {
        match self.status() {
            ThrottleStatus::DoNotRun => true,
            ThrottleStatus::Waiting => false,
            _ => self.handle.has_failed(),
        }
    }

    pub fn terminate(&self) {
        let was_waiting = {
            let mut status = lock(&self.status);
            match *status {
                ThrottleStatus::Waiting => {
                    *status = ThrottleStatus::DoNotRun;
                    true
                }
                ThrottleStatus::Running => false,
                ThrottleStatus::Done | ThrottleStatus::DoNotRun => return,
            }
        };

        if was_waiting {
            debug!(job = self.id, job_type = %self.job_type, "waiting job will not run");
            if let Some(throttle) = self.throttle.upgrade() {
                throttle.remove_waiting(self.id, &self.job_type);
            }
        } else {
            self.handle.terminate();
        }
    }

    pub fn instance_info(&self) -> JobInstanceInfo {
        self.handle.instance_info()
    }

    /// Returns `true` if this call moved the job to `Done`.
    fn mark_done(&self) -> bool {
        {
            let mut status = lock(&self.status);
            if *status != ThrottleStatus::Running {
                return false;
            }
            *status = ThrottleStatus::Done;
        }
        if let Some(callback) = lock(&self.on_done).take() {
            callback(self);
        }
        true
    }

    /// Start the underlying job. On failure the job is done and failed.
    fn launch(&self) {
        *lock(&self.status) = ThrottleStatus::Running;
        if let Err(e) = self.handle.start() {
            warn!(job = self.id, job_type = %self.job_type, error = %e, "job failed to start");
            self.handle.terminate();
        }
    }
}

#[derive(Default)]
struct ThrottleState {
    waiting: HashMap<String, VecDeque<Arc<ThrottledJob>>>,
    running: HashMap<String, Vec<Arc<ThrottledJob>>>,
}

struct ThrottleInner {
    options: ThrottleOptions,
    state: Mutex<ThrottleState>,
    next_id: AtomicU64,
}

impl ThrottleInner {
    fn release(&self, id: u64, job_type: &str) {
        let mut state = lock(&self.state);
        if let Some(running) = state.running.get_mut(job_type) {
            running.retain(|j| j.id != id);
        }
    }

    fn remove_waiting(&self, id: u64, job_type: &str) {
        let mut state = lock(&self.state);
        if let Some(waiting) = state.waiting.get_mut(job_type) {
            waiting.retain(|j| j.id != id);
        }
    }

    /// Retire finished running jobs and promote waiting ones in FIFO order.
    fn sweep(&self) {
        let mut finished = Vec::new();
        let mut promoted = Vec::new();
        {
            let mut state = lock(&self.state);
            let ThrottleState { waiting, running } = &mut *state;

            for (job_type, jobs) in running.iter_mut() {
                jobs.retain(|j| {
                    if j.handle.is_done() {
                        finished.push(Arc::clone(j));
                        false
                    } else {
                        true
                    }
                });
                debug!(job_type = %job_type, running = jobs.len(), "throttle sweep");
            }

            for (job_type, queue) in waiting.iter_mut() {
                let limit = self.options.limit_for(job_type);
                let running = running.entry(job_type.clone()).or_default();
                while limit == 0 || running.len() < limit {
                    let Some(job) = queue.pop_front() else {
                        break;
                    };
                    if job.status() == ThrottleStatus::DoNotRun {
                        continue;
                    }
                    running.push(Arc::clone(&job));
                    promoted.push(job);
                }
            }
            waiting.retain(|_, q| !q.is_empty());
        }

        // Callbacks and process spawns happen outside the throttle lock.
        for job in finished {
            job.mark_done();
        }
        for job in promoted {
            info!(job = job.id, job_type = %job.job_type, "starting throttled job");
            job.launch();
        }
    }
}

/// Clonable handle to a shared throttle.
#[derive(Clone)]
pub struct JobThrottle {
    inner: Arc<ThrottleInner>,
}

impl fmt::Debug for JobThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobThrottle")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl JobThrottle {
    pub fn new(options: ThrottleOptions) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                options,
                state: Mutex::new(ThrottleState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Admit `handle`. It starts right away when its job type is under the
    /// limit and waits in FIFO order otherwise.
    pub fn submit(
        &self,
        job_type: &str,
        handle: Box<dyn JobHandle>,
    ) -> Result<Arc<ThrottledJob>, ComputationError> {
        let job = Arc::new(ThrottledJob {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            job_type: job_type.to_string(),
            handle,
            throttle: Arc::downgrade(&self.inner),
            status: Mutex::new(ThrottleStatus::Waiting),
            on_done: Mutex::new(None),
        });

        let limit = self.inner.options.limit_for(job_type);
        let start_now = {
            let mut state = lock(&self.inner.state);
            let ThrottleState { waiting, running } = &mut *state;
            let queued_ahead = waiting.get(job_type).is_some_and(|q| !q.is_empty());
            let running = running.entry(job_type.to_string()).or_default();
            if !queued_ahead && (limit == 0 || running.len() < limit) {
                running.push(Arc::clone(&job));
                true
            } else {
                waiting
                    .entry(job_type.to_string())
                    .or_default()
                    .push_back(Arc::clone(&job));
                false
            }
        };

        if start_now {
            job.launch();
        } else {
            debug!(job = job.id, job_type, limit, "job waiting for a throttle slot");
        }
        Ok(job)
    }

    pub fn sweep(&self) {
        self.inner.sweep();
    }

    pub fn running_count(&self, job_type: &str) -> usize {
        lock(&self.inner.state)
            .running
            .get(job_type)
            .map_or(0, Vec::len)
    }

    pub fn waiting_count(&self, job_type: &str) -> usize {
        lock(&self.inner.state)
            .waiting
            .get(job_type)
            .map_or(0, VecDeque::len)
    }

    /// Sweep every `sweep_interval` until the throttle is dropped.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.options.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep();
            }
            debug!("throttle sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::exec::job::JobStatus;
    use crate::types::ProcessingLocation;

    #[derive(Debug, Default)]
    struct ManualJob {
        started: AtomicBool,
        finished: AtomicBool,
    }

    impl JobHandle for Arc<ManualJob> {
        fn start(&self) -> Result<(), ComputationError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn is_done(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }
        fn has_failed(&self) -> bool {
            false
        }
        fn terminate(&self) {
            self.finished.store(true, Ordering::SeqCst);
        }
        fn instance_info(&self) -> JobInstanceInfo {
            JobInstanceInfo {
                job_id: "manual".into(),
                backend: ProcessingLocation::Local,
                pid: None,
                exit_code: None,
                status: JobStatus::Pending,
                stdout: "out".into(),
                stderr: "err".into(),
            }
        }
    }

    fn limited(limit: usize) -> JobThrottle {
        JobThrottle::new(ThrottleOptions {
            default_max_running: limit,
            ..ThrottleOptions::default()
        })
    }

    #[test]
    fn waits_beyond_limit_and_promotes_in_order() {
        let throttle = limited(1);
        let a = Arc::new(ManualJob::default());
        let b = Arc::new(ManualJob::default());
        let c = Arc::new(ManualJob::default());

        let ja = throttle.submit("t", Box::new(a.clone())).unwrap();
        let jb = throttle.submit("t", Box::new(b.clone())).unwrap();
        let _jc = throttle.submit("t", Box::new(c.clone())).unwrap();
        assert!(a.started.load(Ordering::SeqCst));
        assert!(!b.started.load(Ordering::SeqCst));
        assert_eq!(throttle.waiting_count("t"), 2);

        a.finished.store(true, Ordering::SeqCst);
        assert!(ja.is_done());
        assert!(b.started.load(Ordering::SeqCst));
        assert!(!c.started.load(Ordering::SeqCst));
        assert_eq!(jb.status(), ThrottleStatus::Running);
        assert_eq!(throttle.running_count("t"), 1);
    }

    #[test]
    fn terminated_waiting_job_never_runs() {
        let throttle = limited(1);
        let a = Arc::new(ManualJob::default());
        let b = Arc::new(ManualJob::default());
        let _ja = throttle.submit("t", Box::new(a.clone())).unwrap();
        let jb = throttle.submit("t", Box::new(b.clone())).unwrap();

        jb.terminate();
        assert!(jb.is_done());
        assert!(jb.has_failed());

        a.finished.store(true, Ordering::SeqCst);
        throttle.sweep();
        assert!(!b.started.load(Ordering::SeqCst));
        assert_eq!(throttle.waiting_count("t"), 0);
    }

    #[test]
    fn zero_limit_is_unlimited_and_callback_fires_once() {
        let throttle = limited(0);
        let fired = Arc::new(AtomicU64::new(0));
        let mut jobs = Vec::new();
        for _ in 0..5 {
            let handle = Arc::new(ManualJob::default());
            let job = throttle.submit("t", Box::new(handle.clone())).unwrap();
            let counter = Arc::clone(&fired);
            job.on_done(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            jobs.push((handle, job));
        }
        assert_eq!(throttle.running_count("t"), 5);

        for (handle, _) in &jobs {
            handle.finished.store(true, Ordering::SeqCst);
        }
        throttle.sweep();
        for (_, job) in &jobs {
            assert!(job.is_done());
        }
        assert_eq!(fired.load(Ordering::SeqCst), 5);
        assert_eq!(throttle.running_count("t"), 0);
    }
}
