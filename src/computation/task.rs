// src/computation/task.rs

//! Single-assignment tasks driven by the scheduler.
//!
//! A task owns a body closure that the scheduler calls once per attempt. Each
//! attempt returns a [`Step`]: complete with a result, suspend until the next
//! cycle, or suspend until another task finishes. A suspended task holds no
//! thread; the scheduler simply picks it up again later.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::Notify;
use tracing::trace;

use crate::errors::ComputationError;

/// Result of one attempt of a task body.
pub enum Step<T> {
    /// The task is finished; the result is written once and never replaced.
    Complete(Result<T, ComputationError>),
    /// Not finished; try again on a later cycle.
    Suspend,
    /// Not finished; try again once `task` has completed.
    DependOn(Arc<dyn Schedulable>),
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Complete(res) => write!(f, "Complete(ok={})", res.is_ok()),
            Step::Suspend => f.write_str("Suspend"),
            Step::DependOn(task) => write!(f, "DependOn({})", task.task_id()),
        }
    }
}

/// Type-erased view of a task, as seen by the scheduler and by dependents.
pub trait Schedulable: Send + Sync {
    fn task_id(&self) -> u64;

    fn is_done(&self) -> bool;

    /// Drop finished tasks from the top of the dependency stack and report
    /// whether the stack is empty.
    fn is_ready(&self) -> bool;

    /// Run one attempt. Returns `true` once the task has completed.
    fn run(&self) -> bool;

    /// Complete with [`ComputationError::Canceled`]. Returns `false` when the
    /// task had already completed.
    fn cancel(&self) -> bool;
}

type Body<T> = Box<dyn FnMut() -> Step<T> + Send>;

pub struct ComputationTask<T> {
    id: u64,
    dependencies: Mutex<Vec<Arc<dyn Schedulable>>>,
    body: Mutex<Option<Body<T>>>,
    result: OnceLock<Result<T, ComputationError>>,
    in_flight: AtomicBool,
    completed: Notify,
}

impl<T> fmt::Debug for ComputationTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationTask")
            .field("id", &self.id)
            .field("done", &self.result.get().is_some())
            .finish_non_exhaustive()
    }
}

fn lock<G>(m: &Mutex<G>) -> MutexGuard<'_, G> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> ComputationTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(id: u64, dependencies: Vec<Arc<dyn Schedulable>>, body: F) -> Self
    where
        F: FnMut() -> Step<T> + Send + 'static,
    {
        Self {
            id,
            dependencies: Mutex::new(dependencies),
            body: Mutex::new(Some(Box::new(body))),
            result: OnceLock::new(),
            in_flight: AtomicBool::new(false),
            completed: Notify::new(),
        }
    }

    /// A task that is done from the start.
    pub fn finished(id: u64, result: Result<T, ComputationError>) -> Self {
        let result_slot = OnceLock::new();
        let _ = result_slot.set(result);
        Self {
            id,
            dependencies: Mutex::new(Vec::new()),
            body: Mutex::new(None),
            result: result_slot,
            in_flight: AtomicBool::new(false),
            completed: Notify::new(),
        }
    }

    pub fn push_dependency(&self, task: Arc<dyn Schedulable>) {
        lock(&self.dependencies).push(task);
    }

    /// Write the result. Returns `false` if a result was already present.
    pub fn complete(&self, result: Result<T, ComputationError>) -> bool {
        if self.result.set(result).is_err() {
            return false;
        }
        // Release captured state; the body is never called again. While an
        // attempt holds the body, `run` drops it instead.
        if let Ok(mut body) = self.body.try_lock() {
            body.take();
        }
        self.completed.notify_waiters();
        trace!(task = self.id, "task completed");
        true
    }

    pub fn try_result(&self) -> Option<Result<T, ComputationError>> {
        self.result.get().cloned()
    }

    /// Wait for the result without blocking a thread.
    pub async fn wait(&self) -> Result<T, ComputationError> {
        loop {
            let notified = self.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.result.get() {
                return result.clone();
            }
            notified.await;
        }
    }

    fn attempt(&self) -> Step<T> {
        let mut body = lock(&self.body);
        let Some(f) = body.as_mut() else {
            return Step::Complete(Err(ComputationError::failed(format!(
                "task {} has no body to run",
                self.id
            ))));
        };

        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(step) => step,
            Err(payload) => Step::Complete(Err(ComputationError::failed(format!(
                "stage panicked: {}",
                panic_message(payload.as_ref())
            )))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl<T> Schedulable for ComputationTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn task_id(&self) -> u64 {
        self.id
    }

    fn is_done(&self) -> bool {
        self.result.get().is_some()
    }

    fn is_ready(&self) -> bool {
        if self.is_done() {
            return true;
        }
        let mut deps = lock(&self.dependencies);
        while let Some(top) = deps.last() {
            if !top.is_done() {
                return false;
            }
            deps.pop();
        }
        true
    }

    fn run(&self) -> bool {
        if self.is_done() {
            return true;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }

        let step = self.attempt();
        trace!(task = self.id, ?step, "task attempt finished");
        let done = match step {
            Step::Complete(result) => {
                self.complete(result);
                true
            }
            Step::Suspend => self.is_done(),
            Step::DependOn(task) => {
                self.push_dependency(task);
                self.is_done()
            }
        };

        if done {
            lock(&self.body).take();
        }
        self.in_flight.store(false, Ordering::Release);
        done
    }

    fn cancel(&self) -> bool {
        self.complete(Err(ComputationError::Canceled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_is_written_once() {
        let task = ComputationTask::<u32>::new(1, Vec::new(), || Step::Complete(Ok(7)));
        assert!(task.run());
        assert!(!task.cancel());
        assert!(!task.complete(Ok(9)));
        assert_eq!(task.try_result(), Some(Ok(7)));
    }

    #[test]
    fn dependency_stack_blocks_until_done() {
        let upstream: Arc<ComputationTask<u32>> =
            Arc::new(ComputationTask::new(1, Vec::new(), || Step::Suspend));
        let task = ComputationTask::<u32>::new(
            2,
            vec![upstream.clone() as Arc<dyn Schedulable>],
            || Step::Complete(Ok(1)),
        );

        assert!(!task.is_ready());
        assert!(!upstream.run());
        upstream.complete(Ok(3));
        assert!(task.is_ready());
    }

    #[test]
    fn panics_become_failures() {
        let task = ComputationTask::<u32>::new(1, Vec::new(), || panic!("kaboom"));
        assert!(task.run());
        let err = task.try_result().unwrap().unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn wait_sees_completion_from_another_task() {
        let task = Arc::new(ComputationTask::<u32>::new(1, Vec::new(), || Step::Suspend));
        let waiter = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(task.cancel());
        assert_eq!(waiter.await.unwrap(), Err(ComputationError::Canceled));
    }
}
