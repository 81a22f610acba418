// src/computation/computation.rs

//! Composable staged computations.
//!
//! Every combinator builds a new task that depends on its source task(s) and
//! queues it on the same scheduler. Upstream failures flow through the chain
//! untouched; no stage ever re-runs its upstream.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cond::{CondResult, SuspendCondition};
use super::scheduler::ComputationScheduler;
use super::task::{ComputationTask, Schedulable, Step};
use crate::errors::ComputationError;

/// How a suspended stage re-checks its condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendOptions {
    /// Minimum time between two condition evaluations.
    pub poll_interval: Duration,
    /// Total budget measured from the stage's first attempt.
    pub timeout: Option<Duration>,
}

impl Default for SuspendOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            timeout: None,
        }
    }
}

impl SuspendOptions {
    pub fn polling(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A budget is used up once `elapsed` is strictly past it; reaching it
/// exactly is still in time.
pub fn budget_exceeded(elapsed: Duration, budget: Duration) -> bool {
    elapsed > budget
}

pub struct Computation<T> {
    scheduler: ComputationScheduler,
    task: Arc<ComputationTask<T>>,
}

impl<T> Clone for Computation<T> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            task: Arc::clone(&self.task),
        }
    }
}

impl<T> fmt::Debug for Computation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computation")
            .field("task", &self.task)
            .finish()
    }
}

/// Result of a finished upstream task, or `None` if it is somehow still open.
fn upstream<T>(task: &ComputationTask<T>) -> Option<Result<T, ComputationError>>
where
    T: Clone + Send + Sync + 'static,
{
    task.try_result()
}

fn consumed<T>() -> Step<T> {
    Step::Complete(Err(ComputationError::failed("stage closure already consumed")))
}

impl<T> Computation<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_task(scheduler: ComputationScheduler, task: Arc<ComputationTask<T>>) -> Self {
        Self { scheduler, task }
    }

    pub fn task_id(&self) -> u64 {
        self.task.task_id()
    }

    pub fn scheduler(&self) -> &ComputationScheduler {
        &self.scheduler
    }

    fn source(&self) -> Vec<Arc<dyn Schedulable>> {
        vec![self.task.clone() as Arc<dyn Schedulable>]
    }

    pub fn map<U, F>(&self, f: F) -> Computation<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, ComputationError> + Send + 'static,
    {
        let source = Arc::clone(&self.task);
        let mut f = Some(f);
        self.scheduler.stage(self.source(), move || match upstream(&source) {
            None => Step::Suspend,
            Some(Err(e)) => Step::Complete(Err(e)),
            Some(Ok(value)) => match f.take() {
                Some(f) => Step::Complete(f(value)),
                None => consumed(),
            },
        })
    }

    /// Chain a computation produced from this one's value.
    ///
    /// The inner computation is pushed onto the stage's dependency stack, so
    /// the stage only runs again once the inner result exists.
    pub fn flat_map<U, F>(&self, f: F) -> Computation<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<Computation<U>, ComputationError> + Send + 'static,
    {
        let source = Arc::clone(&self.task);
        let mut f = Some(f);
        let mut inner: Option<Arc<ComputationTask<U>>> = None;

        self.scheduler.stage(self.source(), move || {
            if let Some(inner) = &inner {
                return match inner.try_result() {
                    Some(result) => Step::Complete(result),
                    None => Step::DependOn(inner.clone()),
                };
            }

            match upstream(&source) {
                None => Step::Suspend,
                Some(Err(e)) => Step::Complete(Err(e)),
                Some(Ok(value)) => match f.take() {
                    None => consumed(),
                    Some(f) => match f(value) {
                        Err(e) => Step::Complete(Err(e)),
                        Ok(next) => match next.task.try_result() {
                            Some(result) => Step::Complete(result),
                            None => {
                                let task = Arc::clone(&next.task);
                                inner = Some(next.task);
                                Step::DependOn(task)
                            }
                        },
                    },
                },
            }
        })
    }

    pub fn combine<U, V, F>(&self, other: &Computation<U>, f: F) -> Computation<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> Result<V, ComputationError> + Send + 'static,
    {
        let left = Arc::clone(&self.task);
        let right = Arc::clone(&other.task);
        let deps = vec![
            left.clone() as Arc<dyn Schedulable>,
            right.clone() as Arc<dyn Schedulable>,
        ];
        let mut f = Some(f);

        self.scheduler
            .stage(deps, move || match (upstream(&left), upstream(&right)) {
                (Some(Err(e)), _) | (_, Some(Err(e))) => Step::Complete(Err(e)),
                (Some(Ok(a)), Some(Ok(b))) => match f.take() {
                    Some(f) => Step::Complete(f(a, b)),
                    None => consumed(),
                },
                _ => Step::Suspend,
            })
    }

    /// Run `f` on the final result; the result passes through unchanged.
    pub fn on_complete<F>(&self, f: F) -> Computation<T>
    where
        F: FnOnce(&Result<T, ComputationError>) + Send + 'static,
    {
        let source = Arc::clone(&self.task);
        let mut f = Some(f);
        self.scheduler.stage(self.source(), move || match upstream(&source) {
            None => Step::Suspend,
            Some(result) => {
                if let Some(f) = f.take() {
                    f(&result);
                }
                Step::Complete(result)
            }
        })
    }

    /// Turn a failure back into a value (or a different failure).
    pub fn recover<F>(&self, f: F) -> Computation<T>
    where
        F: FnOnce(ComputationError) -> Result<T, ComputationError> + Send + 'static,
    {
        let source = Arc::clone(&self.task);
        let mut f = Some(f);
        self.scheduler.stage(self.source(), move || match upstream(&source) {
            None => Step::Suspend,
            Some(Ok(value)) => Step::Complete(Ok(value)),
            Some(Err(e)) => match f.take() {
                Some(f) => Step::Complete(f(e)),
                None => consumed(),
            },
        })
    }

    /// Suspend until `cond` is satisfied, then complete with its carried state.
    ///
    /// Each attempt, in order: upstream failure propagates; an exhausted
    /// timeout fails with [`ComputationError::Timeout`]; an attempt inside the
    /// poll interval suspends without evaluating; otherwise the condition is
    /// evaluated. The first attempt always evaluates.
    pub fn suspend_until<C>(&self, mut cond: C, options: SuspendOptions) -> Computation<T>
    where
        C: SuspendCondition<T> + 'static,
    {
        let source = Arc::clone(&self.task);
        let mut carried: Option<T> = None;
        let mut started: Option<Instant> = None;
        let mut last_check: Option<Instant> = None;

        self.scheduler.stage(self.source(), move || {
            let state = match carried.take() {
                Some(state) => state,
                None => match upstream(&source) {
                    None => return Step::Suspend,
                    Some(Err(e)) => return Step::Complete(Err(e)),
                    Some(Ok(value)) => value,
                },
            };

            let now = Instant::now();
            let started_at = *started.get_or_insert(now);
            if let Some(budget) = options.timeout {
                let elapsed = now.duration_since(started_at);
                if budget_exceeded(elapsed, budget) {
                    return Step::Complete(Err(ComputationError::Timeout {
                        service: None,
                        elapsed,
                        budget,
                    }));
                }
            }

            if let Some(last) = last_check
                && now.duration_since(last) < options.poll_interval
            {
                carried = Some(state);
                return Step::Suspend;
            }
            last_check = Some(now);

            match cond.check(state) {
                Err(e) => Step::Complete(Err(e)),
                Ok(CondResult {
                    state,
                    satisfied: true,
                }) => Step::Complete(Ok(state)),
                Ok(CondResult { state, .. }) => {
                    carried = Some(state);
                    Step::Suspend
                }
            }
        })
    }

    /// Cancel this stage. Returns `false` if it had already completed.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    pub fn try_result(&self) -> Option<Result<T, ComputationError>> {
        self.task.try_result()
    }

    pub async fn join(&self) -> Result<T, ComputationError> {
        self.task.wait().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::computation::scheduler::SchedulerOptions;

    fn scheduler() -> ComputationScheduler {
        ComputationScheduler::new(SchedulerOptions {
            inspector_interval: Duration::from_millis(5),
            worker_pool_size: 4,
        })
    }

    async fn drive<T>(scheduler: &ComputationScheduler, c: &Computation<T>, max_cycles: usize)
    where
        T: Clone + Send + Sync + 'static,
    {
        for _ in 0..max_cycles {
            if c.is_done() {
                return;
            }
            scheduler.step().await;
        }
    }

    #[test]
    fn budget_is_exceeded_only_past_the_limit() {
        let budget = Duration::from_millis(10);
        assert!(!budget_exceeded(Duration::ZERO, budget));
        assert!(!budget_exceeded(budget, budget));
        assert!(budget_exceeded(budget + Duration::from_nanos(1), budget));
        assert!(!budget_exceeded(Duration::ZERO, Duration::ZERO));
    }

    #[tokio::test]
    async fn map_and_flat_map_chain_values() {
        let s = scheduler();
        let inner_sched = s.clone();
        let c = s
            .completed(2u32)
            .map(|v| Ok(v * 10))
            .flat_map(move |v| Ok(inner_sched.supply(move || Ok(v + 1))));

        drive(&s, &c, 10).await;
        assert_eq!(c.try_result(), Some(Ok(21)));
    }

    #[tokio::test]
    async fn failures_skip_downstream_closures() {
        let s = scheduler();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let c = s
            .failed::<u32>(ComputationError::failed("upstream"))
            .map(move |v| {
                *flag.lock().unwrap() = true;
                Ok(v)
            })
            .recover(|e| {
                assert_eq!(e, ComputationError::failed("upstream"));
                Ok(99)
            });

        drive(&s, &c, 10).await;
        assert_eq!(c.try_result(), Some(Ok(99)));
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn combine_waits_for_both_sides() {
        let s = scheduler();
        let a = s.supply(|| Ok(3u32));
        let b = s.supply(|| Ok("x".to_string()));
        let c = a.combine(&b, |n, s| Ok(s.repeat(n as usize)));

        drive(&s, &c, 10).await;
        assert_eq!(c.try_result(), Some(Ok("xxx".to_string())));
    }

    #[tokio::test]
    async fn suspend_until_carries_state_between_checks() {
        let s = scheduler();
        let checks = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&checks);
        let c = s.completed(0u32).suspend_until(
            move |n: u32| -> Result<CondResult<u32>, ComputationError> {
                *counter.lock().unwrap() += 1;
                Ok(if n >= 2 {
                    CondResult::satisfied(n)
                } else {
                    CondResult::pending(n + 1)
                })
            },
            SuspendOptions::default(),
        );

        drive(&s, &c, 20).await;
        assert_eq!(c.try_result(), Some(Ok(2)));
        assert_eq!(*checks.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn cancel_propagates_to_dependents() {
        let s = scheduler();
        let never = s
            .completed(())
            .suspend_until(
                |u: ()| -> Result<CondResult<()>, ComputationError> { Ok(CondResult::pending(u)) },
                SuspendOptions::default(),
            );
        let after = never.map(|_| Ok(1u8));

        assert!(never.cancel());
        assert!(!never.cancel());
        drive(&s, &after, 10).await;
        assert_eq!(after.try_result(), Some(Err(ComputationError::Canceled)));
    }

    #[tokio::test]
    async fn on_complete_sees_the_result_once() {
        let s = scheduler();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let c = s
            .supply(|| Ok(5u32))
            .on_complete(move |r| sink.lock().unwrap().push(r.clone()));

        drive(&s, &c, 10).await;
        assert_eq!(c.join().await, Ok(5));
        assert_eq!(*seen.lock().unwrap(), vec![Ok(5)]);
    }
}
