use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use svcflow::computation::{Computation, ComputationScheduler, CondResult, SuspendOptions};
use svcflow::engine::{
    EmptyResult, ErrorChecker, LifecycleStages, NoErrors, ResultHandler, ServiceProcessor,
    ServiceResult, run_lifecycle,
};
use svcflow::errors::ComputationError;
use svcflow::exec::{JobHandle, JobInstanceInfo, JobStatus};
use svcflow::model::ServiceRecord;
use svcflow::store::ServicePersistence;
use svcflow::types::ProcessingLocation;

/// What a [`FakeProcessor`] does in its processing stage.
#[derive(Debug, Clone)]
pub enum FakeBehaviour {
    /// Complete right away.
    Succeed,
    /// Hold the stage for a while, then complete.
    RunFor(Duration),
    /// Fail the processing stage.
    Fail(String),
    /// Fail inside `process` before any stage is scheduled.
    FailImmediately(String),
    /// Suspend forever; only the record's timeout ends it.
    Never,
}

/// A processor that:
/// - records which services reached their processing stage
/// - tracks how many were processing at once
/// - otherwise goes through the regular lifecycle.
#[derive(Debug)]
pub struct FakeProcessor {
    name: String,
    behaviour: FakeBehaviour,
    store: Arc<dyn ServicePersistence>,
    executed: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeProcessor {
    pub fn new(name: &str, behaviour: FakeBehaviour, store: Arc<dyn ServicePersistence>) -> Self {
        Self {
            name: name.to_string(),
            behaviour,
            store,
            executed: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Labels (`name#id`) of every record that reached processing, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.executed)
    }

    /// Highest number of services processing at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }
}

impl ServiceProcessor for FakeProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self: Arc<Self>,
        scheduler: &ComputationScheduler,
        record: ServiceRecord,
    ) -> Computation<ServiceResult> {
        if let FakeBehaviour::FailImmediately(message) = &self.behaviour {
            return scheduler.failed(ComputationError::JobExecution {
                service: record.id,
                message: message.clone(),
            });
        }
        run_lifecycle(self, scheduler, record)
    }

    fn result_handler(&self) -> &dyn ResultHandler {
        &EmptyResult
    }

    fn error_checker(&self) -> &dyn ErrorChecker {
        &NoErrors
    }
}

impl LifecycleStages for FakeProcessor {
    fn store(&self) -> &Arc<dyn ServicePersistence> {
        &self.store
    }

    fn result_handler(&self) -> &dyn ResultHandler {
        &EmptyResult
    }

    fn dependency_poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }

    fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }

    fn processing(
        &self,
        scheduler: &ComputationScheduler,
        record: ServiceRecord,
    ) -> Result<Computation<ServiceRecord>, ComputationError> {
        self.executed.lock().unwrap().push(record.label());
        self.enter();

        let active = Arc::clone(&self.active);
        let leave = move |_: &Result<ServiceRecord, ComputationError>| {
            active.fetch_sub(1, Ordering::SeqCst);
        };
        let poll = SuspendOptions::polling(Duration::from_millis(5));

        let stage = match &self.behaviour {
            FakeBehaviour::Succeed => scheduler.completed(record),
            FakeBehaviour::Fail(message) => scheduler.failed(ComputationError::JobExecution {
                service: record.id,
                message: message.clone(),
            }),
            FakeBehaviour::FailImmediately(_) => scheduler.completed(record),
            FakeBehaviour::RunFor(duration) => {
                let until = Instant::now() + *duration;
                scheduler.completed(record).suspend_until(
                    move |r: ServiceRecord| -> Result<CondResult<ServiceRecord>, ComputationError> {
                        Ok(if Instant::now() >= until {
                            CondResult::satisfied(r)
                        } else {
                            CondResult::pending(r)
                        })
                    },
                    poll.with_timeout(None),
                )
            }
            FakeBehaviour::Never => {
                let timeout = record.timeout;
                scheduler.completed(record).suspend_until(
                    |r: ServiceRecord| -> Result<CondResult<ServiceRecord>, ComputationError> {
                        Ok(CondResult::pending(r))
                    },
                    poll.with_timeout(timeout),
                )
            }
        };
        Ok(stage.on_complete(leave))
    }
}

/// A job handle finished by the test instead of a process.
#[derive(Debug, Default)]
pub struct FakeJob {
    started: AtomicBool,
    finished: AtomicBool,
    failed: AtomicBool,
    terminated: AtomicBool,
}

impl FakeJob {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn finish(&self, success: bool) {
        self.failed.store(!success, Ordering::SeqCst);
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn status(&self) -> JobStatus {
        if self.terminated.load(Ordering::SeqCst) {
            JobStatus::Terminated
        } else if self.finished.load(Ordering::SeqCst) {
            if self.failed.load(Ordering::SeqCst) {
                JobStatus::Failed("fake failure".to_string())
            } else {
                JobStatus::Succeeded
            }
        } else if self.was_started() {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }
}

/// Shared handle so the test keeps control after handing it to a throttle.
#[derive(Debug, Clone)]
pub struct SharedFakeJob(pub Arc<FakeJob>);

impl JobHandle for SharedFakeJob {
    fn start(&self) -> Result<(), ComputationError> {
        self.0.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.0.status().is_done()
    }

    fn has_failed(&self) -> bool {
        self.0.status().is_failure()
    }

    fn terminate(&self) {
        self.0.terminated.store(true, Ordering::SeqCst);
    }

    fn instance_info(&self) -> JobInstanceInfo {
        JobInstanceInfo {
            job_id: "fake".to_string(),
            backend: ProcessingLocation::Local,
            pid: None,
            exit_code: None,
            status: self.0.status(),
            stdout: "fake.out".into(),
            stderr: "fake.err".into(),
        }
    }
}
