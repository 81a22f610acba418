// tests/scenarios.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, options};
use svcflow::engine::{ExecutionContext, ServiceProcessor};
use svcflow::model::ServiceEventKind;
use svcflow::types::ServiceState;
use svcflow_test_utils::fake_processor::{FakeBehaviour, FakeProcessor};
use svcflow_test_utils::{eventually, init_tracing, with_timeout};

#[tokio::test]
async fn capacity_two_defers_third_service() {
    init_tracing();
    let h = Harness::new(options(2, 10), |store| {
        vec![Arc::new(FakeProcessor::new("work", FakeBehaviour::Succeed, store)) as Arc<dyn ServiceProcessor>]
    });

    let ids: Vec<_> = (0..3)
        .map(|_| h.submit("work", ExecutionContext::default()).id.unwrap())
        .collect();

    let queue = h.engine.queue();
    assert_eq!(queue.waiting_len(), 2);
    assert_eq!(h.state(ids[0]), ServiceState::Queued);
    assert_eq!(h.state(ids[1]), ServiceState::Queued);
    assert_eq!(h.state(ids[2]), ServiceState::Created);

    // Dispatching frees a place in the window; the backlog fills it.
    let first = queue.dequeue().unwrap().unwrap();
    assert_eq!(first.id, Some(ids[0]));
    queue.refresh().unwrap();
    assert_eq!(queue.waiting_len(), 2);
    assert_eq!(h.state(ids[2]), ServiceState::Queued);
    queue.complete(&first);

    for id in &ids {
        assert!(with_timeout(h.dispatch_until(*id, ServiceState::Successful)).await);
    }
    h.shutdown().await;
}

#[tokio::test]
async fn dependent_runs_only_after_dependency_succeeds() {
    init_tracing();
    let mut fast = None;
    let h = Harness::new(options(10, 10), |store| {
        let b = Arc::new(FakeProcessor::new("fast", FakeBehaviour::Succeed, Arc::clone(&store)));
        fast = Some(Arc::clone(&b));
        vec![
            Arc::new(FakeProcessor::new(
                "slow",
                FakeBehaviour::RunFor(Duration::from_millis(200)),
                store,
            )) as Arc<dyn ServiceProcessor>,
            b,
        ]
    });
    let fast = fast.unwrap();

    let a = h.submit("slow", ExecutionContext::default()).id.unwrap();
    let b = h
        .submit(
            "fast",
            ExecutionContext {
                dependencies: vec![a],
                ..ExecutionContext::default()
            },
        )
        .id
        .unwrap();

    h.dispatcher.dispatch_services().unwrap();
    assert!(
        eventually(|| h.state(b) == ServiceState::WaitingForDependencies).await,
        "dependent should wait while its dependency runs"
    );
    assert!(!h.record(a).has_completed());
    assert!(fast.executed().is_empty());

    assert!(with_timeout(h.dispatch_until(b, ServiceState::Successful)).await);
    let a_record = h.record(a);
    let b_record = h.record(b);
    assert_eq!(a_record.state, ServiceState::Successful);

    let waited = b_record
        .events
        .iter()
        .position(|e| e.kind == ServiceEventKind::WaitingForDependencies)
        .unwrap();
    let running = b_record
        .events
        .iter()
        .rposition(|e| e.kind == ServiceEventKind::Running)
        .unwrap();
    assert!(waited < running);
    assert!(b_record.events[running].at >= a_record.last_event().unwrap().at);
    assert_eq!(fast.executed().len(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn ten_millisecond_timeout_ends_in_timeout() {
    init_tracing();
    let h = Harness::new(options(10, 10), |store| {
        vec![Arc::new(FakeProcessor::new("stuck", FakeBehaviour::Never, store)) as Arc<dyn ServiceProcessor>]
    });

    let id = h
        .submit(
            "stuck",
            ExecutionContext {
                timeout: Some(Duration::from_millis(10)),
                ..ExecutionContext::default()
            },
        )
        .id
        .unwrap();

    assert!(with_timeout(h.dispatch_until(id, ServiceState::Timeout)).await);
    assert!(h.record(id).has_event(ServiceEventKind::Timeout));
    h.shutdown().await;
}

#[tokio::test]
async fn canceled_dependency_cancels_dependent_without_running_it() {
    init_tracing();
    let mut dependent = None;
    let h = Harness::new(options(10, 10), |store| {
        let b = Arc::new(FakeProcessor::new("b", FakeBehaviour::Succeed, Arc::clone(&store)));
        dependent = Some(Arc::clone(&b));
        vec![
            Arc::new(FakeProcessor::new("a", FakeBehaviour::Never, store)) as Arc<dyn ServiceProcessor>,
            b,
        ]
    });
    let dependent = dependent.unwrap();

    let a = h.submit("a", ExecutionContext::default()).id.unwrap();
    let b = h
        .submit(
            "b",
            ExecutionContext {
                dependencies: vec![a],
                ..ExecutionContext::default()
            },
        )
        .id
        .unwrap();

    h.dispatcher.dispatch_services().unwrap();
    assert!(eventually(|| h.state(b) == ServiceState::WaitingForDependencies).await);

    h.engine
        .update_service_state(a, ServiceState::Canceled)
        .unwrap();

    assert!(with_timeout(h.dispatch_until(b, ServiceState::Canceled)).await);
    assert!(dependent.executed().is_empty());
    assert!(h.record(b).has_event(ServiceEventKind::Canceled));
    h.shutdown().await;
}

#[tokio::test]
async fn suspended_then_resumed_service_runs_once() {
    init_tracing();
    let mut fast = None;
    let h = Harness::new(options(10, 10), |store| {
        let b = Arc::new(FakeProcessor::new("fast", FakeBehaviour::Succeed, Arc::clone(&store)));
        fast = Some(Arc::clone(&b));
        vec![
            Arc::new(FakeProcessor::new(
                "slow",
                FakeBehaviour::RunFor(Duration::from_millis(300)),
                store,
            )) as Arc<dyn ServiceProcessor>,
            b,
        ]
    });
    let fast = fast.unwrap();

    let a = h.submit("slow", ExecutionContext::default()).id.unwrap();
    let b = h
        .submit(
            "fast",
            ExecutionContext {
                dependencies: vec![a],
                ..ExecutionContext::default()
            },
        )
        .id
        .unwrap();

    h.dispatcher.dispatch_services().unwrap();
    assert!(eventually(|| h.state(b) == ServiceState::WaitingForDependencies).await);

    h.engine
        .update_service_state(b, ServiceState::Suspended)
        .unwrap();
    assert_eq!(h.engine.queue().submitted_ids(), vec![a]);
    h.engine
        .update_service_state(b, ServiceState::Resumed)
        .unwrap();

    assert!(with_timeout(h.dispatch_until(b, ServiceState::Successful)).await);
    // Give a stray computation time to run, had one survived.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fast.executed().len(), 1, "{:?}", fast.executed());
    let b_record = h.record(b);
    assert_eq!(b_record.state, ServiceState::Successful);
    let completions = b_record
        .events
        .iter()
        .filter(|e| e.kind == ServiceEventKind::Completed)
        .count();
    assert_eq!(completions, 1);
    assert!(b_record.has_event(ServiceEventKind::Suspended));
    h.shutdown().await;
}
