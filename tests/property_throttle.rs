// tests/property_throttle.rs

use std::sync::Arc;

use proptest::prelude::*;
use svcflow::exec::{JobThrottle, ThrottleOptions};
use svcflow_test_utils::fake_processor::{FakeJob, SharedFakeJob};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn throttle_respects_limit_and_starts_in_submission_order(
        n in 1usize..25,
        limit in 1usize..5,
        picks in proptest::collection::vec(any::<usize>(), 25),
    ) {
        let throttle = JobThrottle::new(ThrottleOptions {
            default_max_running: limit,
            ..ThrottleOptions::default()
        });

        let jobs: Vec<Arc<FakeJob>> = (0..n).map(|_| FakeJob::new()).collect();
        let handles: Vec<_> = jobs
            .iter()
            .map(|job| throttle.submit("batch", Box::new(SharedFakeJob(Arc::clone(job)))).unwrap())
            .collect();

        let mut finished = vec![false; n];
        for pick in picks.iter().cycle().take(n) {
            prop_assert!(throttle.running_count("batch") <= limit);

            let started: Vec<bool> = jobs.iter().map(|j| j.was_started()).collect();
            let prefix = started.iter().take_while(|s| **s).count();
            prop_assert!(started[prefix..].iter().all(|s| !s), "jobs started out of order: {started:?}");

            let live: Vec<usize> = (0..n).filter(|i| started[*i] && !finished[*i]).collect();
            prop_assert!(!live.is_empty(), "nothing running while work remains");
            let chosen = live[pick % live.len()];
            jobs[chosen].finish(true);
            finished[chosen] = true;
            throttle.sweep();
        }

        prop_assert!(jobs.iter().all(|j| j.was_started()));
        prop_assert!(handles.iter().all(|h| h.is_done()));
        prop_assert_eq!(throttle.running_count("batch"), 0);
        prop_assert_eq!(throttle.waiting_count("batch"), 0);
    }
}
