//! Property-based tests for scheduling guarantees

use crate::integration::test_utils::{coordinator_with, WAIT};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use storyboard::batch::BatchState;
use storyboard::config::SchedulerConfig;
use storyboard::error::ProviderError;
use storyboard::provider::SimulatedProvider;
use storyboard::retry::RetryPolicy;
use storyboard::{BatchSpec, BatchStatusReport, IllustrationRequest, Priority};

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn priority() -> impl Strategy<Value = Priority> {
    prop::sample::select(Priority::ALL.to_vec())
}

fn counts_add_up(report: &BatchStatusReport) -> bool {
    report.completed_tasks + report.failed_tasks + report.running_tasks + report.queued_tasks
        == report.total_tasks
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Concurrency never exceeds max_parallel and every task settles.
    #[test]
    fn parallelism_cap_holds(
        latencies in prop::collection::vec(1u64..500, 1..12),
        max_parallel in 1usize..5,
    ) {
        let runtime = paused_runtime();
        let (peak, report) = runtime.block_on(async move {
            let mut provider = SimulatedProvider::new("sim");
            let mut requests = Vec::new();
            for (i, ms) in latencies.iter().enumerate() {
                let prompt = format!("scene-{:02}", i);
                provider = provider.latency_when(&prompt, Duration::from_millis(*ms));
                requests.push(IllustrationRequest::new(prompt));
            }
            let provider = Arc::new(provider);
            let c = coordinator_with(provider.clone(), RetryPolicy::default(), SchedulerConfig::default());
            c.start().unwrap();
            let id = c.submit(BatchSpec::new("prop", requests).with_max_parallel(max_parallel)).unwrap();
            let report = c.wait_for_batch(id, WAIT).await.unwrap();
            c.shutdown().await;
            (provider.peak_concurrency(), report)
        });

        prop_assert!(peak <= max_parallel);
        prop_assert_eq!(report.state, BatchState::Completed);
        prop_assert!(counts_add_up(&report));
    }

    /// With one slot, calls follow priority and then submission order.
    #[test]
    fn dispatch_order_is_priority_then_fifo(
        priorities in prop::collection::vec(priority(), 1..10),
    ) {
        let runtime = paused_runtime();
        let requests: Vec<IllustrationRequest> = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| IllustrationRequest::new(format!("scene-{:02}", i)).with_priority(*p))
            .collect();
        let mut expected: Vec<(Priority, usize)> =
            priorities.iter().copied().enumerate().map(|(i, p)| (p, i)).collect();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let expected: Vec<String> = expected
            .into_iter()
            .map(|(_, i)| format!("scene-{:02}", i))
            .collect();

        let calls = runtime.block_on(async move {
            let provider = Arc::new(SimulatedProvider::new("sim"));
            let c = coordinator_with(provider.clone(), RetryPolicy::default(), SchedulerConfig::default());
            c.start().unwrap();
            let id = c.submit(BatchSpec::new("prop", requests).with_max_parallel(1)).unwrap();
            c.wait_for_batch(id, WAIT).await.unwrap();
            c.shutdown().await;
            provider.calls()
        });

        prop_assert_eq!(calls, expected);
    }

    /// Mixed outcomes always settle with consistent counters.
    #[test]
    fn mixed_outcomes_settle_consistently(
        outcomes in prop::collection::vec(0u8..3, 1..10),
    ) {
        let runtime = paused_runtime();
        let report = runtime.block_on(async move {
            let mut provider = SimulatedProvider::new("sim").with_timeout(Duration::from_secs(2));
            let mut requests = Vec::new();
            for (i, outcome) in outcomes.iter().enumerate() {
                let prompt = format!("scene-{:02}", i);
                provider = match outcome {
                    0 => provider,
                    1 => provider.fail_when(&prompt, ProviderError::InvalidRequest("bad".to_string())),
                    _ => provider.hang_when(&prompt),
                };
                requests.push(IllustrationRequest::new(prompt));
            }
            let policy = RetryPolicy { automatic: false, ..RetryPolicy::default() };
            let c = coordinator_with(Arc::new(provider), policy, SchedulerConfig::default());
            c.start().unwrap();
            let id = c.submit(BatchSpec::new("prop", requests).with_max_parallel(3)).unwrap();
            let report = c.wait_for_batch(id, WAIT).await.unwrap();
            c.shutdown().await;
            (report, outcomes)
        });
        let (report, outcomes) = report;

        let ok = outcomes.iter().filter(|o| **o == 0).count();
        let timed_out = outcomes.iter().filter(|o| **o == 2).count();
        prop_assert!(report.is_settled());
        prop_assert!(counts_add_up(&report));
        prop_assert_eq!(report.completed_tasks, ok);
        prop_assert_eq!(report.timed_out_tasks, timed_out);
        prop_assert_eq!(report.failed_tasks, outcomes.len() - ok);
        prop_assert!(report.overall_progress >= 0.0 && report.overall_progress <= 1.0);
    }
}
