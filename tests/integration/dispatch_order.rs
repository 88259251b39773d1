//! Dispatch order, concurrency caps and provider call spacing

use crate::integration::test_utils::{coordinator, coordinator_with, requests, settle_loop, WAIT};
use std::sync::Arc;
use std::time::Duration;
use storyboard::config::SchedulerConfig;
use storyboard::provider::SimulatedProvider;
use storyboard::retry::RetryPolicy;
use storyboard::{BatchSpec, IllustrationRequest, Priority, TaskStatus};

#[tokio::test(start_paused = true)]
async fn higher_priority_first_then_submission_order() {
    let provider = Arc::new(SimulatedProvider::new("sim"));
    let c = coordinator(provider.clone());
    c.start().unwrap();

    let requests = vec![
        IllustrationRequest::new("a"),
        IllustrationRequest::new("b").with_priority(Priority::High),
        IllustrationRequest::new("c").with_priority(Priority::Urgent),
        IllustrationRequest::new("d"),
        IllustrationRequest::new("e").with_priority(Priority::Low),
        IllustrationRequest::new("f").with_priority(Priority::High),
    ];
    let id = c
        .submit(BatchSpec::new("Ordering", requests).with_max_parallel(1))
        .unwrap();
    c.wait_for_batch(id, WAIT).await.unwrap();

    assert_eq!(provider.calls(), vec!["c", "b", "f", "a", "d", "e"]);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batch_priority_applies_to_requests_without_their_own() {
    let provider = Arc::new(SimulatedProvider::new("sim"));
    let c = coordinator(provider);
    c.start().unwrap();

    let id = c
        .submit(
            BatchSpec::new(
                "Mixed",
                vec![
                    IllustrationRequest::new("inherits"),
                    IllustrationRequest::new("own").with_priority(Priority::Low),
                ],
            )
            .with_priority(Priority::Critical),
        )
        .unwrap();
    let tasks = c.tasks(id).unwrap();
    assert_eq!(tasks[0].priority, Priority::Critical);
    assert_eq!(tasks[1].priority, Priority::Low);
    c.wait_for_batch(id, WAIT).await.unwrap();
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn max_parallel_bounds_concurrent_calls() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_latency(Duration::from_millis(200)));
    let c = coordinator(provider.clone());
    c.start().unwrap();

    let id = c
        .submit(
            BatchSpec::new("Cap", requests(&["1", "2", "3", "4", "5", "6", "7"])).with_max_parallel(3),
        )
        .unwrap();
    let report = c.wait_for_batch(id, WAIT).await.unwrap();

    assert_eq!(report.completed_tasks, 7);
    assert_eq!(provider.peak_concurrency(), 3);
    assert_eq!(report.statistics.peak_concurrent_tasks, 3);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn global_cap_bounds_a_wide_batch() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_latency(Duration::from_millis(200)));
    let config = SchedulerConfig {
        global_max_concurrent: Some(2),
        ..SchedulerConfig::default()
    };
    let c = coordinator_with(provider.clone(), RetryPolicy::default(), config);
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Wide", requests(&["1", "2", "3", "4", "5", "6"])).with_max_parallel(5))
        .unwrap();
    c.wait_for_batch(id, WAIT).await.unwrap();
    assert_eq!(provider.peak_concurrency(), 2);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn later_batch_is_not_starved() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_latency(Duration::from_secs(1)));
    let c = coordinator(provider);
    c.start().unwrap();

    let long = c
        .submit(BatchSpec::new("Long", requests(&["1", "2", "3", "4", "5", "6"])).with_max_parallel(2))
        .unwrap();
    let short = c
        .submit(BatchSpec::new("Short", requests(&["quick"])).with_max_parallel(1))
        .unwrap();
    settle_loop().await;

    let quick = c.tasks(short).unwrap().remove(0);
    assert_eq!(quick.status, TaskStatus::Running);

    c.wait_for_batch(short, WAIT).await.unwrap();
    assert!(!c.get_status(long).unwrap().is_settled());
    c.wait_for_batch(long, WAIT).await.unwrap();
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn provider_call_spacing_is_respected() {
    let provider = Arc::new(
        SimulatedProvider::new("sim")
            .with_latency(Duration::from_millis(10))
            .with_min_call_spacing(Duration::from_secs(1)),
    );
    let c = coordinator(provider.clone());
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Spaced", requests(&["a", "b", "c"])).with_max_parallel(3))
        .unwrap();
    c.wait_for_batch(id, WAIT).await.unwrap();

    let starts: Vec<_> = c
        .tasks(id)
        .unwrap()
        .iter()
        .filter_map(|t| t.timestamps.started_at)
        .collect();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        assert!((pair[1] - pair[0]).num_milliseconds() >= 1000);
    }
    assert_eq!(provider.peak_concurrency(), 1);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn spaced_batch_reports_waiting_tasks() {
    let provider = Arc::new(
        SimulatedProvider::new("sim")
            .with_latency(Duration::from_millis(10))
            .with_min_call_spacing(Duration::from_secs(5)),
    );
    let c = coordinator(provider);
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Waiting", requests(&["a", "b"])).with_max_parallel(2))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tasks = c.tasks(id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[1].status, TaskStatus::Waiting);
    c.wait_for_batch(id, WAIT).await.unwrap();
    c.shutdown().await;
}
