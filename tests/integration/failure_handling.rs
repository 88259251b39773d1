//! Terminal and retryable failures, automatic and explicit retries, timeouts

use crate::integration::test_utils::{coordinator_with, manual_retries, requests, WAIT};
use std::sync::Arc;
use std::time::Duration;
use storyboard::batch::BatchState;
use storyboard::config::SchedulerConfig;
use storyboard::error::ProviderError;
use storyboard::provider::SimulatedProvider;
use storyboard::retry::{FailureClass, RetryPolicy};
use storyboard::{BatchSpec, TaskStatus};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn terminal_failure_is_not_retried() {
    let provider = Arc::new(SimulatedProvider::new("sim").fail_when(
        "gore",
        ProviderError::SafetyRejected("content policy".to_string()),
    ));
    let c = coordinator_with(provider.clone(), RetryPolicy::default(), SchedulerConfig::default());
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Chapter 9", requests(&["battle gore", "quiet morning"])))
        .unwrap();
    let report = c.wait_for_batch(id, WAIT).await.unwrap();
    assert_eq!(report.state, BatchState::PartiallyFailed);
    assert_eq!(report.failed_tasks, 1);
    assert_eq!(report.statistics.error_rate, 0.5);

    let failed = c.tasks(id).unwrap().remove(0);
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.failure_class, Some(FailureClass::Terminal));
    assert_eq!(failed.retry_count, 0);
    assert!(failed
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("content policy")));

    let outcome = c.retry_failed_tasks(id).unwrap();
    assert!(outcome.requeued.is_empty());
    assert_eq!(outcome.left_failed, 1);
    assert_eq!(c.task(failed.id).unwrap().status, TaskStatus::Failed);
    assert_eq!(provider.call_count(), 2);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_is_requeued_on_request() {
    let provider = Arc::new(SimulatedProvider::new("sim").fail_times(
        "storm",
        ProviderError::Network("connection reset".to_string()),
        1,
    ));
    let c = coordinator_with(provider.clone(), manual_retries(), SchedulerConfig::default());
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Chapter 5", requests(&["storm at sea"])))
        .unwrap();
    let report = c.wait_for_batch(id, WAIT).await.unwrap();
    assert_eq!(report.state, BatchState::Failed);

    let task_id = c.tasks(id).unwrap()[0].id;
    let failed = c.task(task_id).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.failure_class, Some(FailureClass::Retryable));

    let outcome = c.retry_failed_tasks(id).unwrap();
    assert_eq!(outcome.requeued, vec![task_id]);
    let requeued = c.task(task_id).unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.progress, 0);
    assert!(requeued.error_message.is_none());

    let report = c.wait_for_batch(id, WAIT).await.unwrap();
    assert_eq!(report.state, BatchState::Completed);
    assert_eq!(provider.call_count(), 2);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn automatic_retry_waits_out_the_delay() {
    let provider = Arc::new(SimulatedProvider::new("sim").fail_times(
        "storm",
        ProviderError::Unavailable("503".to_string()),
        1,
    ));
    let policy = RetryPolicy {
        base_delay: Duration::from_secs(2),
        ..RetryPolicy::default()
    };
    let c = coordinator_with(provider.clone(), policy, SchedulerConfig::default());
    c.start().unwrap();

    let started = Instant::now();
    let id = c
        .submit(BatchSpec::new("Chapter 6", requests(&["storm at sea"])))
        .unwrap();
    let report = c.wait_for_batch(id, WAIT).await.unwrap();

    assert_eq!(report.state, BatchState::Completed);
    assert!(started.elapsed() >= Duration::from_secs(2));
    let task = c.tasks(id).unwrap().remove(0);
    assert_eq!(task.retry_count, 1);
    assert_eq!(provider.call_count(), 2);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_the_ceiling() {
    let provider = Arc::new(
        SimulatedProvider::new("sim")
            .fail_when("storm", ProviderError::RateLimited("slow down".to_string())),
    );
    let policy = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(100),
        ..RetryPolicy::default()
    };
    let c = coordinator_with(provider.clone(), policy, SchedulerConfig::default());
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Chapter 7", requests(&["storm at sea"])))
        .unwrap();
    c.wait_for_batch(id, WAIT).await.unwrap();

    let task = c.tasks(id).unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(provider.call_count(), 3);

    let outcome = c.retry_failed_tasks(id).unwrap();
    assert!(outcome.requeued.is_empty());
    assert_eq!(outcome.left_failed, 1);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hung_call_times_out() {
    let provider = Arc::new(
        SimulatedProvider::new("sim")
            .hang_when("abyss")
            .with_timeout(Duration::from_secs(5)),
    );
    let c = coordinator_with(provider.clone(), manual_retries(), SchedulerConfig::default());
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Chapter 8", requests(&["into the abyss", "back on shore"])))
        .unwrap();
    let report = c.wait_for_batch(id, WAIT).await.unwrap();

    assert_eq!(report.state, BatchState::PartiallyFailed);
    assert_eq!(report.completed_tasks, 1);
    assert_eq!(report.failed_tasks, 1);
    assert_eq!(report.timed_out_tasks, 1);

    let timed_out = c.tasks(id).unwrap().remove(0);
    assert_eq!(timed_out.status, TaskStatus::Timeout);
    assert!(timed_out.performance_metrics.execution_time_ms >= 5000);

    let outcome = c.retry_failed_tasks(id).unwrap();
    assert_eq!(outcome.requeued, vec![timed_out.id]);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scheduler_default_timeout_applies_without_provider_deadline() {
    let provider = Arc::new(SimulatedProvider::new("sim").hang_when("abyss"));
    let config = SchedulerConfig {
        task_timeout_secs: 3,
        ..SchedulerConfig::default()
    };
    let c = coordinator_with(provider, manual_retries(), config);
    c.start().unwrap();

    let started = Instant::now();
    let id = c
        .submit(BatchSpec::new("Chapter 10", requests(&["into the abyss"])))
        .unwrap();
    let report = c.wait_for_batch(id, WAIT).await.unwrap();
    assert_eq!(report.timed_out_tasks, 1);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(4));
    c.shutdown().await;
}
