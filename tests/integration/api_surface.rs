//! Envelope behavior of the in-process API and the event stream

use crate::integration::test_utils::{coordinator, requests, settle_loop, WAIT};
use std::sync::Arc;
use std::time::Duration;
use storyboard::provider::SimulatedProvider;
use storyboard::telemetry;
use storyboard::{BatchId, IllustrationApi, Priority};

fn api(provider: Arc<SimulatedProvider>) -> IllustrationApi {
    let c = Arc::new(coordinator(provider));
    c.start().unwrap();
    IllustrationApi::new(c)
}

#[tokio::test(start_paused = true)]
async fn empty_submission_is_rejected_without_creating_a_batch() {
    let api = api(Arc::new(SimulatedProvider::new("sim")));

    let response = api.submit_batch("Empty", Priority::Normal, vec![], 2);
    assert!(!response.success);
    assert!(response.data.is_none());
    assert!(response.message.is_some());

    let summary = api.get_all_batches_summary();
    assert!(summary.success);
    assert_eq!(summary.data.map(|s| s.len()), Some(0));
    api.coordinator().shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn zero_max_parallel_is_rejected() {
    let api = api(Arc::new(SimulatedProvider::new("sim")));
    let response = api.submit_batch("Zero", Priority::Normal, requests(&["a"]), 0);
    assert!(!response.success);
    api.coordinator().shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_batch_reports_failure() {
    let api = api(Arc::new(SimulatedProvider::new("sim")));
    let missing = BatchId::from(u64::MAX);

    assert!(!api.get_batch_status(missing).success);
    assert!(!api.cancel_batch(missing).success);
    let retry = api.retry_failed_tasks(missing);
    assert!(!retry.success);
    assert!(retry.message.is_some_and(|m| m.contains("not found")));
    api.coordinator().shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn submit_status_cancel_round_trip() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_latency(Duration::from_secs(1)));
    let api = api(provider);

    let submitted = api.submit_batch("Chapter 1", Priority::High, requests(&["a", "b", "c"]), 1);
    assert!(submitted.success);
    let id = submitted.data.unwrap();
    settle_loop().await;

    let status = api.get_batch_status(id);
    assert!(status.success);
    assert_eq!(status.data.map(|r| r.running_tasks), Some(1));

    let cancelled = api.cancel_batch(id);
    assert!(cancelled.success);
    assert!(cancelled.message.is_some_and(|m| m.contains("Cancelled 2")));

    let report = api.coordinator().wait_for_batch(id, WAIT).await.unwrap();
    assert_eq!(report.cancelled_tasks, 3);
    api.coordinator().shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn events_follow_the_task_lifecycle() {
    let api = api(Arc::new(SimulatedProvider::new("sim")));
    let mut events = api.coordinator().events().subscribe();

    let id = api
        .submit_batch("Chapter 2", Priority::Normal, requests(&["a"]), 1)
        .data
        .unwrap();
    api.coordinator().wait_for_batch(id, WAIT).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.event_type);
    }
    assert_eq!(
        kinds,
        vec![
            telemetry::BATCH_SUBMITTED,
            telemetry::TASK_ENQUEUED,
            telemetry::TASK_DISPATCHED,
            telemetry::TASK_COMPLETED,
        ]
    );
    api.coordinator().shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn wait_times_out_on_a_slow_batch() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_latency(Duration::from_secs(30)));
    let api = api(provider);
    let id = api
        .submit_batch("Slow", Priority::Normal, requests(&["a"]), 1)
        .data
        .unwrap();

    let err = api
        .coordinator()
        .wait_for_batch(id, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, storyboard::BatchError::WaitTimeout(_)));
    api.coordinator().shutdown().await;
}
