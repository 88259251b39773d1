//! Batch cancellation with queued and in-flight tasks

use crate::integration::test_utils::{coordinator, requests, settle_loop, WAIT};
use std::sync::Arc;
use std::time::Duration;
use storyboard::batch::BatchState;
use storyboard::provider::SimulatedProvider;
use storyboard::error::ProviderError;
use storyboard::{BatchError, BatchSpec, TaskStatus};

#[tokio::test(start_paused = true)]
async fn cancel_stops_queued_tasks_and_discards_in_flight_results() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_latency(Duration::from_secs(2)));
    let c = coordinator(provider.clone());
    c.start().unwrap();

    let id = c
        .submit(
            BatchSpec::new("Chapter 11", requests(&["a", "b", "c", "d", "e"])).with_max_parallel(2),
        )
        .unwrap();
    settle_loop().await;
    let before = c.get_status(id).unwrap();
    assert_eq!(before.running_tasks, 2);
    assert_eq!(before.queued_tasks, 3);

    assert_eq!(c.cancel(id).unwrap(), 3);
    let during = c.get_status(id).unwrap();
    assert_eq!(during.cancelled_tasks, 3);
    assert_eq!(during.running_tasks, 2);
    assert!(!during.is_settled());

    let report = c.wait_for_batch(id, WAIT).await.unwrap();
    assert_eq!(report.state, BatchState::Cancelled);
    assert_eq!(report.cancelled_tasks, 5);
    assert_eq!(report.completed_tasks, 0);
    assert_eq!(provider.call_count(), 2);

    for task in c.tasks(id).unwrap() {
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(c.take_image(task.id).is_none());
    }
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_batch_cannot_be_retried_or_paused() {
    let provider = Arc::new(SimulatedProvider::new("sim"));
    let c = coordinator(provider);
    c.start().unwrap();

    let id = c.submit(BatchSpec::new("Chapter 12", requests(&["a", "b"]))).unwrap();
    c.cancel(id).unwrap();
    c.wait_for_batch(id, WAIT).await.unwrap();

    assert!(matches!(c.retry_failed_tasks(id), Err(BatchError::Validation(_))));
    assert!(matches!(c.pause_batch(id), Err(BatchError::Validation(_))));
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_settled_batch_changes_nothing() {
    let provider = Arc::new(SimulatedProvider::new("sim"));
    let c = coordinator(provider);
    c.start().unwrap();

    let id = c.submit(BatchSpec::new("Chapter 13", requests(&["a"]))).unwrap();
    c.wait_for_batch(id, WAIT).await.unwrap();

    assert_eq!(c.cancel(id).unwrap(), 0);
    let tasks = c.tasks(id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_other_batch_leaves_neighbours_running() {
    let provider = Arc::new(SimulatedProvider::new("sim"));
    let c = coordinator(provider);
    c.start().unwrap();

    let kept = c.submit(BatchSpec::new("Kept", requests(&["a", "b", "c"]))).unwrap();
    let dropped = c.submit(BatchSpec::new("Dropped", requests(&["x", "y", "z"]))).unwrap();
    c.cancel(dropped).unwrap();

    let report = c.wait_for_batch(kept, WAIT).await.unwrap();
    assert_eq!(report.state, BatchState::Completed);
    assert_eq!(c.wait_for_batch(dropped, WAIT).await.unwrap().state, BatchState::Cancelled);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn task_timestamps_follow_the_scheduler_clock() {
    let provider = Arc::new(
        SimulatedProvider::new("sim")
            .with_latency(Duration::from_secs(2))
            .fail_when("storm", ProviderError::SafetyRejected("content policy".to_string())),
    );
    let c = coordinator(provider);
    c.start().unwrap();
    tokio::time::advance(Duration::from_secs(600)).await;

    let finished = c
        .submit(BatchSpec::new("Chapter 14", requests(&["harbour", "storm"])))
        .unwrap();
    let cancelled = c
        .submit(BatchSpec::new("Chapter 15", requests(&["a", "b"])).with_max_parallel(1))
        .unwrap();
    settle_loop().await;
    c.cancel(cancelled).unwrap();
    c.wait_for_batch(finished, WAIT).await.unwrap();
    c.wait_for_batch(cancelled, WAIT).await.unwrap();

    let mut statuses = Vec::new();
    for id in [finished, cancelled] {
        for task in c.tasks(id).unwrap() {
            let stamps = &task.timestamps;
            let completed_at = stamps.completed_at.unwrap();
            if let Some(started_at) = stamps.started_at {
                assert!(stamps.enqueued_at <= started_at, "{:?}", task.status);
                assert!(started_at <= completed_at, "{:?}", task.status);
            }
            assert!(stamps.enqueued_at <= completed_at, "{:?}", task.status);
            statuses.push(task.status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Cancelled
        ]
    );
    c.shutdown().await;
}
