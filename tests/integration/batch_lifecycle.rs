//! Submission through settlement for batches that succeed

use crate::integration::test_utils::{coordinator, requests, settle_loop, WAIT};
use std::sync::Arc;
use std::time::Duration;
use storyboard::batch::BatchState;
use storyboard::provider::SimulatedProvider;
use storyboard::{BatchSpec, TaskStatus};

#[tokio::test(start_paused = true)]
async fn five_tasks_two_at_a_time_all_complete() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_cost(0.02));
    let c = coordinator(provider.clone());
    c.start().unwrap();

    let spec = BatchSpec::new("Chapter 3", requests(&["one", "two", "three", "four", "five"]))
        .with_max_parallel(2);
    let id = c.submit(spec).unwrap();
    let report = c.wait_for_batch(id, WAIT).await.unwrap();

    assert_eq!(report.state, BatchState::Completed);
    assert_eq!(report.total_tasks, 5);
    assert_eq!(report.completed_tasks, 5);
    assert_eq!(report.failed_tasks, 0);
    assert_eq!(report.overall_progress, 1.0);
    assert_eq!(report.statistics.error_rate, 0.0);
    assert!((report.statistics.total_api_costs - 0.10).abs() < 1e-9);
    assert_eq!(report.statistics.peak_concurrent_tasks, 2);
    assert_eq!(provider.peak_concurrency(), 2);
    assert_eq!(provider.call_count(), 5);

    for task in c.tasks(id).unwrap() {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.error_message.is_none());
        assert!(task.timestamps.started_at.is_some());
        assert!(task.timestamps.completed_at >= task.timestamps.started_at);
    }
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn status_queries_are_idempotent() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_latency(Duration::from_secs(10)));
    let c = coordinator(provider);
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Chapter 4", requests(&["a", "b", "c"])).with_max_parallel(1))
        .unwrap();
    settle_loop().await;

    let first = c.get_status(id).unwrap();
    let second = c.get_status(id).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.running_tasks, 1);
    assert_eq!(first.queued_tasks, 2);
    assert_eq!(
        first.completed_tasks + first.failed_tasks + first.running_tasks + first.queued_tasks,
        first.total_tasks
    );
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn summaries_list_batches_in_submission_order() {
    let provider = Arc::new(SimulatedProvider::new("sim"));
    let c = coordinator(provider);
    c.start().unwrap();

    let first = c.submit(BatchSpec::new("Prologue", requests(&["a"]))).unwrap();
    let second = c.submit(BatchSpec::new("Epilogue", requests(&["b", "c"]))).unwrap();
    c.wait_for_batch(first, WAIT).await.unwrap();
    c.wait_for_batch(second, WAIT).await.unwrap();

    let summaries = c.list_batches();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].id, first);
    assert_eq!(summaries[1].name, "Epilogue");
    assert_eq!(summaries[1].total_tasks, 2);
    assert_eq!(summaries[1].completed_tasks, 2);
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pause_holds_back_pending_tasks_until_resumed() {
    let provider = Arc::new(SimulatedProvider::new("sim").with_latency(Duration::from_secs(1)));
    let c = coordinator(provider.clone());
    c.start().unwrap();

    let id = c
        .submit(BatchSpec::new("Interlude", requests(&["a", "b", "c"])).with_max_parallel(1))
        .unwrap();
    settle_loop().await;
    c.pause_batch(id).unwrap();
    assert_eq!(c.get_status(id).unwrap().state, BatchState::Paused);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(provider.call_count(), 1);
    let report = c.get_status(id).unwrap();
    assert_eq!(report.completed_tasks, 1);
    assert_eq!(report.queued_tasks, 2);

    c.resume_batch(id).unwrap();
    let report = c.wait_for_batch(id, WAIT).await.unwrap();
    assert_eq!(report.state, BatchState::Completed);
    assert_eq!(provider.call_count(), 3);
    c.shutdown().await;
}
