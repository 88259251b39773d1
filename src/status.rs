//! Status Aggregator
//!
//! Pure read-model over the current tasks of a batch. Holds no state of its
//! own: the same task set always yields the same report, so repeated queries
//! without intervening transitions are identical.

use crate::batch::{Batch, BatchState};
use crate::task::{Task, TaskStatus};
use crate::types::BatchId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

const THROUGHPUT_WINDOW_SECS: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub average_execution_time_ms: f64,
    pub total_api_costs: f64,
    /// (failed + timed out) / total
    pub error_rate: f64,
    pub throughput_per_hour: f64,
    pub peak_concurrent_tasks: usize,
    /// Running tasks relative to the batch's parallelism cap
    pub queue_utilization: f64,
}

/// Batch status report.
///
/// `completed + failed + running + queued == total` always holds; cancelled
/// and timed-out tasks are counted in `failed` and broken out separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatusReport {
    pub batch_id: BatchId,
    pub name: String,
    pub state: BatchState,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub running_tasks: usize,
    pub queued_tasks: usize,
    pub cancelled_tasks: usize,
    pub timed_out_tasks: usize,
    /// In [0, 1]
    pub overall_progress: f64,
    pub statistics: BatchStatistics,
}

impl BatchStatusReport {
    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }
}

/// Build the report for `batch` from its tasks.
pub fn aggregate(batch: &Batch, tasks: &[&Task]) -> BatchStatusReport {
    let total = tasks.len();
    let count = |pred: &dyn Fn(TaskStatus) -> bool| tasks.iter().filter(|t| pred(t.status)).count();

    let completed = count(&|s| s == TaskStatus::Completed);
    let running = count(&TaskStatus::is_active);
    let queued = count(&TaskStatus::is_pending);
    let cancelled = count(&|s| s == TaskStatus::Cancelled);
    let timed_out = count(&|s| s == TaskStatus::Timeout);
    let errored = count(&TaskStatus::is_failure);
    let failed = errored + cancelled;

    BatchStatusReport {
        batch_id: batch.id,
        name: batch.name.clone(),
        state: BatchState::derive(batch, tasks),
        total_tasks: total,
        completed_tasks: completed,
        failed_tasks: failed,
        running_tasks: running,
        queued_tasks: queued,
        cancelled_tasks: cancelled,
        timed_out_tasks: timed_out,
        overall_progress: overall_progress(tasks),
        statistics: BatchStatistics {
            average_execution_time_ms: average_execution_time_ms(tasks),
            total_api_costs: tasks.iter().map(|t| t.performance_metrics.total_cost).sum(),
            error_rate: ratio(errored, total),
            throughput_per_hour: throughput_per_hour(batch.created_at, tasks),
            peak_concurrent_tasks: peak_concurrency(tasks),
            queue_utilization: ratio(running, batch.max_parallel).min(1.0),
        },
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Completed tasks count fully; every other task keeps its last recorded
/// progress so cancelled or failed work does not drag the bar backwards.
fn overall_progress(tasks: &[&Task]) -> f64 {
    if tasks.is_empty() {
        return 0.0;
    }
    let sum: f64 = tasks
        .iter()
        .map(|t| match t.status {
            TaskStatus::Completed => 1.0,
            _ => f64::from(t.progress.min(100)) / 100.0,
        })
        .sum();
    (sum / tasks.len() as f64).clamp(0.0, 1.0)
}

fn average_execution_time_ms(tasks: &[&Task]) -> f64 {
    let times: Vec<u64> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.performance_metrics.execution_time_ms)
        .collect();
    if times.is_empty() {
        0.0
    } else {
        times.iter().sum::<u64>() as f64 / times.len() as f64
    }
}

/// Latest timestamp recorded on any task; the end of the observed window.
fn last_activity(created_at: DateTime<Utc>, tasks: &[&Task]) -> DateTime<Utc> {
    tasks
        .iter()
        .flat_map(|t| {
            [
                Some(t.timestamps.enqueued_at),
                t.timestamps.started_at,
                t.timestamps.completed_at,
            ]
        })
        .flatten()
        .fold(created_at, |latest, ts| latest.max(ts))
}

/// Completions in the trailing hour, scaled to an hourly rate by the
/// observed window (capped at one hour).
fn throughput_per_hour(created_at: DateTime<Utc>, tasks: &[&Task]) -> f64 {
    let end = last_activity(created_at, tasks);
    let window_start = end - ChronoDuration::seconds(THROUGHPUT_WINDOW_SECS as i64);
    let completed_in_window = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .filter_map(|t| t.timestamps.completed_at)
        .filter(|at| *at >= window_start)
        .count();
    if completed_in_window == 0 {
        return 0.0;
    }
    let observed_secs = (end - created_at).num_milliseconds() as f64 / 1000.0;
    let window_secs = observed_secs.clamp(1.0, THROUGHPUT_WINDOW_SECS);
    completed_in_window as f64 * (THROUGHPUT_WINDOW_SECS / window_secs)
}

/// Maximum overlap of the tasks' most recent execution intervals.
fn peak_concurrency(tasks: &[&Task]) -> usize {
    let mut edges: Vec<(DateTime<Utc>, i32)> = Vec::new();
    for task in tasks {
        let Some(start) = task.timestamps.started_at else {
            continue;
        };
        edges.push((start, 1));
        if task.status.is_terminal() {
            if let Some(end) = task.timestamps.completed_at {
                edges.push((end.max(start), -1));
            }
        }
    }
    // Ends sort before starts at the same instant
    edges.sort();

    let mut current: i32 = 0;
    let mut peak: i32 = 0;
    for (_, delta) in edges {
        current += delta;
        peak = peak.max(current);
    }
    peak.max(0) as usize
}
