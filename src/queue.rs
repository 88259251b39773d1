//! Task Queue
//!
//! Synchronous state core shared by the scheduler loop and the batch
//! coordinator. Holds the task table, the priority heap of pending tasks and
//! the per-batch admission state (running count, rate-limit spacing). Every
//! task status change happens here, under one lock held by the caller.

use crate::batch::{Batch, BatchState, BatchSummary};
use crate::config::SchedulerConfig;
use crate::error::{BatchError, ProviderError};
use crate::provider::{GenerationOptions, ImageData, ImageProvider};
use crate::retry::{FailureClass, RetryPolicy};
use crate::status::{self, BatchStatusReport};
use crate::task::{IllustrationRequest, Task, TaskStatus};
use crate::types::{BatchId, TaskId};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Heap entry for a pending task.
///
/// A task is pushed again (with a fresh `seq`) each time it re-enters
/// `Queued`; entries whose `seq` no longer matches the task are stale and
/// dropped on pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: crate::task::Priority,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    /// Higher priority first, then lower sequence (earlier enqueue) first
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => self.seq.cmp(&other.seq).reverse(),
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-batch admission state
struct BatchSlot {
    batch: Batch,
    provider: Arc<dyn ImageProvider>,
    running: usize,
    last_dispatch: Option<Instant>,
    min_spacing: Option<Duration>,
    timeout: Duration,
    expected_duration: Duration,
}

impl BatchSlot {
    fn spacing_ready_at(&self) -> Option<Instant> {
        match (self.last_dispatch, self.min_spacing) {
            (Some(last), Some(spacing)) => Some(last + spacing),
            _ => None,
        }
    }

    /// True when this batch cannot take another task right now.
    fn held_back(&self, now: Instant) -> bool {
        self.batch.cancelled
            || self.batch.paused
            || self.running >= self.batch.max_parallel
            || self.spacing_ready_at().is_some_and(|ready| ready > now)
    }
}

/// A task selected for dispatch, with everything needed to call the provider.
pub struct Dispatch {
    pub task_id: TaskId,
    pub batch_id: BatchId,
    pub attempt: u64,
    pub prompt: String,
    pub options: GenerationOptions,
    pub provider: Arc<dyn ImageProvider>,
    pub timeout: Duration,
    pub retry_count: u32,
}

/// What happened to a task when its provider call returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Completed {
        batch_id: BatchId,
        cost: f64,
    },
    Retrying {
        batch_id: BatchId,
        retry_count: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        batch_id: BatchId,
        class: FailureClass,
        error: String,
    },
    TimedOut {
        batch_id: BatchId,
        error: String,
    },
    /// Cancelled while in flight; the result was discarded
    Cancelled { batch_id: BatchId },
    /// The attempt is no longer current (task purged or already settled)
    Stale,
}

/// Result of cancelling a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelOutcome {
    /// Pending tasks cancelled immediately
    pub cancelled: Vec<TaskId>,
    /// In-flight tasks that will be cancelled when their call returns
    pub deferred: Vec<TaskId>,
}

/// Result of a manual retry request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOutcome {
    pub requeued: Vec<TaskId>,
    /// Failed tasks left as-is (terminal class or retry ceiling reached)
    pub left_failed: usize,
}

/// Maps the monotonic clock onto wall-clock timestamps.
struct Clock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
}

impl Clock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
        }
    }

    fn wall(&self, at: Instant) -> DateTime<Utc> {
        let elapsed = at.saturating_duration_since(self.origin);
        chrono::Duration::from_std(elapsed)
            .map(|d| self.wall_origin + d)
            .unwrap_or(self.wall_origin)
    }
}

pub struct TaskQueue {
    batches: HashMap<BatchId, BatchSlot>,
    batch_order: Vec<BatchId>,
    tasks: HashMap<TaskId, Task>,
    heap: BinaryHeap<QueueEntry>,
    /// Retrying tasks and the instant they return to `Queued`
    delayed: Vec<(Instant, TaskId)>,
    /// Current attempt number of every in-flight task
    in_flight: HashMap<TaskId, u64>,
    images: HashMap<TaskId, ImageData>,
    next_seq: u64,
    next_attempt: u64,
    global_running: usize,
    max_queue_size: usize,
    global_max_concurrent: Option<usize>,
    default_timeout: Duration,
    clock: Clock,
}

impl TaskQueue {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            batches: HashMap::new(),
            batch_order: Vec::new(),
            tasks: HashMap::new(),
            heap: BinaryHeap::new(),
            delayed: Vec::new(),
            in_flight: HashMap::new(),
            images: HashMap::new(),
            next_seq: 0,
            next_attempt: 0,
            global_running: 0,
            max_queue_size: config.max_queue_size,
            global_max_concurrent: config.global_max_concurrent,
            default_timeout: config.task_timeout(),
            clock: Clock::new(),
        }
    }

    /// Insert a batch and all of its tasks, or nothing at all.
    pub fn enqueue_batch(
        &mut self,
        mut batch: Batch,
        provider: Arc<dyn ImageProvider>,
        requests: Vec<IllustrationRequest>,
        now: Instant,
    ) -> Result<Vec<TaskId>, BatchError> {
        let pending = self.pending_count();
        if pending + requests.len() > self.max_queue_size {
            return Err(BatchError::QueueFull {
                capacity: self.max_queue_size,
            });
        }

        let enqueued_at = self.clock.wall(now);
        batch.created_at = enqueued_at;
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let priority = request.priority.unwrap_or(batch.priority);
            let mut task = Task::new(batch.id, request, priority, enqueued_at);
            task.queued_since = Some(now);
            ids.push(task.id);
            self.push_pending(&mut task);
            self.tasks.insert(task.id, task);
        }
        batch.tasks = ids.clone();

        let slot = BatchSlot {
            min_spacing: provider.min_call_spacing(),
            timeout: provider.request_timeout().unwrap_or(self.default_timeout),
            expected_duration: provider.expected_duration(),
            provider,
            running: 0,
            last_dispatch: None,
            batch,
        };
        self.batch_order.push(slot.batch.id);
        self.batches.insert(slot.batch.id, slot);
        Ok(ids)
    }

    fn push_pending(&mut self, task: &mut Task) {
        self.next_seq += 1;
        task.queue_seq = self.next_seq;
        self.heap.push(QueueEntry {
            priority: task.priority,
            seq: task.queue_seq,
            task_id: task.id,
        });
    }

    /// Upper bound on concurrently running tasks across all batches.
    fn global_cap(&self) -> usize {
        if let Some(cap) = self.global_max_concurrent {
            return cap.max(1);
        }
        self.batches
            .values()
            .filter(|slot| {
                slot.running > 0
                    || slot
                        .batch
                        .tasks
                        .iter()
                        .any(|id| self.tasks.get(id).is_some_and(|t| t.status.is_pending()))
            })
            .map(|slot| slot.batch.max_parallel)
            .max()
            .unwrap_or(1)
    }

    /// Pop the best admissible pending task and mark it `Running`.
    ///
    /// Entries skipped because their batch is held back are pushed back with
    /// their original sequence numbers, so FIFO order is untouched.
    pub fn next_dispatch(&mut self, now: Instant) -> Result<Option<Dispatch>, BatchError> {
        let global_cap = self.global_cap();
        let mut skipped = Vec::new();
        let mut selected = None;

        while let Some(entry) = self.heap.pop() {
            let Some(task) = self.tasks.get(&entry.task_id) else {
                continue;
            };
            if task.queue_seq != entry.seq || !task.status.is_dispatchable() {
                continue;
            }
            let Some(slot) = self.batches.get(&task.batch_id) else {
                continue;
            };
            // A batch with nothing running always gets one slot
            let over_global = self.global_running >= global_cap && slot.running > 0;
            if slot.held_back(now) || over_global {
                skipped.push(entry);
                continue;
            }
            selected = Some(entry);
            break;
        }
        self.heap.extend(skipped);

        match selected {
            Some(entry) => self.start_task(entry.task_id, now).map(Some),
            None => Ok(None),
        }
    }

    fn start_task(&mut self, task_id: TaskId, now: Instant) -> Result<Dispatch, BatchError> {
        let started_at = self.clock.wall(now);
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(BatchError::TaskNotFound(task_id))?;
        let slot = self
            .batches
            .get_mut(&task.batch_id)
            .ok_or(BatchError::BatchNotFound(task.batch_id))?;

        if slot.running >= slot.batch.max_parallel {
            return Err(BatchError::ConcurrencyExceeded {
                batch_id: slot.batch.id,
                running: slot.running,
                limit: slot.batch.max_parallel,
            });
        }

        task.transition(TaskStatus::Running)?;
        task.timestamps.started_at = Some(started_at);
        task.attempt_started = Some(now);
        if let Some(since) = task.queued_since.take() {
            task.performance_metrics.queue_time_ms +=
                now.saturating_duration_since(since).as_millis() as u64;
        }
        task.performance_metrics.api_calls_count += 1;

        slot.running += 1;
        slot.last_dispatch = Some(now);
        self.global_running += 1;
        self.next_attempt += 1;
        self.in_flight.insert(task_id, self.next_attempt);

        Ok(Dispatch {
            task_id,
            batch_id: task.batch_id,
            attempt: self.next_attempt,
            prompt: task.request.full_prompt(),
            options: task.request.generation_options(),
            provider: Arc::clone(&slot.provider),
            timeout: slot.timeout,
            retry_count: task.retry_count,
        })
    }

    /// Apply the outcome of a provider call.
    pub fn complete_task(
        &mut self,
        task_id: TaskId,
        attempt: u64,
        outcome: Result<ImageData, ProviderError>,
        elapsed: Duration,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Result<Completion, BatchError> {
        if self.in_flight.get(&task_id) != Some(&attempt) {
            return Ok(Completion::Stale);
        }
        self.in_flight.remove(&task_id);
        self.global_running = self.global_running.saturating_sub(1);

        let finished_at = self.clock.wall(now);
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(BatchError::TaskNotFound(task_id))?;
        let batch_id = task.batch_id;
        let slot = self
            .batches
            .get_mut(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        slot.running = slot.running.saturating_sub(1);
        task.attempt_started = None;
        task.performance_metrics.execution_time_ms += elapsed.as_millis() as u64;

        if task.cancel_requested || slot.batch.cancelled {
            task.transition(TaskStatus::Cancelled)?;
            task.timestamps.completed_at = Some(finished_at);
            return Ok(Completion::Cancelled { batch_id });
        }

        match outcome {
            Ok(image) => {
                task.advance_progress(100);
                task.performance_metrics.total_cost += image.cost;
                task.performance_metrics.memory_usage_mb = image.size_mb();
                task.transition(TaskStatus::Completed)?;
                task.timestamps.completed_at = Some(finished_at);
                task.failure_class = None;
                let cost = image.cost;
                self.images.insert(task_id, image);
                Ok(Completion::Completed { batch_id, cost })
            }
            Err(error) => {
                let class = RetryPolicy::classify(&error);
                let message = error.to_string();
                let timed_out = matches!(error, ProviderError::Timeout(_));

                if policy.automatic
                    && class == FailureClass::Retryable
                    && policy.has_retries_left(task.retry_count)
                {
                    task.transition(TaskStatus::Retrying)?;
                    task.failure_class = Some(class);
                    task.retry_count += 1;
                    let delay = policy.delay_for(task.retry_count);
                    let retry_count = task.retry_count;
                    self.delayed.push((now + delay, task_id));
                    return Ok(Completion::Retrying {
                        batch_id,
                        retry_count,
                        delay,
                        error: message,
                    });
                }

                let status = if timed_out {
                    TaskStatus::Timeout
                } else {
                    TaskStatus::Failed
                };
                task.fail(status, class, message.clone())?;
                task.timestamps.completed_at = Some(finished_at);
                if timed_out {
                    Ok(Completion::TimedOut {
                        batch_id,
                        error: message,
                    })
                } else {
                    Ok(Completion::Failed {
                        batch_id,
                        class,
                        error: message,
                    })
                }
            }
        }
    }

    /// Move retrying tasks whose delay has elapsed back to `Queued`.
    pub fn promote_due_retries(&mut self, now: Instant) -> Result<Vec<(TaskId, BatchId)>, BatchError> {
        let (due, later): (Vec<_>, Vec<_>) = self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = later;

        let mut promoted = Vec::new();
        for (_, task_id) in due {
            let Some(mut task) = self.tasks.remove(&task_id) else {
                continue;
            };
            if task.status == TaskStatus::Retrying {
                task.transition(TaskStatus::Queued)?;
                task.progress = 0;
                task.queued_since = Some(now);
                self.push_pending(&mut task);
                promoted.push((task_id, task.batch_id));
            }
            self.tasks.insert(task_id, task);
        }
        Ok(promoted)
    }

    /// Flip pending tasks between `Queued` and `Waiting` to reflect whether
    /// their batch could take them right now.
    pub fn refresh_waiting(&mut self, now: Instant) -> Result<(), BatchError> {
        for slot in self.batches.values() {
            let held = slot.held_back(now);
            for id in &slot.batch.tasks {
                let Some(task) = self.tasks.get_mut(id) else {
                    continue;
                };
                match (task.status, held) {
                    (TaskStatus::Queued, true) => task.transition(TaskStatus::Waiting)?,
                    (TaskStatus::Waiting, false) => task.transition(TaskStatus::Queued)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Estimate progress of in-flight tasks from elapsed time. Returns true
    /// when any task's progress changed.
    pub fn advance_progress(&mut self, now: Instant) -> bool {
        let mut changed = false;
        for task_id in self.in_flight.keys() {
            let Some(task) = self.tasks.get_mut(task_id) else {
                continue;
            };
            let (Some(started), Some(slot)) = (task.attempt_started, self.batches.get(&task.batch_id))
            else {
                continue;
            };
            let expected = slot.expected_duration.as_secs_f64().max(0.001);
            let elapsed = now.saturating_duration_since(started).as_secs_f64();
            let estimate = (elapsed / expected * 100.0).min(95.0) as u8;
            changed |= task.advance_progress(estimate);
        }
        changed
    }

    /// Earliest instant at which something becomes dispatchable without any
    /// other event: a retry delay expiring or a spacing window closing.
    pub fn next_wake(&self, now: Instant) -> Option<Instant> {
        let retries = self.delayed.iter().map(|(at, _)| *at);
        let spacing = self
            .batches
            .values()
            .filter(|slot| {
                slot.batch
                    .tasks
                    .iter()
                    .any(|id| self.tasks.get(id).is_some_and(|t| t.status.is_dispatchable()))
            })
            .filter_map(BatchSlot::spacing_ready_at);
        retries.chain(spacing).filter(|at| *at > now).min()
    }

    pub fn cancel_batch(
        &mut self,
        batch_id: BatchId,
        now: Instant,
    ) -> Result<CancelOutcome, BatchError> {
        let slot = self
            .batches
            .get_mut(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        let mut outcome = CancelOutcome::default();
        let unsettled = slot
            .batch
            .tasks
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .any(|t| !t.status.is_terminal());
        if !unsettled {
            // Settled batches keep their final state
            return Ok(outcome);
        }
        slot.batch.cancelled = true;
        slot.batch.paused = false;
        let cancelled_at = self.clock.wall(now);

        for id in &slot.batch.tasks {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            if task.status.is_pending() {
                task.transition(TaskStatus::Cancelled)?;
                task.timestamps.completed_at = Some(cancelled_at);
                outcome.cancelled.push(*id);
            } else if task.status == TaskStatus::Paused {
                task.transition(TaskStatus::Running)?;
                task.cancel_requested = true;
                outcome.deferred.push(*id);
            } else if task.status.is_active() {
                task.cancel_requested = true;
                outcome.deferred.push(*id);
            }
        }
        Ok(outcome)
    }

    /// Requeue failed and timed-out tasks that the policy allows to retry.
    pub fn retry_failed(
        &mut self,
        batch_id: BatchId,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Result<RetryOutcome, BatchError> {
        let slot = self
            .batches
            .get(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        if slot.batch.cancelled {
            return Err(BatchError::Validation(format!(
                "{} was cancelled and cannot be retried",
                batch_id
            )));
        }

        let mut eligible = Vec::new();
        let mut left_failed = 0;
        for id in &slot.batch.tasks {
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            if !task.status.is_failure() {
                continue;
            }
            if policy.should_retry(task) {
                eligible.push(*id);
            } else {
                left_failed += 1;
            }
        }

        if self.pending_count() + eligible.len() > self.max_queue_size {
            return Err(BatchError::QueueFull {
                capacity: self.max_queue_size,
            });
        }

        for id in &eligible {
            let Some(mut task) = self.tasks.remove(id) else {
                continue;
            };
            let requeued = task.transition(TaskStatus::Queued);
            if requeued.is_ok() {
                task.retry_count += 1;
                task.progress = 0;
                task.queued_since = Some(now);
                self.push_pending(&mut task);
            }
            self.tasks.insert(*id, task);
            requeued?;
        }

        Ok(RetryOutcome {
            requeued: eligible,
            left_failed,
        })
    }

    /// Stop dispatching for the batch; in-flight tasks become `Paused`.
    pub fn pause(&mut self, batch_id: BatchId) -> Result<Vec<TaskId>, BatchError> {
        let slot = self
            .batches
            .get_mut(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        if slot.batch.cancelled {
            return Err(BatchError::Validation(format!(
                "{} was cancelled and cannot be paused",
                batch_id
            )));
        }
        slot.batch.paused = true;

        let mut paused = Vec::new();
        for id in &slot.batch.tasks {
            if let Some(task) = self.tasks.get_mut(id) {
                if task.status == TaskStatus::Running {
                    task.transition(TaskStatus::Paused)?;
                    paused.push(*id);
                }
            }
        }
        Ok(paused)
    }

    pub fn resume(&mut self, batch_id: BatchId) -> Result<Vec<TaskId>, BatchError> {
        let slot = self
            .batches
            .get_mut(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        slot.batch.paused = false;

        let mut resumed = Vec::new();
        for id in &slot.batch.tasks {
            if let Some(task) = self.tasks.get_mut(id) {
                if task.status == TaskStatus::Paused {
                    task.transition(TaskStatus::Running)?;
                    resumed.push(*id);
                }
            }
        }
        Ok(resumed)
    }

    fn batch_tasks(&self, batch: &Batch) -> Vec<&Task> {
        batch
            .tasks
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    pub fn report(&self, batch_id: BatchId) -> Result<BatchStatusReport, BatchError> {
        let slot = self
            .batches
            .get(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        Ok(status::aggregate(&slot.batch, &self.batch_tasks(&slot.batch)))
    }

    pub fn state(&self, batch_id: BatchId) -> Result<BatchState, BatchError> {
        let slot = self
            .batches
            .get(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        Ok(BatchState::derive(&slot.batch, &self.batch_tasks(&slot.batch)))
    }

    /// Summaries of every batch, in submission order.
    pub fn summaries(&self) -> Vec<BatchSummary> {
        self.batch_order
            .iter()
            .filter_map(|id| self.batches.get(id))
            .map(|slot| {
                let tasks = self.batch_tasks(&slot.batch);
                let report = status::aggregate(&slot.batch, &tasks);
                BatchSummary {
                    id: slot.batch.id,
                    name: slot.batch.name.clone(),
                    description: slot.batch.description.clone(),
                    priority: slot.batch.priority,
                    max_parallel: slot.batch.max_parallel,
                    provider: slot.batch.provider.clone(),
                    created_at: slot.batch.created_at,
                    state: report.state,
                    total_tasks: report.total_tasks,
                    completed_tasks: report.completed_tasks,
                    overall_progress: report.overall_progress,
                }
            })
            .collect()
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    pub fn tasks_of(&self, batch_id: BatchId) -> Result<Vec<Task>, BatchError> {
        let slot = self
            .batches
            .get(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        Ok(self.batch_tasks(&slot.batch).into_iter().cloned().collect())
    }

    pub fn take_image(&mut self, task_id: TaskId) -> Option<ImageData> {
        self.images.remove(&task_id)
    }

    /// Remove a settled batch, its tasks and any images not yet taken.
    pub fn purge(&mut self, batch_id: BatchId) -> Result<Batch, BatchError> {
        if !self.state(batch_id)?.is_settled() {
            return Err(BatchError::Validation(format!(
                "{} still has pending or running tasks",
                batch_id
            )));
        }
        let slot = self
            .batches
            .remove(&batch_id)
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        for id in &slot.batch.tasks {
            self.tasks.remove(id);
            self.images.remove(id);
        }
        self.delayed.retain(|(_, id)| !slot.batch.tasks.contains(id));
        self.batch_order.retain(|id| *id != batch_id);
        Ok(slot.batch)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.values().filter(|t| t.status.is_pending()).count()
    }

    /// Running tasks per batch, as counted by the admission state.
    pub fn running_in(&self, batch_id: BatchId) -> usize {
        self.batches.get(&batch_id).map_or(0, |slot| slot.running)
    }
}
