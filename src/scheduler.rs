//! Scheduler
//!
//! A single event-driven loop that owns dispatch. It wakes on enqueue, on a
//! provider call returning, on a retry delay or rate-limit window expiring,
//! and on a progress tick. Provider calls run as spawned tasks bounded by a
//! per-task deadline; their results come back to the loop over a channel and
//! are applied under the queue lock.

use crate::config::SchedulerConfig;
use crate::error::{BatchError, ProviderError};
use crate::provider::ImageData;
use crate::queue::{Completion, Dispatch, TaskQueue};
use crate::retry::RetryPolicy;
use crate::telemetry::{self, EventBus, TaskEventData};
use crate::types::TaskId;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Result of one provider call, sent back to the loop
struct CallResult {
    task_id: TaskId,
    attempt: u64,
    outcome: Result<ImageData, ProviderError>,
    elapsed: Duration,
}

type Completions = mpsc::UnboundedReceiver<CallResult>;

struct Shared {
    queue: Mutex<TaskQueue>,
    notify: Notify,
    policy: RetryPolicy,
    events: EventBus,
    changes: watch::Sender<u64>,
    running: AtomicBool,
    tick_interval: Duration,
    completions_tx: mpsc::UnboundedSender<CallResult>,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    completions_rx: Mutex<Option<Completions>>,
    handle: Mutex<Option<JoinHandle<Completions>>>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, policy: RetryPolicy, events: EventBus) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(TaskQueue::new(config)),
                notify: Notify::new(),
                policy,
                events,
                changes,
                running: AtomicBool::new(false),
                tick_interval: config.tick_interval(),
                completions_tx,
            }),
            completions_rx: Mutex::new(Some(completions_rx)),
            handle: Mutex::new(None),
        }
    }

    /// Start the scheduler loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), BatchError> {
        let runtime =
            Handle::try_current().map_err(|err| BatchError::NoRuntime(err.to_string()))?;
        let Some(completions) = self.completions_rx.lock().take() else {
            // Already running
            return Ok(());
        };
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = runtime.spawn(async move { shared.run(completions).await });
        *self.handle.lock() = Some(handle);
        info!(tick_ms = self.shared.tick_interval.as_millis() as u64, "Started scheduler");
        Ok(())
    }

    /// Stop the loop. In-flight provider calls are abandoned; their results
    /// are applied if the scheduler is started again.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(completions) => *self.completions_rx.lock() = Some(completions),
                Err(err) => error!(error = %err, "Scheduler loop panicked"),
            }
        }
        self.shared.bump();
        info!("Stopped scheduler");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub(crate) fn queue(&self) -> MutexGuard<'_, TaskQueue> {
        self.shared.queue.lock()
    }

    /// Signal that queue state changed outside the loop.
    pub(crate) fn wake(&self) {
        self.shared.bump();
        self.shared.notify.notify_one();
    }

    /// Change counter bumped after every applied transition.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }
}

impl Shared {
    fn bump(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    async fn run(self: Arc<Self>, mut completions: Completions) -> Completions {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.schedule(Instant::now()) {
                if self.halt_on(&err) {
                    break;
                }
            }

            let now = Instant::now();
            let wake = self.queue.lock().next_wake(now);
            let deadline = wake.unwrap_or(now + IDLE_WAKE);

            tokio::select! {
                _ = self.notify.notified() => {}
                Some(result) = completions.recv() => {
                    if let Err(err) = self.apply(result) {
                        if self.halt_on(&err) {
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.queue.lock().advance_progress(Instant::now()) {
                        self.bump();
                    }
                }
                _ = sleep_until(deadline), if wake.is_some() => {}
            }
        }

        debug!("Scheduler loop exited");
        completions
    }

    /// Log a scheduling error; returns true when the loop must stop.
    fn halt_on(&self, err: &BatchError) -> bool {
        if err.is_fatal() {
            error!(error = %err, "Scheduler invariant violated, stopping");
            self.running.store(false, Ordering::SeqCst);
            self.bump();
            true
        } else {
            warn!(error = %err, "Scheduling step failed");
            false
        }
    }

    /// One scheduling round: promote due retries, dispatch everything
    /// admissible, then refresh Queued/Waiting.
    fn schedule(&self, now: Instant) -> Result<(), BatchError> {
        let mut dispatches = Vec::new();
        let promoted = {
            let mut queue = self.queue.lock();
            let promoted = queue.promote_due_retries(now)?;
            while let Some(dispatch) = queue.next_dispatch(now)? {
                dispatches.push(dispatch);
            }
            queue.refresh_waiting(now)?;
            promoted
        };

        for (task_id, batch_id) in &promoted {
            debug!(batch_id = %batch_id, task_id = %task_id, "Retry delay elapsed, task requeued");
            self.events
                .emit(telemetry::TASK_REQUEUED, &TaskEventData::new(*batch_id, *task_id));
        }
        let changed = !promoted.is_empty() || !dispatches.is_empty();
        for dispatch in dispatches {
            self.spawn_call(dispatch);
        }
        if changed {
            self.bump();
        }
        Ok(())
    }

    fn spawn_call(&self, dispatch: Dispatch) {
        debug!(
            batch_id = %dispatch.batch_id,
            task_id = %dispatch.task_id,
            provider = dispatch.provider.provider_name(),
            attempt = dispatch.retry_count + 1,
            timeout_ms = dispatch.timeout.as_millis() as u64,
            "Dispatching task"
        );
        self.events.emit(
            telemetry::TASK_DISPATCHED,
            &TaskEventData::new(dispatch.batch_id, dispatch.task_id)
                .with_retry_count(dispatch.retry_count),
        );

        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let call = dispatch.provider.generate(&dispatch.prompt, &dispatch.options);
            let outcome = match tokio::time::timeout(dispatch.timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout(dispatch.timeout)),
            };
            // The loop may have stopped; the result is then dropped
            let _ = tx.send(CallResult {
                task_id: dispatch.task_id,
                attempt: dispatch.attempt,
                outcome,
                elapsed: started.elapsed(),
            });
        });
    }

    fn apply(&self, result: CallResult) -> Result<(), BatchError> {
        let duration_ms = result.elapsed.as_millis() as u64;
        let completion = self.queue.lock().complete_task(
            result.task_id,
            result.attempt,
            result.outcome,
            result.elapsed,
            &self.policy,
            Instant::now(),
        )?;
        let task_id = result.task_id;

        match completion {
            Completion::Completed { batch_id, cost } => {
                info!(batch_id = %batch_id, task_id = %task_id, duration_ms, cost, "Task completed");
                self.events.emit(
                    telemetry::TASK_COMPLETED,
                    &TaskEventData::new(batch_id, task_id).with_duration_ms(duration_ms),
                );
            }
            Completion::Retrying {
                batch_id,
                retry_count,
                delay,
                error,
            } => {
                warn!(
                    batch_id = %batch_id,
                    task_id = %task_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task failed, retrying"
                );
                self.events.emit(
                    telemetry::TASK_RETRYING,
                    &TaskEventData::new(batch_id, task_id)
                        .with_retry_count(retry_count)
                        .with_duration_ms(duration_ms)
                        .with_error(error),
                );
            }
            Completion::Failed {
                batch_id,
                class,
                error,
            } => {
                error!(
                    batch_id = %batch_id,
                    task_id = %task_id,
                    class = ?class,
                    error = %error,
                    "Task failed"
                );
                self.events.emit(
                    telemetry::TASK_FAILED,
                    &TaskEventData::new(batch_id, task_id)
                        .with_duration_ms(duration_ms)
                        .with_error(error),
                );
            }
            Completion::TimedOut { batch_id, error } => {
                warn!(batch_id = %batch_id, task_id = %task_id, duration_ms, "Task timed out");
                self.events.emit(
                    telemetry::TASK_TIMED_OUT,
                    &TaskEventData::new(batch_id, task_id)
                        .with_duration_ms(duration_ms)
                        .with_error(error),
                );
            }
            Completion::Cancelled { batch_id } => {
                info!(batch_id = %batch_id, task_id = %task_id, "In-flight task cancelled, result discarded");
                self.events
                    .emit(telemetry::TASK_CANCELLED, &TaskEventData::new(batch_id, task_id));
            }
            Completion::Stale => {
                debug!(task_id = %task_id, attempt = result.attempt, "Discarding stale provider result");
                return Ok(());
            }
        }
        self.bump();
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}
