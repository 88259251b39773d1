//! Batch Coordinator
//!
//! Accepts batch submissions, expands them into tasks and owns batch-level
//! lifecycle: cancel, retry of failed tasks, pause/resume and purge. Status
//! queries delegate to the status aggregator over the current task set.

use crate::batch::{Batch, BatchSpec, BatchSummary};
use crate::config::StoryboardConfig;
use crate::error::BatchError;
use crate::provider::{ImageData, ProviderRegistry};
use crate::queue::RetryOutcome;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::status::BatchStatusReport;
use crate::task::Task;
use crate::telemetry::{self, BatchEventData, EventBus, TaskEventData};
use crate::types::{BatchId, TaskId};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct BatchCoordinator {
    registry: ProviderRegistry,
    scheduler: Scheduler,
}

impl BatchCoordinator {
    pub fn new(registry: ProviderRegistry, scheduler: Scheduler) -> Self {
        Self {
            registry,
            scheduler,
        }
    }

    /// Build providers, retry policy and scheduler from configuration.
    pub fn from_config(config: &StoryboardConfig) -> Result<Self, BatchError> {
        let registry = ProviderRegistry::from_config(config)?;
        let scheduler = Scheduler::new(
            &config.scheduler,
            RetryPolicy::from_config(&config.retry),
            EventBus::default(),
        );
        Ok(Self::new(registry, scheduler))
    }

    /// Start the scheduler loop. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), BatchError> {
        self.scheduler.start()
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }

    pub fn events(&self) -> &EventBus {
        self.scheduler.events()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.scheduler.policy()
    }

    /// Validate and enqueue a batch. Either every task is enqueued or none.
    pub fn submit(&self, spec: BatchSpec) -> Result<BatchId, BatchError> {
        spec.validate()?;
        if !self.scheduler.is_running() {
            return Err(BatchError::SchedulerStopped);
        }
        let (provider_name, provider) = self.registry.resolve(spec.provider.as_deref())?;

        let batch = Batch::from_spec(&spec, provider_name.clone());
        let batch_id = batch.id;
        let total_tasks = spec.requests.len();
        let task_ids = self
            .scheduler
            .queue()
            .enqueue_batch(batch, provider, spec.requests, Instant::now())?;

        info!(
            batch_id = %batch_id,
            name = %spec.name,
            tasks = total_tasks,
            max_parallel = spec.max_parallel,
            priority = %spec.priority,
            provider = %provider_name,
            "Submitted batch"
        );
        let events = self.scheduler.events();
        events.emit(
            telemetry::BATCH_SUBMITTED,
            &BatchEventData {
                batch_id,
                name: spec.name,
                total_tasks,
                provider: provider_name,
            },
        );
        for task_id in task_ids {
            events.emit(telemetry::TASK_ENQUEUED, &TaskEventData::new(batch_id, task_id));
        }
        self.scheduler.wake();
        Ok(batch_id)
    }

    /// Cancel pending tasks now; in-flight tasks are cancelled when their
    /// provider call returns. Returns the number cancelled immediately.
    pub fn cancel(&self, batch_id: BatchId) -> Result<usize, BatchError> {
        let outcome = self.scheduler.queue().cancel_batch(batch_id, Instant::now())?;
        info!(
            batch_id = %batch_id,
            cancelled = outcome.cancelled.len(),
            in_flight = outcome.deferred.len(),
            "Cancelled batch"
        );
        let events = self.scheduler.events();
        for task_id in &outcome.cancelled {
            events.emit(telemetry::TASK_CANCELLED, &TaskEventData::new(batch_id, *task_id));
        }
        events.emit(
            telemetry::BATCH_CANCELLED,
            &serde_json::json!({
                "batch_id": batch_id,
                "cancelled": outcome.cancelled.len(),
                "in_flight": outcome.deferred.len(),
            }),
        );
        self.scheduler.wake();
        Ok(outcome.cancelled.len())
    }

    /// Requeue failed and timed-out tasks that are retryable and below the
    /// retry ceiling. Others stay failed and are reported as-is.
    pub fn retry_failed_tasks(&self, batch_id: BatchId) -> Result<RetryOutcome, BatchError> {
        let outcome = self.scheduler.queue().retry_failed(
            batch_id,
            self.scheduler.policy(),
            Instant::now(),
        )?;
        info!(
            batch_id = %batch_id,
            requeued = outcome.requeued.len(),
            left_failed = outcome.left_failed,
            "Retrying failed tasks"
        );
        for task_id in &outcome.requeued {
            self.scheduler
                .events()
                .emit(telemetry::TASK_REQUEUED, &TaskEventData::new(batch_id, *task_id));
        }
        self.scheduler.wake();
        Ok(outcome)
    }

    pub fn pause_batch(&self, batch_id: BatchId) -> Result<(), BatchError> {
        let paused = self.scheduler.queue().pause(batch_id)?;
        info!(batch_id = %batch_id, in_flight = paused.len(), "Paused batch");
        for task_id in paused {
            self.scheduler
                .events()
                .emit(telemetry::TASK_PAUSED, &TaskEventData::new(batch_id, task_id));
        }
        self.scheduler.wake();
        Ok(())
    }

    pub fn resume_batch(&self, batch_id: BatchId) -> Result<(), BatchError> {
        let resumed = self.scheduler.queue().resume(batch_id)?;
        info!(batch_id = %batch_id, in_flight = resumed.len(), "Resumed batch");
        for task_id in resumed {
            self.scheduler
                .events()
                .emit(telemetry::TASK_RESUMED, &TaskEventData::new(batch_id, task_id));
        }
        self.scheduler.wake();
        Ok(())
    }

    pub fn get_status(&self, batch_id: BatchId) -> Result<BatchStatusReport, BatchError> {
        self.scheduler.queue().report(batch_id)
    }

    pub fn list_batches(&self) -> Vec<BatchSummary> {
        self.scheduler.queue().summaries()
    }

    pub fn task(&self, task_id: TaskId) -> Result<Task, BatchError> {
        self.scheduler
            .queue()
            .task(task_id)
            .cloned()
            .ok_or(BatchError::TaskNotFound(task_id))
    }

    /// Tasks of a batch in submission order.
    pub fn tasks(&self, batch_id: BatchId) -> Result<Vec<Task>, BatchError> {
        self.scheduler.queue().tasks_of(batch_id)
    }

    /// Hand over the image of a completed task. Each image can be taken once.
    pub fn take_image(&self, task_id: TaskId) -> Option<ImageData> {
        self.scheduler.queue().take_image(task_id)
    }

    /// Resolve once no task of the batch is pending or active.
    pub async fn wait_for_batch(
        &self,
        batch_id: BatchId,
        timeout: Option<Duration>,
    ) -> Result<BatchStatusReport, BatchError> {
        let mut changes = self.scheduler.subscribe_changes();
        let wait = self.settled(batch_id, &mut changes);

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                warn!(batch_id = %batch_id, timeout_ms = limit.as_millis() as u64, "Timed out waiting for batch");
                BatchError::WaitTimeout(limit)
            })?,
            None => wait.await,
        }
    }

    async fn settled(
        &self,
        batch_id: BatchId,
        changes: &mut watch::Receiver<u64>,
    ) -> Result<BatchStatusReport, BatchError> {
        loop {
            let report = self.get_status(batch_id)?;
            if report.is_settled() {
                return Ok(report);
            }
            if !self.scheduler.is_running() || changes.changed().await.is_err() {
                return Err(BatchError::SchedulerStopped);
            }
        }
    }

    /// Remove a settled batch and its tasks.
    pub fn purge_batch(&self, batch_id: BatchId) -> Result<(), BatchError> {
        let batch = self.scheduler.queue().purge(batch_id)?;
        debug!(batch_id = %batch_id, tasks = batch.tasks.len(), "Purged batch");
        self.scheduler.events().emit(
            telemetry::BATCH_PURGED,
            &BatchEventData {
                batch_id,
                name: batch.name,
                total_tasks: batch.tasks.len(),
                provider: batch.provider,
            },
        );
        Ok(())
    }
}
