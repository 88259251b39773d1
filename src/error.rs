//! Error types for the illustration batch orchestrator.

use crate::task::TaskStatus;
use crate::types::{BatchId, TaskId};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by an image provider adapter.
///
/// Variants are grouped by how the retry policy treats them; see
/// [`crate::retry::RetryPolicy::classify`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("Provider authentication failed: {0}")]
    Authentication(String),

    #[error("Prompt rejected by safety filter: {0}")]
    SafetyRejected(String),

    #[error("Malformed provider request: {0}")]
    InvalidRequest(String),

    #[error("Provider quota or billing limit reached: {0}")]
    QuotaExceeded(String),

    #[error("Provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider returned an unreadable response: {0}")]
    InvalidResponse(String),

    #[error("Provider call exceeded deadline of {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by the orchestrator core.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Concurrency limit exceeded for {batch_id}: {running} running, limit {limit}")]
    ConcurrencyExceeded {
        batch_id: BatchId,
        running: usize,
        limit: usize,
    },

    #[error("Invalid transition for {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Scheduler is not running")]
    SchedulerStopped,

    #[error("Scheduler needs a tokio runtime: {0}")]
    NoRuntime(String),

    #[error("Timed out after {0:?} waiting for batch to settle")]
    WaitTimeout(Duration),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl BatchError {
    /// Internal invariant violations that indicate a scheduler bug rather
    /// than a recoverable runtime condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BatchError::ConcurrencyExceeded { .. } | BatchError::InvalidTransition { .. }
        )
    }
}

impl From<config::ConfigError> for BatchError {
    fn from(err: config::ConfigError) -> Self {
        BatchError::ConfigError(err.to_string())
    }
}
