//! Batch entity, submission spec and summary read-model.

use crate::error::BatchError;
use crate::task::{IllustrationRequest, Priority, Task, TaskStatus};
use crate::types::{BatchId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A batch submission: one logical unit of illustration requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Named provider; the registry default applies when absent
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub requests: Vec<IllustrationRequest>,
}

fn default_max_parallel() -> usize {
    2
}

impl BatchSpec {
    pub fn new(name: impl Into<String>, requests: Vec<IllustrationRequest>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority: Priority::default(),
            max_parallel: default_max_parallel(),
            provider: None,
            requests,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Reject the whole submission on the first problem found.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.requests.is_empty() {
            return Err(BatchError::Validation(
                "Batch must contain at least one request".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(BatchError::Validation(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if let Some(index) = self
            .requests
            .iter()
            .position(|r| r.prompt.trim().is_empty())
        {
            return Err(BatchError::Validation(format!(
                "Request {} has an empty prompt",
                index + 1
            )));
        }
        Ok(())
    }
}

/// Batch entity
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub description: String,
    /// Default priority for tasks without an override
    pub priority: Priority,
    pub max_parallel: usize,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    /// Task ids in submission order
    pub tasks: Vec<TaskId>,
    pub cancelled: bool,
    pub paused: bool,
}

impl Batch {
    pub(crate) fn from_spec(spec: &BatchSpec, provider: String) -> Self {
        Self {
            id: BatchId::next(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            priority: spec.priority,
            max_parallel: spec.max_parallel,
            provider,
            created_at: Utc::now(),
            tasks: Vec::with_capacity(spec.requests.len()),
            cancelled: false,
            paused: false,
        }
    }
}

/// Overall batch state derived from its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Running,
    Paused,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Queued => "queued",
            BatchState::Running => "running",
            BatchState::Paused => "paused",
            BatchState::Completed => "completed",
            BatchState::PartiallyFailed => "partially_failed",
            BatchState::Failed => "failed",
            BatchState::Cancelled => "cancelled",
        }
    }

    pub fn derive(batch: &Batch, tasks: &[&Task]) -> Self {
        let any = |pred: fn(TaskStatus) -> bool| tasks.iter().any(|t| pred(t.status));
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

        if any(TaskStatus::is_active) || any(TaskStatus::is_pending) {
            if batch.paused {
                BatchState::Paused
            } else if any(TaskStatus::is_active) || any(TaskStatus::is_terminal) {
                BatchState::Running
            } else {
                BatchState::Queued
            }
        } else if batch.cancelled {
            BatchState::Cancelled
        } else {
            let completed = count(TaskStatus::Completed);
            if completed == tasks.len() {
                BatchState::Completed
            } else if completed == 0 {
                BatchState::Failed
            } else {
                BatchState::PartiallyFailed
            }
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(
            self,
            BatchState::Completed
                | BatchState::PartiallyFailed
                | BatchState::Failed
                | BatchState::Cancelled
        )
    }
}

/// Batch row returned by the summary listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub id: BatchId,
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub max_parallel: usize,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub state: BatchState,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub overall_progress: f64,
}
