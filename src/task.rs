//! Task entity and lifecycle state machine.
//!
//! A task is one illustration request plus its lifecycle state. Every status
//! belongs to exactly one [`TaskPhase`]; terminal statuses accept no further
//! transitions except the explicit failed-task requeue driven by the batch
//! coordinator.

use crate::error::BatchError;
use crate::provider::{AspectRatio, ColorMode, GenerationOptions, SafetyLevel};
use crate::retry::FailureClass;
use crate::types::{BatchId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

/// Priority level for illustration tasks
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
    Urgent = 4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
        Priority::Urgent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BatchError::Validation(format!("Unknown priority '{}'", s)))
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Waiting,
    Running,
    Paused,
    Retrying,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

/// Coarse grouping of statuses. Every task is in exactly one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Pending,
    Active,
    Terminal,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    pub fn phase(self) -> TaskPhase {
        match self {
            TaskStatus::Queued | TaskStatus::Waiting | TaskStatus::Retrying => TaskPhase::Pending,
            TaskStatus::Running | TaskStatus::Paused => TaskPhase::Active,
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Cancelled
            | TaskStatus::Timeout => TaskPhase::Terminal,
        }
    }

    pub fn is_pending(self) -> bool {
        self.phase() == TaskPhase::Pending
    }

    pub fn is_active(self) -> bool {
        self.phase() == TaskPhase::Active
    }

    pub fn is_terminal(self) -> bool {
        self.phase() == TaskPhase::Terminal
    }

    /// Statuses that sit in the dispatch queue.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Waiting)
    }

    /// Failed outcomes that the coordinator may requeue.
    pub fn is_failure(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Timeout)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Waiting)
                | (Waiting, Queued)
                | (Queued | Waiting, Running)
                | (Queued | Waiting | Retrying, Cancelled)
                | (Retrying, Queued)
                | (Running, Paused)
                | (Paused, Running)
                | (Running | Paused, Completed | Failed | Timeout | Retrying | Cancelled)
                | (Failed | Timeout, Queued)
        )
    }
}

/// Character referenced by an illustration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterReference {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One illustration to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IllustrationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub characters: Vec<CharacterReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub color_mode: ColorMode,
    #[serde(default)]
    pub safety_level: SafetyLevel,
    /// Overrides the batch priority when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl IllustrationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            characters: Vec::new(),
            style: None,
            aspect_ratio: AspectRatio::default(),
            color_mode: ColorMode::default(),
            safety_level: SafetyLevel::default(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_color_mode(mut self, color_mode: ColorMode) -> Self {
        self.color_mode = color_mode;
        self
    }

    pub fn with_character(mut self, id: impl Into<String>, description: Option<String>) -> Self {
        self.characters.push(CharacterReference {
            id: id.into(),
            description,
        });
        self
    }

    /// Scene prompt with referenced character descriptions folded in.
    pub fn full_prompt(&self) -> String {
        let described: Vec<&str> = self
            .characters
            .iter()
            .filter_map(|c| c.description.as_deref())
            .filter(|d| !d.trim().is_empty())
            .collect();
        if described.is_empty() {
            self.prompt.trim().to_string()
        } else {
            format!("{}. Characters: {}", self.prompt.trim(), described.join("; "))
        }
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            aspect_ratio: self.aspect_ratio,
            color_mode: self.color_mode,
            style_template: self.style.clone(),
            safety_level: self.safety_level,
        }
    }
}

/// Execution metrics accumulated across attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub queue_time_ms: u64,
    pub execution_time_ms: u64,
    pub memory_usage_mb: f64,
    pub api_calls_count: u32,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTimestamps {
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Illustration task
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub batch_id: BatchId,
    pub status: TaskStatus,
    pub priority: Priority,
    /// 0..=100
    pub progress: u8,
    pub request: IllustrationRequest,
    pub retry_count: u32,
    pub timestamps: TaskTimestamps,
    pub performance_metrics: PerformanceMetrics,
    /// Present only while the task is `Failed` or `Timeout`
    pub error_message: Option<String>,
    /// Classification of the most recent failure
    pub failure_class: Option<FailureClass>,
    #[serde(skip)]
    pub(crate) queue_seq: u64,
    #[serde(skip)]
    pub(crate) cancel_requested: bool,
    #[serde(skip)]
    pub(crate) queued_since: Option<Instant>,
    #[serde(skip)]
    pub(crate) attempt_started: Option<Instant>,
}

impl Task {
    pub(crate) fn new(
        batch_id: BatchId,
        request: IllustrationRequest,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::next(),
            batch_id,
            status: TaskStatus::Queued,
            priority,
            progress: 0,
            request,
            retry_count: 0,
            timestamps: TaskTimestamps {
                enqueued_at: now,
                started_at: None,
                completed_at: None,
            },
            performance_metrics: PerformanceMetrics::default(),
            error_message: None,
            failure_class: None,
            queue_seq: 0,
            cancel_requested: false,
            queued_since: None,
            attempt_started: None,
        }
    }

    /// Apply a status change, rejecting anything outside the transition table.
    pub(crate) fn transition(&mut self, next: TaskStatus) -> Result<(), BatchError> {
        if !self.status.can_transition_to(next) {
            return Err(BatchError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        if !next.is_failure() {
            self.error_message = None;
        }
        // The queue stamps completion time from its own clock
        if self.status.is_terminal() && !next.is_terminal() {
            self.timestamps.completed_at = None;
        }
        self.status = next;
        Ok(())
    }

    /// Record a failed outcome. `status` must be `Failed` or `Timeout`.
    pub(crate) fn fail(
        &mut self,
        status: TaskStatus,
        class: FailureClass,
        message: String,
    ) -> Result<(), BatchError> {
        self.transition(status)?;
        self.failure_class = Some(class);
        self.error_message = Some(message);
        Ok(())
    }

    /// Raise progress while the task is active. Never lowers it.
    /// Raise progress; returns true when the value moved.
    pub(crate) fn advance_progress(&mut self, progress: u8) -> bool {
        let before = self.progress;
        if self.status.is_active() {
            self.progress = self.progress.max(progress.min(100));
        }
        self.progress != before
    }
}
