//! Scheduler events: schema and in-process bus.
//!
//! Every lifecycle change is published as a sequenced [`SchedulerEvent`].
//! Subscribers that fall behind lose the oldest events; the bus never blocks
//! the scheduler.

use crate::types::{BatchId, TaskId};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 1024;

pub const TASK_ENQUEUED: &str = "task_enqueued";
pub const TASK_DISPATCHED: &str = "task_dispatched";
pub const TASK_COMPLETED: &str = "task_completed";
pub const TASK_FAILED: &str = "task_failed";
pub const TASK_RETRYING: &str = "task_retrying";
pub const TASK_REQUEUED: &str = "task_requeued";
pub const TASK_TIMED_OUT: &str = "task_timed_out";
pub const TASK_CANCELLED: &str = "task_cancelled";
pub const TASK_PAUSED: &str = "task_paused";
pub const TASK_RESUMED: &str = "task_resumed";
pub const BATCH_SUBMITTED: &str = "batch_submitted";
pub const BATCH_CANCELLED: &str = "batch_cancelled";
pub const BATCH_PURGED: &str = "batch_purged";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub seq: u64,
    pub ts: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEventData {
    pub batch_id: BatchId,
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskEventData {
    pub fn new(batch_id: BatchId, task_id: TaskId) -> Self {
        Self {
            batch_id,
            task_id,
            retry_count: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEventData {
    pub batch_id: BatchId,
    pub name: String,
    pub total_tasks: usize,
    pub provider: String,
}

/// Broadcast bus for scheduler events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
    seq: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: &T) {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(err) => {
                debug!(event_type, error = %err, "Dropping unserializable event payload");
                return;
            }
        };
        let event = SchedulerEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event_type: event_type.to_string(),
            data,
        };
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}
