//! Storyboard: Batch Illustration Orchestration
//!
//! Turns batches of scene descriptions into illustrations through pluggable
//! image providers. Batches are expanded into tasks that a single scheduler
//! loop dispatches by priority under per-batch and global concurrency caps,
//! with timeouts, retry classification, cancellation and status aggregation.

pub mod api;
pub mod batch;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod task;
pub mod telemetry;
pub mod types;

pub use api::{ApiResponse, IllustrationApi};
pub use batch::{BatchSpec, BatchState, BatchSummary};
pub use coordinator::BatchCoordinator;
pub use error::BatchError;
pub use status::BatchStatusReport;
pub use task::{IllustrationRequest, Priority, Task, TaskStatus};
pub use types::{BatchId, TaskId};
