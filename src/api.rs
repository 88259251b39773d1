//! Illustration API
//!
//! The in-process surface consumed by presentation layers. Every operation
//! returns an [`ApiResponse`] envelope; no error crosses this boundary.

use crate::batch::{BatchSpec, BatchSummary};
use crate::coordinator::BatchCoordinator;
use crate::error::BatchError;
use crate::status::BatchStatusReport;
use crate::task::{IllustrationRequest, Priority};
use crate::types::BatchId;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

const INTERNAL_ERROR: &str = "internal scheduler error";

/// `{success, data | message}` result envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    fn from_result(operation: &str, result: Result<T, BatchError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) if err.is_fatal() => {
                error!(operation, error = %err, "Internal scheduler invariant violated");
                Self::failure(INTERNAL_ERROR)
            }
            Err(err) => {
                warn!(operation, error = %err, "Request rejected");
                Self::failure(err.to_string())
            }
        }
    }
}

#[derive(Clone)]
pub struct IllustrationApi {
    coordinator: Arc<BatchCoordinator>,
}

impl IllustrationApi {
    pub fn new(coordinator: Arc<BatchCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    pub fn submit_batch(
        &self,
        name: &str,
        priority: Priority,
        requests: Vec<IllustrationRequest>,
        max_parallel: usize,
    ) -> ApiResponse<BatchId> {
        let spec = BatchSpec::new(name, requests)
            .with_priority(priority)
            .with_max_parallel(max_parallel);
        self.submit_spec(spec)
    }

    /// Submit a fully specified batch, e.g. one read from a batch file.
    pub fn submit_spec(&self, spec: BatchSpec) -> ApiResponse<BatchId> {
        ApiResponse::from_result("submit_batch", self.coordinator.submit(spec))
    }

    pub fn get_batch_status(&self, batch_id: BatchId) -> ApiResponse<BatchStatusReport> {
        ApiResponse::from_result("get_batch_status", self.coordinator.get_status(batch_id))
    }

    pub fn get_all_batches_summary(&self) -> ApiResponse<Vec<BatchSummary>> {
        ApiResponse::ok(self.coordinator.list_batches())
    }

    pub fn cancel_batch(&self, batch_id: BatchId) -> ApiResponse<()> {
        match self.coordinator.cancel(batch_id) {
            Ok(cancelled) => ApiResponse::ok_with_message(
                (),
                format!("Cancelled {} queued tasks of {}", cancelled, batch_id),
            ),
            Err(err) => ApiResponse::from_result("cancel_batch", Err(err)),
        }
    }

    pub fn retry_failed_tasks(&self, batch_id: BatchId) -> ApiResponse<()> {
        match self.coordinator.retry_failed_tasks(batch_id) {
            Ok(outcome) => ApiResponse::ok_with_message(
                (),
                format!(
                    "Requeued {} tasks of {}; {} left failed",
                    outcome.requeued.len(),
                    batch_id,
                    outcome.left_failed
                ),
            ),
            Err(err) => ApiResponse::from_result("retry_failed_tasks", Err(err)),
        }
    }
}
