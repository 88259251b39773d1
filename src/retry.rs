//! Retry Policy
//!
//! Classifies provider failures as retryable or terminal and decides whether
//! and when a failed task goes back to the queue.

use crate::config::RetryConfig;
use crate::error::ProviderError;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether a failure may succeed if attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Terminal,
}

/// How the delay before a requeue grows with the attempt number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    Fixed,
    #[default]
    Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: RetryBackoff,
    /// Requeue retryable failures without waiting for an explicit retry request
    pub automatic: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(1000),
            backoff: RetryBackoff::Linear,
            automatic: true,
        }
    }
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            backoff: config.backoff,
            automatic: config.automatic,
        }
    }

    pub fn classify(error: &ProviderError) -> FailureClass {
        match error {
            ProviderError::Authentication(_)
            | ProviderError::SafetyRejected(_)
            | ProviderError::InvalidRequest(_)
            | ProviderError::QuotaExceeded(_) => FailureClass::Terminal,
            ProviderError::RateLimited(_)
            | ProviderError::Network(_)
            | ProviderError::Unavailable(_)
            | ProviderError::InvalidResponse(_)
            | ProviderError::Timeout(_) => FailureClass::Retryable,
        }
    }

    /// True when the task's last failure is retryable and it has retries left.
    pub fn should_retry(&self, task: &Task) -> bool {
        task.failure_class == Some(FailureClass::Retryable) && self.has_retries_left(task.retry_count)
    }

    pub fn has_retries_left(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay inserted before the `attempt`-th retry (1-based) is requeued.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            RetryBackoff::Fixed => self.base_delay,
            RetryBackoff::Linear => self.base_delay.saturating_mul(attempt.max(1)),
        }
    }
}
