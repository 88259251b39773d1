//! Shared test utilities for integration tests
//!
//! Builds coordinators around a [`SimulatedProvider`] so scenarios can script
//! provider behavior and inspect the calls it received.

use std::sync::Arc;
use std::time::Duration;
use storyboard::config::SchedulerConfig;
use storyboard::provider::{ProviderRegistry, SimulatedProvider};
use storyboard::retry::RetryPolicy;
use storyboard::scheduler::Scheduler;
use storyboard::telemetry::EventBus;
use storyboard::{BatchCoordinator, IllustrationRequest};

pub const WAIT: Option<Duration> = Some(Duration::from_secs(600));

/// Coordinator with a single provider named "sim" and default settings.
pub fn coordinator(provider: Arc<SimulatedProvider>) -> BatchCoordinator {
    coordinator_with(provider, RetryPolicy::default(), SchedulerConfig::default())
}

pub fn coordinator_with(
    provider: Arc<SimulatedProvider>,
    policy: RetryPolicy,
    config: SchedulerConfig,
) -> BatchCoordinator {
    let registry = ProviderRegistry::new().with_provider("sim", provider);
    let scheduler = Scheduler::new(&config, policy, EventBus::default());
    BatchCoordinator::new(registry, scheduler)
}

/// Retry policy that only requeues on an explicit retry request.
pub fn manual_retries() -> RetryPolicy {
    RetryPolicy {
        automatic: false,
        ..RetryPolicy::default()
    }
}

pub fn requests(prompts: &[&str]) -> Vec<IllustrationRequest> {
    prompts.iter().map(|p| IllustrationRequest::new(*p)).collect()
}

/// Let the scheduler loop run without advancing past any provider latency.
pub async fn settle_loop() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
