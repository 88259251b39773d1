//! Deterministic in-process provider.
//!
//! Used for dry runs from the CLI and as the test double for scheduler and
//! coordinator tests: scripted failures, per-prompt latency, a call log, and
//! the peak number of concurrent calls it observed.

use crate::error::ProviderError;
use crate::provider::{GenerationOptions, ImageData, ImageProvider, ProviderConfig, ProviderTuning};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Prompts kept in the call log; older entries are dropped.
pub const CALL_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Behavior {
    Fail(ProviderError),
    Hang,
    Latency(Duration),
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    behavior: Behavior,
    /// Remaining applications; `None` applies forever
    remaining: Option<u32>,
}

pub struct SimulatedProvider {
    name: String,
    latency: Duration,
    cost_per_image: f64,
    tuning: ProviderTuning,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<VecDeque<String>>,
    call_count: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::from_millis(50),
            cost_per_image: 0.0,
            tuning: ProviderTuning {
                min_call_spacing: None,
                request_timeout: None,
                expected_duration: Duration::from_millis(50),
            },
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(VecDeque::new()),
            call_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn from_config(name: &str, config: &ProviderConfig) -> Self {
        let tuning = config.tuning();
        Self {
            latency: tuning.expected_duration,
            cost_per_image: config.cost_per_image,
            tuning,
            ..Self::new(name)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self.tuning.expected_duration = latency;
        self
    }

    pub fn with_cost(mut self, cost_per_image: f64) -> Self {
        self.cost_per_image = cost_per_image;
        self
    }

    pub fn with_min_call_spacing(mut self, spacing: Duration) -> Self {
        self.tuning.min_call_spacing = Some(spacing);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.tuning.request_timeout = Some(timeout);
        self
    }

    /// Fail every call whose prompt contains `needle`.
    pub fn fail_when(self, needle: &str, error: ProviderError) -> Self {
        self.push_rule(needle, Behavior::Fail(error), None)
    }

    /// Fail the first `times` calls whose prompt contains `needle`.
    pub fn fail_times(self, needle: &str, error: ProviderError, times: u32) -> Self {
        self.push_rule(needle, Behavior::Fail(error), Some(times))
    }

    /// Never return for prompts containing `needle`.
    pub fn hang_when(self, needle: &str) -> Self {
        self.push_rule(needle, Behavior::Hang, None)
    }

    /// Use a specific latency for prompts containing `needle`.
    pub fn latency_when(self, needle: &str, latency: Duration) -> Self {
        self.push_rule(needle, Behavior::Latency(latency), None)
    }

    fn push_rule(self, needle: &str, behavior: Behavior, remaining: Option<u32>) -> Self {
        self.rules.lock().push(Rule {
            needle: needle.to_string(),
            behavior,
            remaining,
        });
        self
    }

    /// Most recent prompts received, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().cloned().collect()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn record_call(&self, prompt: &str) {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut calls = self.calls.lock();
        if calls.len() == CALL_LOG_CAPACITY {
            calls.pop_front();
        }
        calls.push_back(prompt.to_string());
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn take_behavior(&self, prompt: &str) -> Option<Behavior> {
        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .find(|r| prompt.contains(&r.needle) && r.remaining != Some(0))?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.behavior.clone())
    }
}

#[async_trait]
impl ImageProvider for SimulatedProvider {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<ImageData, ProviderError> {
        self.record_call(prompt);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let latency = match self.take_behavior(prompt) {
            Some(Behavior::Fail(error)) => {
                tokio::time::sleep(self.latency).await;
                return Err(error);
            }
            Some(Behavior::Hang) => std::future::pending::<Duration>().await,
            Some(Behavior::Latency(latency)) => latency,
            None => self.latency,
        };
        tokio::time::sleep(latency).await;

        let (width, height) = options.aspect_ratio.dimensions();
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(format!("{}x{}:{}", width, height, prompt).as_bytes());
        Ok(ImageData {
            bytes,
            mime_type: "image/png".to_string(),
            cost: self.cost_per_image,
        })
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn min_call_spacing(&self) -> Option<Duration> {
        self.tuning.min_call_spacing
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.tuning.request_timeout
    }

    fn expected_duration(&self) -> Duration {
        self.tuning.expected_duration
    }
}
