//! Configuration
//!
//! Layered configuration for the scheduler, retry policy, providers and
//! logging. Sources, lowest precedence first: built-in defaults, the global
//! config file, an explicit file, then `STORYBOARD__SECTION__KEY`
//! environment variables.

use crate::error::BatchError;
use crate::logging::LoggingConfig;
use crate::retry::RetryBackoff;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub use crate::provider::{ProviderConfig, ProviderType};

mod sources;

pub use sources::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryboardConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Provider used by batches that do not name one
    #[serde(default = "default_provider_name")]
    pub default_provider: String,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_provider_name() -> String {
    "pollinations".to_string()
}

impl Default for StoryboardConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "pollinations".to_string(),
            ProviderConfig::new(ProviderType::Pollinations),
        );
        let mut simulated = ProviderConfig::new(ProviderType::Simulated);
        simulated.expected_duration_secs = 2;
        providers.insert("simulated".to_string(), simulated);
        Self {
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            default_provider: default_provider_name(),
            providers,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cap on running tasks across all batches. When unset, the largest
    /// `max_parallel` among active batches applies.
    pub global_max_concurrent: Option<usize>,
    /// Deadline for a provider call when the provider sets none
    pub task_timeout_secs: u64,
    /// Progress estimation tick
    pub tick_interval_ms: u64,
    /// Maximum number of pending tasks across all batches
    pub max_queue_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_max_concurrent: None,
            task_timeout_secs: 120,
            tick_interval_ms: 500,
            max_queue_size: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    fn validate(&self) -> Result<(), String> {
        if self.task_timeout_secs == 0 {
            return Err("task_timeout_secs must be greater than zero".to_string());
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than zero".to_string());
        }
        if self.global_max_concurrent == Some(0) {
            return Err("global_max_concurrent must be at least 1 when set".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: RetryBackoff,
    /// Requeue retryable failures without an explicit retry request
    pub automatic: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff: RetryBackoff::Linear,
            automatic: true,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Provider(String, String),
    Scheduler(String),
    DefaultProvider(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Provider(name, msg) => write!(f, "Provider '{}': {}", name, msg),
            ValidationError::Scheduler(msg) => write!(f, "Scheduler: {}", msg),
            ValidationError::DefaultProvider(name) => {
                write!(f, "Default provider '{}' is not configured", name)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl StoryboardConfig {
    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.providers[name].validate() {
                errors.push(ValidationError::Provider(name.clone(), e));
            }
        }
        if !self.providers.contains_key(&self.default_provider) {
            errors.push(ValidationError::DefaultProvider(
                self.default_provider.clone(),
            ));
        }
        if let Err(e) = self.scheduler.validate() {
            errors.push(ValidationError::Scheduler(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`StoryboardConfig`] from the layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, global file, optional explicit file, environment.
    pub fn load(explicit: Option<&Path>) -> Result<StoryboardConfig, BatchError> {
        let mut builder = sources::builder_with_defaults()?;
        builder = sources::add_global_file(builder);
        if let Some(path) = explicit {
            builder = sources::add_explicit_file(builder, path)?;
        }
        builder = sources::add_environment(builder);
        Self::finish(builder)
    }

    /// Defaults and a single file, ignoring global file and environment.
    pub fn load_from_file(path: &Path) -> Result<StoryboardConfig, BatchError> {
        let builder = sources::add_explicit_file(sources::builder_with_defaults()?, path)?;
        Self::finish(builder)
    }

    fn finish(builder: sources::Builder) -> Result<StoryboardConfig, BatchError> {
        let config: StoryboardConfig = builder.build()?.try_deserialize()?;
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            BatchError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        Ok(config)
    }
}
