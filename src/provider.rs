//! Image Provider Abstraction
//!
//! Uniform interface over external image-generation services. Adapters hide
//! provider quirks (free vs. paid service, colour-mode prompt engineering,
//! aspect ratio, safety filtering) behind a single `generate` capability.
//! Adapters perform no retries and mutate no orchestrator state; the retry
//! policy and scheduler own those concerns.

use crate::config::StoryboardConfig;
use crate::error::{BatchError, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod clients;
pub mod prompt;
pub mod simulated;

pub use clients::{OpenAIImageClient, PollinationsClient};
pub use simulated::SimulatedProvider;

/// Output aspect ratio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "16:9")]
    Widescreen,
}

impl AspectRatio {
    /// Pixel dimensions (width, height) requested from providers.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Portrait => (768, 1024),
            AspectRatio::Landscape => (1024, 768),
            AspectRatio::Widescreen => (1344, 768),
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Landscape => "4:3",
            AspectRatio::Widescreen => "16:9",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Color,
    Monochrome,
}

/// Safety filter threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Strict,
    #[default]
    Moderate,
    Permissive,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub aspect_ratio: AspectRatio,
    pub color_mode: ColorMode,
    pub style_template: Option<String>,
    pub safety_level: SafetyLevel,
}

/// Generated image returned by a provider
#[derive(Clone, PartialEq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Provider-reported or configured cost of this call
    pub cost: f64,
}

impl ImageData {
    pub fn size_mb(&self) -> f64 {
        self.bytes.len() as f64 / (1024.0 * 1024.0)
    }

    /// File extension matching the MIME type.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("cost", &self.cost)
            .finish()
    }
}

/// Image provider trait
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generate one image for the prompt
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<ImageData, ProviderError>;

    /// Get the provider name
    fn provider_name(&self) -> &str;

    /// Minimum spacing between call starts within one batch
    fn min_call_spacing(&self) -> Option<Duration> {
        None
    }

    /// Per-call deadline; the scheduler default applies when `None`
    fn request_timeout(&self) -> Option<Duration> {
        None
    }

    /// Typical call duration, used to estimate progress of running tasks
    fn expected_duration(&self) -> Duration {
        Duration::from_secs(20)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Pollinations,
    OpenAI,
    Simulated,
}

impl ProviderType {
    pub fn slug(self) -> &'static str {
        match self {
            ProviderType::Pollinations => "pollinations",
            ProviderType::OpenAI => "openai",
            ProviderType::Simulated => "simulated",
        }
    }
}

/// Scheduling knobs shared by every adapter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderTuning {
    pub min_call_spacing: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub expected_duration: Duration,
}

/// Provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_type: ProviderType,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Cost charged per generated image
    #[serde(default)]
    pub cost_per_image: f64,
    #[serde(default)]
    pub min_call_spacing_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_expected_duration_secs")]
    pub expected_duration_secs: u64,
}

fn default_expected_duration_secs() -> u64 {
    20
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            provider_type,
            model: None,
            api_key: None,
            endpoint: None,
            cost_per_image: 0.0,
            min_call_spacing_ms: None,
            timeout_secs: None,
            expected_duration_secs: default_expected_duration_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err("Model name cannot be empty".to_string());
            }
        }
        if let Some(endpoint) = &self.endpoint {
            reqwest::Url::parse(endpoint)
                .map_err(|e| format!("Invalid endpoint URL '{}': {}", endpoint, e))?;
        }
        if self.cost_per_image < 0.0 || !self.cost_per_image.is_finite() {
            return Err("cost_per_image must be a non-negative number".to_string());
        }
        if self.timeout_secs == Some(0) {
            return Err("timeout_secs must be at least 1".to_string());
        }
        if self.provider_type == ProviderType::OpenAI
            && self.api_key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err("OpenAI provider requires an api_key".to_string());
        }
        Ok(())
    }

    pub fn tuning(&self) -> ProviderTuning {
        ProviderTuning {
            min_call_spacing: self.min_call_spacing_ms.map(Duration::from_millis),
            request_timeout: self.timeout_secs.map(Duration::from_secs),
            expected_duration: Duration::from_secs(self.expected_duration_secs.max(1)),
        }
    }
}

/// Provider factory for creating provider clients
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create_client(
        name: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ImageProvider>, BatchError> {
        config
            .validate()
            .map_err(|e| BatchError::ConfigError(format!("Provider '{}': {}", name, e)))?;
        let client: Arc<dyn ImageProvider> = match config.provider_type {
            ProviderType::Pollinations => Arc::new(PollinationsClient::new(name, config)?),
            ProviderType::OpenAI => Arc::new(OpenAIImageClient::new(name, config)?),
            ProviderType::Simulated => Arc::new(SimulatedProvider::from_config(name, config)),
        };
        Ok(client)
    }
}

/// Named, explicitly constructed provider adapters.
///
/// A batch may name its provider; otherwise the registry default is used.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ImageProvider>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider and select the configured default.
    pub fn from_config(config: &StoryboardConfig) -> Result<Self, BatchError> {
        let mut registry = Self::new();
        for (name, provider_config) in &config.providers {
            registry.register(name, ProviderFactory::create_client(name, provider_config)?);
        }
        registry.set_default(&config.default_provider)?;
        Ok(registry)
    }

    /// Register a provider. The first registered provider becomes the default.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ImageProvider>) {
        let name = name.into();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn ImageProvider>) -> Self {
        self.register(name, provider);
        self
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), BatchError> {
        if !self.providers.contains_key(name) {
            return Err(BatchError::ConfigError(format!(
                "Default provider '{}' is not configured",
                name
            )));
        }
        self.default_provider = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(name).cloned()
    }

    /// Resolve a requested provider name, falling back to the default.
    pub fn resolve(&self, name: Option<&str>) -> Result<(String, Arc<dyn ImageProvider>), BatchError> {
        let name = match name {
            Some(name) => name,
            None => self.default_provider.as_deref().ok_or_else(|| {
                BatchError::ConfigError("No image provider configured".to_string())
            })?,
        };
        let provider = self
            .get(name)
            .ok_or_else(|| BatchError::Validation(format!("Unknown provider '{}'", name)))?;
        Ok((name.to_string(), provider))
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
