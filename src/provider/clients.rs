//! HTTP adapters for concrete image-generation services.

use crate::error::{BatchError, ProviderError};
use crate::provider::prompt::compose;
use crate::provider::{
    AspectRatio, GenerationOptions, ImageData, ImageProvider, ProviderConfig, ProviderTuning,
    SafetyLevel,
};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROVIDER_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

const POLLINATIONS_BASE_URL: &str = "https://image.pollinations.ai";
const POLLINATIONS_DEFAULT_MODEL: &str = "flux";
const POLLINATIONS_DEFAULT_SPACING: Duration = Duration::from_millis(1000);

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "dall-e-3";

fn build_provider_http_client() -> Result<Client, BatchError> {
    Client::builder()
        .no_proxy()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .timeout(PROVIDER_HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| BatchError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

// Helper function to map transport errors to ProviderError
fn map_http_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Network(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ProviderError::Network(format!("Connection error: {}", error))
    } else if let Some(status) = error.status() {
        map_status(status.as_u16(), error.to_string())
    } else {
        ProviderError::Network(format!("HTTP error: {}", error))
    }
}

/// Map an unsuccessful HTTP status to the provider error taxonomy.
pub(crate) fn map_status(status: u16, detail: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Authentication(detail),
        402 => ProviderError::QuotaExceeded(detail),
        429 => ProviderError::RateLimited(detail),
        451 => ProviderError::SafetyRejected(detail),
        400..=499 => ProviderError::InvalidRequest(format!("status {}: {}", status, detail)),
        _ => ProviderError::Unavailable(format!("status {}: {}", status, detail)),
    }
}

fn mime_from_headers(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "image/png".to_string())
}

async fn read_image(response: reqwest::Response, cost: f64) -> Result<ImageData, ProviderError> {
    let mime_type = mime_from_headers(&response);
    if !mime_type.starts_with("image/") {
        return Err(ProviderError::InvalidResponse(format!(
            "Expected image content, got '{}'",
            mime_type
        )));
    }
    let bytes = response.bytes().await.map_err(map_http_error)?;
    if bytes.is_empty() {
        return Err(ProviderError::InvalidResponse("Empty image body".to_string()));
    }
    Ok(ImageData {
        bytes: bytes.to_vec(),
        mime_type,
        cost,
    })
}

/// No-cost provider backed by the public Pollinations image endpoint.
///
/// The free service throttles aggressive callers, so calls within a batch
/// are spaced by at least one second unless configured otherwise.
pub struct PollinationsClient {
    client: Client,
    name: String,
    model: String,
    base_url: Url,
    cost_per_image: f64,
    tuning: ProviderTuning,
}

impl PollinationsClient {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, BatchError> {
        let base = config.endpoint.as_deref().unwrap_or(POLLINATIONS_BASE_URL);
        let base_url = Url::parse(base)
            .map_err(|e| BatchError::ConfigError(format!("Invalid endpoint '{}': {}", base, e)))?;
        let mut tuning = config.tuning();
        if tuning.min_call_spacing.is_none() {
            tuning.min_call_spacing = Some(POLLINATIONS_DEFAULT_SPACING);
        }
        Ok(Self {
            client: build_provider_http_client()?,
            name: name.to_string(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| POLLINATIONS_DEFAULT_MODEL.to_string()),
            base_url,
            cost_per_image: config.cost_per_image,
            tuning,
        })
    }

    pub(crate) fn request_url(&self, prompt: &str, options: &GenerationOptions) -> Result<Url, ProviderError> {
        let (width, height) = options.aspect_ratio.dimensions();
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::InvalidRequest("Endpoint cannot be a base URL".to_string()))?
            .pop_if_empty()
            .push("prompt")
            .push(prompt);
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string())
            .append_pair("model", &self.model)
            .append_pair("nologo", "true")
            .append_pair(
                "safe",
                if options.safety_level == SafetyLevel::Permissive {
                    "false"
                } else {
                    "true"
                },
            );
        Ok(url)
    }
}

#[async_trait]
impl ImageProvider for PollinationsClient {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<ImageData, ProviderError> {
        let full_prompt = compose(prompt, options);
        let url = self.request_url(&full_prompt, options)?;
        debug!(provider = %self.name, model = %self.model, "Requesting image");

        let response = self.client.get(url).send().await.map_err(map_http_error)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status.as_u16(), detail));
        }
        read_image(response, self.cost_per_image).await
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

// OpenAI image API request/response structures
#[derive(Serialize)]
struct ImageGenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'static str,
    response_format: &'static str,
}

#[derive(Deserialize)]
struct ImageGenerationResponse {
    data: Vec<GeneratedImage>,
}

#[derive(Deserialize)]
struct GeneratedImage {
    url: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: String,
}

/// Classify an OpenAI error body, falling back to the HTTP status.
pub(crate) fn classify_openai_error(status: u16, body: &str) -> ProviderError {
    let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) else {
        return map_status(status, body.to_string());
    };
    let error = envelope.error;
    let markers = [error.code.as_deref(), error.kind.as_deref()];
    let has = |needle: &str| markers.iter().flatten().any(|m| *m == needle);

    if has("content_policy_violation") {
        ProviderError::SafetyRejected(error.message)
    } else if has("insufficient_quota") || has("billing_hard_limit_reached") {
        ProviderError::QuotaExceeded(error.message)
    } else if has("invalid_api_key") {
        ProviderError::Authentication(error.message)
    } else {
        map_status(status, error.message)
    }
}

fn openai_size(aspect_ratio: AspectRatio) -> &'static str {
    match aspect_ratio {
        AspectRatio::Square => "1024x1024",
        AspectRatio::Portrait => "1024x1792",
        AspectRatio::Landscape | AspectRatio::Widescreen => "1792x1024",
    }
}

/// Paid, higher-quality provider using the OpenAI images API.
pub struct OpenAIImageClient {
    client: Client,
    name: String,
    model: String,
    api_key: String,
    base_url: String,
    cost_per_image: f64,
    tuning: ProviderTuning,
}

impl OpenAIImageClient {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, BatchError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            BatchError::ConfigError(format!("Provider '{}' requires an api_key", name))
        })?;
        Ok(Self {
            client: build_provider_http_client()?,
            name: name.to_string(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            api_key,
            base_url: config
                .endpoint
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            cost_per_image: config.cost_per_image,
            tuning: config.tuning(),
        })
    }
}

#[async_trait]
impl ImageProvider for OpenAIImageClient {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<ImageData, ProviderError> {
        let full_prompt = compose(prompt, options);
        let request = ImageGenerationRequest {
            model: &self.model,
            prompt: &full_prompt,
            n: 1,
            size: openai_size(options.aspect_ratio),
            response_format: "url",
        };

        let url = format!("{}/images/generations", self.base_url.trim_end_matches('/'));
        debug!(provider = %self.name, model = %self.model, "Requesting image");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_openai_error(status.as_u16(), &body));
        }

        let generation: ImageGenerationResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
        let image_url = generation
            .data
            .into_iter()
            .find_map(|image| image.url)
            .ok_or_else(|| ProviderError::InvalidResponse("No image in response".to_string()))?;

        let image = self
            .client
            .get(&image_url)
            .send()
            .await
            .map_err(map_http_error)?;
        if !image.status().is_success() {
            return Err(map_status(image.status().as_u16(), "Image download failed".to_string()));
        }
        read_image(image, self.cost_per_image).await
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
