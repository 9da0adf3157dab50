use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use tracing::warn;

use crate::cli::ModelBackend;
use crate::error::ModelError;
use crate::raster::PageImage;

mod gemini;
mod ollama;
pub mod prompt;

#[cfg(test)]
pub(crate) mod mock;

pub use gemini::GeminiClient;
pub use ollama::OllamaClient;

/// A vision-capable model that turns one page image plus a prompt into text.
pub trait VisionModel: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, image: &PageImage, prompt: &str) -> Result<String, ModelError>;
}

/// Resolved connection settings for one backend.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub backend: ModelBackend,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

pub fn build_model(settings: &ModelSettings) -> Result<Box<dyn VisionModel>, ModelError> {
    match settings.backend {
        ModelBackend::Local => Ok(Box::new(OllamaClient::new(
            &settings.endpoint,
            &settings.model,
            settings.timeout_secs,
        )?)),
        ModelBackend::Hosted => {
            let api_key = settings
                .api_key
                .as_deref()
                .filter(|key| !key.trim().is_empty())
                .ok_or(ModelError::MissingApiKey)?;
            Ok(Box::new(GeminiClient::new(
                &settings.endpoint,
                &settings.model,
                api_key,
                settings.timeout_secs,
            )?))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    #[cfg(test)]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Exponential delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)))
    }
}

/// Calls the model, retrying transient failures up to `policy.max_retries`
/// times.
pub fn extract_with_retry(
    model: &dyn VisionModel,
    image: &PageImage,
    prompt: &str,
    policy: RetryPolicy,
) -> Result<String, ModelError> {
    let mut attempt = 0;
    loop {
        match model.extract(image, prompt) {
            Ok(text) => return Ok(text),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    model = %model.name(),
                    page = image.page_index,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "model call failed; retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn http_client(endpoint: &str, timeout_secs: u64) -> Result<Client, ModelError> {
    let mut builder = Client::builder().timeout(Duration::from_secs(timeout_secs));
    if is_loopback(endpoint) {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|err| ModelError::Client(err.to_string()))
}

fn is_loopback(endpoint: &str) -> bool {
    let host = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    host.starts_with("localhost") || host.starts_with("127.") || host.starts_with("[::1]")
}

fn map_transport_error(err: reqwest::Error, endpoint: &str, timeout_secs: u64) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_secs,
        }
    } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        ModelError::Unavailable {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    } else {
        ModelError::MalformedResponse(err.to_string())
    }
}

/// Reads the response body, turning non-2xx statuses into `ModelError::Status`.
fn read_body(response: Response, endpoint: &str, timeout_secs: u64) -> Result<String, ModelError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| map_transport_error(err, endpoint, timeout_secs))?;

    if !status.is_success() {
        return Err(ModelError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(body)
}
