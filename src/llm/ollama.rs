use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{VisionModel, http_client, map_transport_error, read_body};
use crate::error::ModelError;
use crate::raster::PageImage;

/// Local Ollama server, called through `/api/chat` with the page attached as
/// a base64 image.
pub struct OllamaClient {
    endpoint: String,
    model: String,
    client: Client,
    timeout_secs: u64,
}

impl OllamaClient {
    pub fn new(endpoint: &str, model: &str, timeout_secs: u64) -> Result<Self, ModelError> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let client = http_client(&endpoint, timeout_secs)?;
        Ok(Self {
            endpoint,
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    format: &'a str,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    images: Vec<String>,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl VisionModel for OllamaClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn extract(&self, image: &PageImage, prompt: &str) -> Result<String, ModelError> {
        let url = format!("{}/api/chat", self.endpoint);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
                images: vec![image.base64()],
            }],
            stream: false,
            format: "json",
            options: ChatOptions { temperature: 0.0 },
        };

        debug!(url = %url, page = image.page_index, bytes = image.data.len(), "calling ollama");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .map_err(|err| map_transport_error(err, &self.endpoint, self.timeout_secs))?;
        let body = read_body(response, &self.endpoint, self.timeout_secs)?;

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|err| ModelError::MalformedResponse(err.to_string()))?;
        Ok(parsed.message.content)
    }
}
