use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{VisionModel, http_client, map_transport_error, read_body};
use crate::error::ModelError;
use crate::raster::PageImage;

/// Hosted Gemini model, called through `models/{model}:generateContent`.
pub struct GeminiClient {
    endpoint: String,
    model: String,
    api_key: String,
    client: Client,
    timeout_secs: u64,
}

impl GeminiClient {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: &str,
        timeout_secs: u64,
    ) -> Result<Self, ModelError> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let client = http_client(&endpoint, timeout_secs)?;
        Ok(Self {
            endpoint,
            model: model.to_string(),
            api_key: api_key.to_string(),
            client,
            timeout_secs,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn candidate_text(response: GenerateResponse) -> Result<String, ModelError> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::MalformedResponse("response has no candidates".to_string()))?;

    let text: String = candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .collect();

    Ok(text)
}

impl VisionModel for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn extract(&self, image: &PageImage, prompt: &str) -> Result<String, ModelError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::Text { text: prompt },
                    Part::Inline {
                        inline_data: InlineData {
                            mime_type: image.mime_type.clone(),
                            data: image.base64(),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: "application/json",
            },
        };

        debug!(url = %url, page = image.page_index, bytes = image.data.len(), "calling gemini");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .map_err(|err| map_transport_error(err, &self.endpoint, self.timeout_secs))?;
        let body = read_body(response, &self.endpoint, self.timeout_secs)?;

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|err| ModelError::MalformedResponse(err.to_string()))?;
        candidate_text(parsed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::llm::mock::serve_once;

    #[test]
    fn joins_candidate_text_parts() {
        let (endpoint, server) = serve_once(
            200,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"{\"reference_number\":"},{"text":"\"REF1\"}"}]}}]}"#,
            Duration::ZERO,
        );
        let client = GeminiClient::new(&endpoint, "gemini-2.0-flash", "secret", 5).unwrap();
        let image = PageImage::new(0, "image/jpeg", b"jpeg".to_vec());

        let text = client.extract(&image, "extract").unwrap();
        assert_eq!(text, r#"{"reference_number":"REF1"}"#);

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /models/gemini-2.0-flash:generateContent"));
        assert!(request.to_ascii_lowercase().contains("x-goog-api-key: secret"));
        assert!(request.contains(r#""inlineData":{"mimeType":"image/jpeg""#));
        assert!(request.contains(r#""responseMimeType":"application/json""#));
    }

    #[test]
    fn empty_candidates_are_malformed() {
        let response: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(matches!(
            candidate_text(response),
            Err(ModelError::MalformedResponse(_))
        ));
    }

    #[test]
    fn rejected_key_surfaces_status() {
        let (endpoint, server) = serve_once(
            403,
            r#"{"error":{"code":403,"message":"API key not valid"}}"#,
            Duration::ZERO,
        );
        let client = GeminiClient::new(&endpoint, "gemini-2.0-flash", "bad", 5).unwrap();
        let image = PageImage::new(0, "image/png", vec![0]);

        let err = client.extract(&image, "extract").unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, ModelError::Status { status: 403, .. }));
        assert!(!err.is_transient());
    }
}
