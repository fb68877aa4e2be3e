//! Gemini `generateContent` backend for the analysis stage.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sync_core::{LlmBackend, LlmError};
use tracing::debug;

use crate::config::GeminiConfig;

const TEMPERATURE: f32 = 0.3;
const MAX_OUTPUT_TOKENS: u32 = 4096;

pub struct GeminiClient {
    client: Client,
    api_url: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
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
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Permanent(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

/// Invalid keys and unknown models will not fix themselves; quota and
/// server trouble will.
fn classify(status: StatusCode, detail: String) -> LlmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(detail),
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND => LlmError::Permanent(detail),
        _ => LlmError::Transient(detail),
    }
}

#[async_trait]
impl LlmBackend for GeminiClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        debug!("Calling {} with a {}-char prompt", model, prompt.chars().count());
        let request = GenerateRequest {
            contents: [Content { parts: [Part { text: prompt }] }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        };

        let response = self
            .client
            .post(format!("{}/models/{}:generateContent", self.api_url, model))
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Transient(format!("request to {model} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, format!("{model} returned {status}: {}", body.trim())));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(format!("failed to parse {model} response: {e}")))?;
        body.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| LlmError::Malformed(format!("{model} returned no text")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_statuses() {
        let c = |code: u16| classify(StatusCode::from_u16(code).unwrap(), String::new());
        assert!(matches!(c(429), LlmError::RateLimited(_)));
        assert!(matches!(c(400), LlmError::Permanent(_)));
        assert!(matches!(c(403), LlmError::Permanent(_)));
        assert!(matches!(c(404), LlmError::Permanent(_)));
        assert!(matches!(c(500), LlmError::Transient(_)));
        assert!(matches!(c(503), LlmError::Transient(_)));
    }
}
