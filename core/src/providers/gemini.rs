//! Gemini generateContent adapter.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::prompts::RenderedPrompt;
use super::{map_provider_http_error, Completion, LlmProvider, ProviderError, ProviderId, TokenUsage};
use crate::config::ProviderSettings;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    settings: ProviderSettings,
}

impl GeminiProvider {
    pub fn new(client: Client, settings: ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::Unauthorized {
                provider: ProviderId::Gemini,
                message: "no API key configured".into(),
            })?;
        Ok(Self {
            client,
            api_key,
            settings,
        })
    }

    // Gemini addresses models as `models/<id>`.
    fn qualified_model(&self) -> String {
        let model = self.settings.model.trim();
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    fn temperature(&self) -> f32 {
        self.settings.temperature
    }

    fn concurrent_calls(&self) -> usize {
        self.settings.concurrent_calls
    }

    fn requests_per_minute(&self) -> u64 {
        self.settings.requests_per_minute
    }

    fn tokens_per_minute(&self) -> u64 {
        self.settings.tokens_per_minute
    }

    fn max_response_tokens(&self) -> u32 {
        self.settings.max_response_tokens
    }

    async fn complete(&self, prompt: &RenderedPrompt) -> Result<Completion, ProviderError> {
        let url = format!(
            "{BASE_URL}/{}:generateContent?key={}",
            self.qualified_model(),
            self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "systemInstruction": {
                    "parts": [{ "text": prompt.system }]
                },
                "contents": [
                    { "parts": [{ "text": prompt.user }] }
                ],
                "generationConfig": {
                    "temperature": self.settings.temperature,
                    "maxOutputTokens": self.settings.max_response_tokens
                }
            }))
            .send()
            .await
            .map_err(|err| ProviderError::NetworkTransient {
                provider: ProviderId::Gemini,
                message: err.to_string(),
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = response
            .bytes()
            .await
            .map_err(|err| ProviderError::NetworkTransient {
                provider: ProviderId::Gemini,
                message: err.to_string(),
            })?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body_bytes).into_owned();
            return Err(map_provider_http_error(
                ProviderId::Gemini,
                &self.settings.model,
                status,
                &headers,
                body,
            ));
        }

        let parsed: GenerateResponse =
            serde_json::from_slice(&body_bytes).map_err(|err| ProviderError::ServerTransient {
                provider: ProviderId::Gemini,
                status: Some(status),
                message: err.to_string(),
            })?;

        let text = parsed
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts)
            .and_then(|parts| parts.into_iter().next())
            .and_then(|part| part.text)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: ProviderId::Gemini,
                message: "response contained no candidate text".into(),
            })?;

        let usage = parsed
            .usage_metadata
            .map(|usage| TokenUsage {
                prompt: usage.prompt_token_count.unwrap_or(0),
                response: usage.candidates_token_count.unwrap_or(0),
            })
            .unwrap_or_else(|| TokenUsage {
                prompt: super::approximate_tokens(&prompt.user),
                response: super::approximate_tokens(&text),
            });

        Ok(Completion { text, usage })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{BASE_URL}/{}?key={}", self.qualified_model(), self.api_key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ProviderError::NetworkTransient {
                provider: ProviderId::Gemini,
                message: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(map_provider_http_error(
            ProviderId::Gemini,
            &self.settings.model,
            status,
            &headers,
            body,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}
