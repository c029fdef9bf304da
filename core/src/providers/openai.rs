//! OpenAI-compatible chat completions adapter.
//!
//! Also covers self-hosted OpenAI-compatible deployments through the
//! configurable endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::prompts::RenderedPrompt;
use super::{map_provider_http_error, Completion, LlmProvider, ProviderError, ProviderId, TokenUsage};
use crate::config::ProviderSettings;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    settings: ProviderSettings,
}

impl OpenAiProvider {
    pub fn new(client: Client, settings: ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::Unauthorized {
                provider: ProviderId::OpenAi,
                message: "no API key configured".into(),
            })?;
        Ok(Self {
            client,
            api_key,
            settings,
        })
    }

    fn base_url(&self) -> &str {
        self.settings
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/')
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    fn endpoint(&self) -> Option<&str> {
        self.settings.endpoint.as_deref()
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
        let url = format!("{}/chat/completions", self.base_url());
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.settings.model,
                "messages": [
                    { "role": "system", "content": prompt.system },
                    { "role": "user", "content": prompt.user }
                ],
                "temperature": self.settings.temperature,
                "max_tokens": self.settings.max_response_tokens
            }))
            .send()
            .await
            .map_err(|err| ProviderError::NetworkTransient {
                provider: ProviderId::OpenAi,
                message: err.to_string(),
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = response
            .bytes()
            .await
            .map_err(|err| ProviderError::NetworkTransient {
                provider: ProviderId::OpenAi,
                message: err.to_string(),
            })?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body_bytes).into_owned();
            return Err(map_provider_http_error(
                ProviderId::OpenAi,
                &self.settings.model,
                status,
                &headers,
                body,
            ));
        }

        let parsed: ChatResponse =
            serde_json::from_slice(&body_bytes).map_err(|err| ProviderError::ServerTransient {
                provider: ProviderId::OpenAi,
                status: Some(status),
                message: err.to_string(),
            })?;

        let text = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.and_then(|message| message.content))
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: ProviderId::OpenAi,
                message: "response contained no message content".into(),
            })?;

        let usage = parsed
            .usage
            .map(|usage| TokenUsage {
                prompt: usage.prompt_tokens.unwrap_or(0),
                response: usage.completion_tokens.unwrap_or(0),
            })
            .unwrap_or_else(|| TokenUsage {
                prompt: super::approximate_tokens(&prompt.user),
                response: super::approximate_tokens(&text),
            });

        Ok(Completion { text, usage })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.base_url());
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| ProviderError::NetworkTransient {
                provider: ProviderId::OpenAi,
                message: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(map_provider_http_error(
            ProviderId::OpenAi,
            &self.settings.model,
            status,
            &headers,
            body,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}
