//! Anthropic messages API adapter.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::prompts::RenderedPrompt;
use super::{map_provider_http_error, Completion, LlmProvider, ProviderError, ProviderId, TokenUsage};
use crate::config::ProviderSettings;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    settings: ProviderSettings,
}

impl AnthropicProvider {
    pub fn new(client: Client, settings: ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::Unauthorized {
                provider: ProviderId::Anthropic,
                message: "no API key configured".into(),
            })?;
        Ok(Self {
            client,
            api_key,
            settings,
        })
    }

    async fn send_messages(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<(MessagesResponse, reqwest::StatusCode), ProviderError> {
        let response = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&serde_json::json!({
                "model": self.settings.model,
                "max_tokens": max_tokens,
                "system": system,
                "messages": [
                    { "role": "user", "content": user }
                ],
                "temperature": self.settings.temperature
            }))
            .send()
            .await
            .map_err(|err| ProviderError::NetworkTransient {
                provider: ProviderId::Anthropic,
                message: err.to_string(),
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = response
            .bytes()
            .await
            .map_err(|err| ProviderError::NetworkTransient {
                provider: ProviderId::Anthropic,
                message: err.to_string(),
            })?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body_bytes).into_owned();
            return Err(map_provider_http_error(
                ProviderId::Anthropic,
                &self.settings.model,
                status,
                &headers,
                body,
            ));
        }

        let parsed: MessagesResponse =
            serde_json::from_slice(&body_bytes).map_err(|err| ProviderError::ServerTransient {
                provider: ProviderId::Anthropic,
                status: Some(status),
                message: err.to_string(),
            })?;
        Ok((parsed, status))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
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
        let (parsed, _status) = self
            .send_messages(&prompt.system, &prompt.user, self.settings.max_response_tokens)
            .await?;

        let text = parsed
            .content
            .unwrap_or_default()
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: ProviderId::Anthropic,
                message: "response contained no text block".into(),
            })?;

        let usage = parsed
            .usage
            .map(|usage| TokenUsage {
                prompt: usage.input_tokens.unwrap_or(0),
                response: usage.output_tokens.unwrap_or(0),
            })
            .unwrap_or_else(|| TokenUsage {
                prompt: super::approximate_tokens(&prompt.user),
                response: super::approximate_tokens(&text),
            });

        Ok(Completion { text, usage })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        // Smallest possible round trip; confirms key, model, and service.
        self.send_messages("Reply with the single word: ok", "ok", 8)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Option<Vec<ContentBlock>>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}
