//! LLM provider abstraction.
//!
//! One `LlmProvider` trait carries the full capability set (translate
//! functions, explain imports, interpret strings, overall summary, health
//! check, token counting, cost estimation). Vendor-specific wire formats
//! live in the three adapter modules; everything above speaks typed values.

pub mod hints;
pub mod prompts;
pub mod retry;

mod anthropic;
mod gemini;
mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::model::{BinaryFormat, FunctionInfo, StringInfo, TranslationDetail};
use hints::{gemini_hints_from_body, hint_from_headers, RetryHint};
use prompts::{template_for, Operation, RenderedPrompt, TemplateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Gemini => "gemini",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OpenAI",
            ProviderId::Anthropic => "Anthropic",
            ProviderId::Gemini => "Gemini",
        }
    }

    pub fn all() -> [ProviderId; 3] {
        [ProviderId::OpenAi, ProviderId::Anthropic, ProviderId::Gemini]
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "openai" => Ok(ProviderId::OpenAi),
            "anthropic" => Ok(ProviderId::Anthropic),
            "gemini" => Ok(ProviderId::Gemini),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} rate limited: {message}")]
    RateLimited {
        provider: ProviderId,
        message: String,
        retry_hint: Option<RetryHint>,
    },
    #[error("{provider} network error: {message}")]
    NetworkTransient {
        provider: ProviderId,
        message: String,
    },
    #[error("{provider} server error ({status:?}): {message}")]
    ServerTransient {
        provider: ProviderId,
        status: Option<StatusCode>,
        message: String,
    },
    #[error("{provider} unauthorized: {message}")]
    Unauthorized {
        provider: ProviderId,
        message: String,
    },
    #[error("{provider} forbidden: {message}")]
    Forbidden {
        provider: ProviderId,
        message: String,
    },
    #[error("{provider} model unavailable: {model} ({message})")]
    ModelNotFound {
        provider: ProviderId,
        model: String,
        message: String,
    },
    #[error("{provider} returned an unusable response: {message}")]
    InvalidResponse {
        provider: ProviderId,
        message: String,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl ProviderError {
    /// Transient classes are worth another attempt; everything else fails
    /// the unit immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::NetworkTransient { .. }
                | ProviderError::ServerTransient { .. }
        )
    }

    pub fn retry_hint(&self) -> Option<&RetryHint> {
        match self {
            ProviderError::RateLimited { retry_hint, .. } => retry_hint.as_ref(),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ProviderError::ServerTransient { status, .. } => *status,
            _ => None,
        }
    }
}

/// Map a non-success HTTP response onto the error taxonomy. Shared by all
/// three adapters so classification stays uniform.
pub(crate) fn map_provider_http_error(
    provider: ProviderId,
    model: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: String,
) -> ProviderError {
    let gemini_hints = if provider == ProviderId::Gemini {
        gemini_hints_from_body(&body)
    } else {
        Default::default()
    };

    let retry_hint = hint_from_headers(headers).or(gemini_hints.retry_hint);

    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    };
    let lowered = message.to_ascii_lowercase();

    if status == StatusCode::TOO_MANY_REQUESTS || lowered.contains("rate limit") {
        return ProviderError::RateLimited {
            provider,
            message,
            retry_hint,
        };
    }

    if status == StatusCode::UNAUTHORIZED {
        return ProviderError::Unauthorized { provider, message };
    }

    if status == StatusCode::FORBIDDEN
        || gemini_hints.quota_exhausted
        || lowered.contains("insufficient_quota")
    {
        return ProviderError::Forbidden { provider, message };
    }

    if status == StatusCode::NOT_FOUND {
        return ProviderError::ModelNotFound {
            provider,
            model: model.to_string(),
            message,
        };
    }

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return ProviderError::ServerTransient {
            provider,
            status: Some(status),
            message,
        };
    }

    if status.is_client_error() {
        return ProviderError::Forbidden { provider, message };
    }

    ProviderError::ServerTransient {
        provider,
        status: Some(status),
        message,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt: u32,
    pub response: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt.saturating_add(self.response)
    }
}

/// Raw completion from a vendor API, before payload parsing.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Approximate token count: one token per ~4 characters, never less than
/// the word count. Close enough for budget gating across all three vendors.
pub fn approximate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let by_chars = (text.chars().count() as u32).div_ceil(4);
    let by_words = text.split_whitespace().count() as u32;
    by_chars.max(by_words).max(1)
}

/// USD per 1k tokens, split by direction. Approximations matching the
/// default models; surfaced through the provider detail endpoint so drift
/// is visible.
#[derive(Debug, Clone, Copy)]
pub struct CostRates {
    pub per_1k_prompt: f64,
    pub per_1k_response: f64,
}

impl CostRates {
    /// Single selection figure: prompt-heavy blend.
    pub fn blended_per_1k(&self) -> f64 {
        0.75 * self.per_1k_prompt + 0.25 * self.per_1k_response
    }
}

pub fn cost_rates(provider: ProviderId) -> CostRates {
    match provider {
        ProviderId::OpenAi => CostRates {
            per_1k_prompt: 0.000_15,
            per_1k_response: 0.000_60,
        },
        ProviderId::Anthropic => CostRates {
            per_1k_prompt: 0.000_80,
            per_1k_response: 0.004_00,
        },
        ProviderId::Gemini => CostRates {
            per_1k_prompt: 0.000_10,
            per_1k_response: 0.000_40,
        },
    }
}

/// Parsed function explanation.
#[derive(Debug, Clone)]
pub struct FunctionNarrative {
    pub summary: String,
    pub behavior: Option<String>,
}

/// Inputs for the overall summary, aggregated by the orchestrator.
#[derive(Debug, Clone)]
pub struct SummaryContext {
    pub format: BinaryFormat,
    pub platform: String,
    pub architecture: String,
    pub function_count: usize,
    pub notable_imports: Vec<String>,
    pub function_notes: Vec<String>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> ProviderId;
    fn model(&self) -> &str;
    fn endpoint(&self) -> Option<&str> {
        None
    }
    fn temperature(&self) -> f32;
    fn concurrent_calls(&self) -> usize;
    fn requests_per_minute(&self) -> u64;
    fn tokens_per_minute(&self) -> u64;
    fn max_response_tokens(&self) -> u32;

    /// One round trip to the vendor API.
    async fn complete(&self, prompt: &RenderedPrompt) -> Result<Completion, ProviderError>;

    /// Cheap availability check, used by the breaker probe and the health
    /// endpoints.
    async fn health_check(&self) -> Result<(), ProviderError>;

    fn count_tokens(&self, text: &str) -> u32 {
        approximate_tokens(text)
    }

    fn cost_per_1k_tokens(&self) -> f64 {
        cost_rates(self.id()).blended_per_1k()
    }

    fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        let rates = cost_rates(self.id());
        f64::from(usage.prompt) / 1000.0 * rates.per_1k_prompt
            + f64::from(usage.response) / 1000.0 * rates.per_1k_response
    }

    async fn translate_function(
        &self,
        function: &FunctionInfo,
        detail: TranslationDetail,
    ) -> Result<(FunctionNarrative, TokenUsage), ProviderError> {
        let mut vars: HashMap<&'static str, String> = HashMap::new();
        vars.insert("name", function.name.clone());
        vars.insert("address", function.address.clone());
        vars.insert("size", function.size.to_string());
        vars.insert(
            "assembly",
            function
                .assembly
                .clone()
                .unwrap_or_else(|| "(assembly unavailable)".into()),
        );
        if !function.calls_to.is_empty() {
            vars.insert("calls", function.calls_to.join(", "));
        }
        if !function.imports_used.is_empty() {
            vars.insert("imports", function.imports_used.join(", "));
        }

        let prompt = template_for(Operation::FunctionTranslation, detail).render(&vars)?;
        let completion = self.complete(&prompt).await?;
        let narrative = parse_function_payload(self.id(), &completion.text);
        Ok((narrative, completion.usage))
    }

    async fn explain_imports(
        &self,
        library: &str,
        functions: &[String],
        detail: TranslationDetail,
    ) -> Result<(String, TokenUsage), ProviderError> {
        let mut vars: HashMap<&'static str, String> = HashMap::new();
        vars.insert("library", library.to_string());
        vars.insert("functions", functions.join("\n"));

        let prompt = template_for(Operation::ImportExplanation, detail).render(&vars)?;
        let completion = self.complete(&prompt).await?;
        let explanation = parse_import_payload(&completion.text);
        Ok((explanation, completion.usage))
    }

    async fn interpret_strings(
        &self,
        format: BinaryFormat,
        strings: &[StringInfo],
        detail: TranslationDetail,
    ) -> Result<(Vec<Option<String>>, TokenUsage), ProviderError> {
        let listing = strings
            .iter()
            .enumerate()
            .map(|(index, s)| format!("{index}, {}, {:?}", s.address, s.value))
            .collect::<Vec<_>>()
            .join("\n");

        let mut vars: HashMap<&'static str, String> = HashMap::new();
        vars.insert("format", format.as_str().to_string());
        vars.insert("strings", listing);

        let prompt = template_for(Operation::StringInterpretation, detail).render(&vars)?;
        let completion = self.complete(&prompt).await?;
        let meanings = parse_strings_payload(self.id(), &completion.text, strings.len())?;
        Ok((meanings, completion.usage))
    }

    async fn generate_overall_summary(
        &self,
        context: &SummaryContext,
        detail: TranslationDetail,
    ) -> Result<(String, TokenUsage), ProviderError> {
        let mut vars: HashMap<&'static str, String> = HashMap::new();
        vars.insert("format", context.format.as_str().to_string());
        vars.insert("platform", context.platform.clone());
        vars.insert("architecture", context.architecture.clone());
        vars.insert("function_count", context.function_count.to_string());
        if !context.notable_imports.is_empty() {
            vars.insert("imports", context.notable_imports.join(", "));
        }
        if !context.function_notes.is_empty() {
            vars.insert("function_notes", context.function_notes.join("\n"));
        }

        let prompt = template_for(Operation::OverallSummary, detail).render(&vars)?;
        let completion = self.complete(&prompt).await?;
        let summary = parse_summary_payload(&completion.text);
        Ok((summary, completion.usage))
    }
}

// Models wrap JSON in markdown fences often enough that stripping them is
// table stakes.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[derive(Deserialize)]
struct FunctionPayload {
    summary: String,
    #[serde(default)]
    behavior: Option<String>,
}

fn parse_function_payload(provider: ProviderId, text: &str) -> FunctionNarrative {
    let cleaned = strip_code_fences(text);
    match serde_json::from_str::<FunctionPayload>(cleaned) {
        Ok(payload) => FunctionNarrative {
            summary: payload.summary,
            behavior: payload.behavior.filter(|b| !b.trim().is_empty()),
        },
        Err(err) => {
            tracing::debug!(provider = %provider, error = %err, "non-JSON function payload, using raw text");
            FunctionNarrative {
                summary: cleaned.to_string(),
                behavior: None,
            }
        }
    }
}

#[derive(Deserialize)]
struct ImportPayload {
    explanation: String,
}

fn parse_import_payload(text: &str) -> String {
    let cleaned = strip_code_fences(text);
    serde_json::from_str::<ImportPayload>(cleaned)
        .map(|payload| payload.explanation)
        .unwrap_or_else(|_| cleaned.to_string())
}

#[derive(Deserialize)]
struct StringsPayload {
    interpretations: Vec<StringEntry>,
}

#[derive(Deserialize)]
struct StringEntry {
    index: usize,
    meaning: String,
}

fn parse_strings_payload(
    provider: ProviderId,
    text: &str,
    expected: usize,
) -> Result<Vec<Option<String>>, ProviderError> {
    let cleaned = strip_code_fences(text);
    let payload: StringsPayload =
        serde_json::from_str(cleaned).map_err(|err| ProviderError::InvalidResponse {
            provider,
            message: format!("string interpretation payload did not parse: {err}"),
        })?;

    let mut meanings = vec![None; expected];
    for entry in payload.interpretations {
        if let Some(slot) = meanings.get_mut(entry.index) {
            *slot = Some(entry.meaning);
        }
    }
    Ok(meanings)
}

#[derive(Deserialize)]
struct SummaryPayload {
    summary: String,
}

fn parse_summary_payload(text: &str) -> String {
    let cleaned = strip_code_fences(text);
    serde_json::from_str::<SummaryPayload>(cleaned)
        .map(|payload| payload.summary)
        .unwrap_or_else(|_| cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_round_trip() {
        for id in ProviderId::all() {
            assert_eq!(ProviderId::try_from(id.as_str()).unwrap(), id);
        }
        assert!(ProviderId::try_from("grok").is_err());
    }

    #[test]
    fn http_mapping_classifies_statuses() {
        let headers = HeaderMap::new();
        let error = map_provider_http_error(
            ProviderId::OpenAi,
            "gpt-4o-mini",
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            "{}".into(),
        );
        assert!(matches!(error, ProviderError::RateLimited { .. }));
        assert!(error.is_transient());

        let error = map_provider_http_error(
            ProviderId::OpenAi,
            "gpt-4o-mini",
            StatusCode::UNAUTHORIZED,
            &headers,
            String::new(),
        );
        assert!(matches!(error, ProviderError::Unauthorized { .. }));
        assert!(!error.is_transient());

        let error = map_provider_http_error(
            ProviderId::Anthropic,
            "claude-x",
            StatusCode::NOT_FOUND,
            &headers,
            String::new(),
        );
        assert!(matches!(error, ProviderError::ModelNotFound { .. }));

        let error = map_provider_http_error(
            ProviderId::Gemini,
            "gemini-x",
            StatusCode::BAD_GATEWAY,
            &headers,
            String::new(),
        );
        assert!(error.is_transient());
    }

    #[test]
    fn rate_limit_picks_up_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "9".parse().unwrap());
        let error = map_provider_http_error(
            ProviderId::OpenAi,
            "gpt-4o-mini",
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            String::new(),
        );
        let hint = error.retry_hint().unwrap();
        assert_eq!(hint.delay, std::time::Duration::from_secs(9));
    }

    #[test]
    fn token_approximation_scales_with_length() {
        assert_eq!(approximate_tokens(""), 0);
        assert_eq!(approximate_tokens("word"), 1);
        let long = "a ".repeat(100);
        assert!(approximate_tokens(&long) >= 50);
    }

    #[test]
    fn function_payload_parses_and_falls_back() {
        let parsed = parse_function_payload(
            ProviderId::OpenAi,
            r#"{"summary": "Copies a buffer.", "behavior": "Loops over bytes."}"#,
        );
        assert_eq!(parsed.summary, "Copies a buffer.");
        assert_eq!(parsed.behavior.as_deref(), Some("Loops over bytes."));

        let fallback =
            parse_function_payload(ProviderId::OpenAi, "This function copies a buffer.");
        assert_eq!(fallback.summary, "This function copies a buffer.");
        assert!(fallback.behavior.is_none());
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let parsed = parse_function_payload(
            ProviderId::Gemini,
            "```json\n{\"summary\": \"Entry point.\"}\n```",
        );
        assert_eq!(parsed.summary, "Entry point.");
    }

    #[test]
    fn strings_payload_preserves_indices() {
        let meanings = parse_strings_payload(
            ProviderId::OpenAi,
            r#"{"interpretations": [
                {"index": 2, "meaning": "registry path"},
                {"index": 0, "meaning": "user-agent"}
            ]}"#,
            3,
        )
        .unwrap();
        assert_eq!(meanings[0].as_deref(), Some("user-agent"));
        assert!(meanings[1].is_none());
        assert_eq!(meanings[2].as_deref(), Some("registry path"));
    }

    #[test]
    fn strings_payload_requires_json() {
        let result = parse_strings_payload(ProviderId::OpenAi, "no json here", 2);
        assert!(matches!(
            result,
            Err(ProviderError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn cost_estimate_uses_direction_rates() {
        let rates = cost_rates(ProviderId::Gemini);
        assert!(rates.per_1k_prompt < rates.per_1k_response);
        assert!(
            cost_rates(ProviderId::Anthropic).blended_per_1k()
                > cost_rates(ProviderId::Gemini).blended_per_1k()
        );
    }
}
