//! OpenAI-compatible adapter against a mock HTTP server: response parsing,
//! usage accounting and error classification.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use binsight_core::config::ProviderSettings;
use binsight_core::model::{FunctionInfo, TranslationDetail};
use binsight_core::providers::{LlmProvider, OpenAiProvider, ProviderError};

fn settings(endpoint: &str) -> ProviderSettings {
    ProviderSettings {
        api_key: Some("ak-test-key".into()),
        model: "gpt-4o-mini".into(),
        endpoint: Some(endpoint.to_string()),
        temperature: 0.1,
        max_response_tokens: 512,
        request_timeout_secs: 5,
        concurrent_calls: 4,
        requests_per_minute: 60,
        tokens_per_minute: 40_000,
    }
}

fn sample_function() -> FunctionInfo {
    FunctionInfo {
        name: "sub_401000".into(),
        address: "0x401000".into(),
        size: 128,
        assembly: Some("push rbp\nmov rbp, rsp\nret".into()),
        calls_to: vec!["sym.imp.printf".into()],
        called_by: vec![],
        imports_used: vec!["printf".into()],
        string_refs: vec![],
    }
}

fn chat_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "choices": [
            {"index": 0, "message": {"role": "assistant", "content": content}}
        ],
        "usage": {"prompt_tokens": 321, "completion_tokens": 77, "total_tokens": 398}
    })
}

#[tokio::test]
async fn translates_a_function_and_reports_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer ak-test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(
            r#"{"summary": "Prints a greeting.", "behavior": "Calls printf once."}"#,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::new(reqwest::Client::new(), settings(&server.uri())).unwrap();
    let (narrative, usage) = provider
        .translate_function(&sample_function(), TranslationDetail::Standard)
        .await
        .unwrap();

    assert_eq!(narrative.summary, "Prints a greeting.");
    assert_eq!(narrative.behavior.as_deref(), Some("Calls printf once."));
    assert_eq!(usage.prompt, 321);
    assert_eq!(usage.response, 77);
    assert!(provider.estimate_cost(&usage) > 0.0);
}

#[tokio::test]
async fn rate_limit_maps_to_transient_error_with_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "17")
                .set_body_string(r#"{"error": {"message": "rate limit reached"}}"#),
        )
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::new(reqwest::Client::new(), settings(&server.uri())).unwrap();
    let error = provider
        .translate_function(&sample_function(), TranslationDetail::Brief)
        .await
        .unwrap_err();

    assert!(matches!(error, ProviderError::RateLimited { .. }));
    assert!(error.is_transient());
    let hint = error.retry_hint().expect("429 with Retry-After carries a hint");
    assert_eq!(hint.delay, std::time::Duration::from_secs(17));
}

#[tokio::test]
async fn auth_failures_are_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401).set_body_string(r#"{"error": {"message": "bad key"}}"#),
        )
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::new(reqwest::Client::new(), settings(&server.uri())).unwrap();
    let error = provider
        .translate_function(&sample_function(), TranslationDetail::Brief)
        .await
        .unwrap_err();

    assert!(matches!(error, ProviderError::Unauthorized { .. }));
    assert!(!error.is_transient());
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream busy"))
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::new(reqwest::Client::new(), settings(&server.uri())).unwrap();
    let error = provider
        .translate_function(&sample_function(), TranslationDetail::Brief)
        .await
        .unwrap_err();

    assert!(error.is_transient());
}

#[tokio::test]
async fn missing_model_maps_to_model_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_string(r#"{"error": {"message": "model does not exist"}}"#),
        )
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::new(reqwest::Client::new(), settings(&server.uri())).unwrap();
    let error = provider
        .translate_function(&sample_function(), TranslationDetail::Brief)
        .await
        .unwrap_err();

    assert!(matches!(error, ProviderError::ModelNotFound { .. }));
}

#[tokio::test]
async fn health_check_probes_the_models_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .and(header("authorization", "Bearer ak-test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::new(reqwest::Client::new(), settings(&server.uri())).unwrap();
    provider.health_check().await.unwrap();
}

#[tokio::test]
async fn plain_text_payload_still_yields_a_summary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(
            "This routine zeroes a buffer before use.",
        )))
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::new(reqwest::Client::new(), settings(&server.uri())).unwrap();
    let (narrative, _usage) = provider
        .translate_function(&sample_function(), TranslationDetail::Brief)
        .await
        .unwrap();

    assert_eq!(narrative.summary, "This routine zeroes a buffer before use.");
    assert!(narrative.behavior.is_none());
}

#[tokio::test]
async fn provider_without_key_fails_at_construction() {
    let mut s = settings("http://localhost:0");
    s.api_key = None;
    let result = OpenAiProvider::new(reqwest::Client::new(), s);
    assert!(matches!(result, Err(ProviderError::Unauthorized { .. })));
}
