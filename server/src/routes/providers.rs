//! LLM provider listing, details and forced health probes.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;

use binsight_core::providers::{cost_rates, ProviderId};

use crate::error::ApiError;
use crate::state::AppState;

fn parse_provider(id: &str) -> Result<ProviderId, ApiError> {
    ProviderId::try_from(id).map_err(|message| ApiError::not_found(message))
}

/// `GET /api/v1/llm-providers` — configured providers with health state.
pub async fn list(State(app): State<AppState>) -> Response {
    let mut entries = Vec::new();
    for id in app.orchestrator.provider_ids() {
        let Some(provider) = app.orchestrator.provider(id) else {
            continue;
        };
        let breaker = app.breakers.get_or_create(id.as_str());
        let state = breaker.state().await;
        entries.push(json!({
            "id": id.as_str(),
            "name": id.label(),
            "model": provider.model(),
            "healthy": breaker.is_available().await,
            "circuit_state": state,
            "cost_per_1k_tokens": provider.cost_per_1k_tokens(),
        }));
    }
    Json(json!({ "providers": entries })).into_response()
}

/// `GET /api/v1/llm-providers/{id}` — details plus breaker snapshot.
pub async fn details(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let provider_id = parse_provider(&id)?;
    let provider = app
        .orchestrator
        .provider(provider_id)
        .ok_or_else(|| ApiError::not_found(format!("provider {id}")))?;

    let rates = cost_rates(provider_id);
    let snapshot = app
        .breakers
        .get_or_create(provider_id.as_str())
        .snapshot()
        .await;

    Ok(Json(json!({
        "id": provider_id.as_str(),
        "name": provider_id.label(),
        "model": provider.model(),
        "endpoint": provider.endpoint(),
        "temperature": provider.temperature(),
        "max_response_tokens": provider.max_response_tokens(),
        "concurrent_calls": provider.concurrent_calls(),
        "requests_per_minute": provider.requests_per_minute(),
        "tokens_per_minute": provider.tokens_per_minute(),
        "cost": {
            "per_1k_prompt_tokens_usd": rates.per_1k_prompt,
            "per_1k_response_tokens_usd": rates.per_1k_response,
            "blended_per_1k_usd": rates.blended_per_1k(),
        },
        "circuit": snapshot,
    }))
    .into_response())
}

/// `POST /api/v1/llm-providers/{id}/health-check` — run the probe now. A
/// healthy probe moves an open circuit to half-open.
pub async fn health_check(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let provider_id = parse_provider(&id)?;
    let provider = app
        .orchestrator
        .provider(provider_id)
        .ok_or_else(|| ApiError::not_found(format!("provider {id}")))?;

    let probe = tokio::time::timeout(Duration::from_secs(10), provider.health_check()).await;
    let (healthy, detail) = match probe {
        Ok(Ok(())) => (true, None),
        Ok(Err(err)) => (false, Some(err.to_string())),
        Err(_) => (false, Some("health check timed out".to_string())),
    };

    let breaker = app.breakers.get_or_create(provider_id.as_str());
    breaker.observe_probe(healthy).await;

    Ok(Json(json!({
        "provider": provider_id.as_str(),
        "healthy": healthy,
        "detail": detail,
        "circuit_state": breaker.state().await,
    }))
    .into_response())
}
