//! Root, system info, metrics scrape and the route fallback.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn root() -> Response {
    Json(json!({
        "service": "binsight",
        "description": "binary decompilation and natural-language translation service",
        "api": "/api/v1",
        "docs": "/docs",
    }))
    .into_response()
}

/// `GET /docs` — a plain endpoint listing; full API docs live with the
/// deployment, not the binary.
pub async fn docs() -> Response {
    Json(json!({
        "endpoints": [
            { "method": "GET",    "path": "/api/v1/health" },
            { "method": "GET",    "path": "/api/v1/health/ready" },
            { "method": "GET",    "path": "/api/v1/health/live" },
            { "method": "GET",    "path": "/api/v1/system/info" },
            { "method": "POST",   "path": "/api/v1/decompile" },
            { "method": "GET",    "path": "/api/v1/decompile/test" },
            { "method": "GET",    "path": "/api/v1/decompile/{id}" },
            { "method": "DELETE", "path": "/api/v1/decompile/{id}" },
            { "method": "GET",    "path": "/api/v1/llm-providers" },
            { "method": "GET",    "path": "/api/v1/llm-providers/{id}" },
            { "method": "POST",   "path": "/api/v1/llm-providers/{id}/health-check" },
            { "method": "GET",    "path": "/metrics" },
        ]
    }))
    .into_response()
}

/// `GET /api/v1/system/info` — capabilities and limits.
pub async fn info(State(app): State<AppState>) -> Response {
    let limits = &app.settings.limits;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "supported_formats": ["pe", "elf", "macho"],
        "analysis_depths": ["basic", "standard", "comprehensive"],
        "translation_details": ["brief", "standard", "comprehensive"],
        "max_file_size_mib": limits.max_file_size_mib,
        "max_functions": limits.max_functions,
        "max_strings": limits.max_strings,
        "queue_ceiling": limits.queue_ceiling,
        "workers": app.settings.workers.count,
        "llm_providers": app
            .orchestrator
            .provider_ids()
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>(),
    }))
    .into_response()
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(app): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.metrics.scrape(),
    )
        .into_response()
}

pub async fn fallback() -> ApiError {
    ApiError::not_found("route")
}
