//! Health endpoints: summary, readiness, liveness.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use binsight_core::breaker::BreakerState;

use crate::state::AppState;

/// `GET /api/v1/health` — service plus provider summary.
pub async fn summary(State(app): State<AppState>) -> Response {
    let kv_ok = app.kv.ping().await.is_ok();

    let mut providers = serde_json::Map::new();
    let mut any_open = false;
    for breaker in app.breakers.all() {
        let snapshot = breaker.snapshot().await;
        if snapshot.state == BreakerState::Open {
            any_open = true;
        }
        providers.insert(
            snapshot.provider.clone(),
            json!({
                "state": snapshot.state,
                "success_rate": snapshot.success_rate,
                "consecutive_failures": snapshot.consecutive_failures,
            }),
        );
    }

    let status = if !kv_ok {
        "unhealthy"
    } else if any_open {
        "degraded"
    } else {
        "healthy"
    };

    Json(json!({
        "status": status,
        "kv_store": if kv_ok { "connected" } else { "unreachable" },
        "providers": providers,
        "uptime_seconds": app.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

/// `GET /api/v1/health/ready` — 200 once the kv store answers.
pub async fn ready(State(app): State<AppState>) -> Response {
    match app.kv.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ready": true }))).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ready": false })),
            )
                .into_response()
        }
    }
}

/// `GET /api/v1/health/live` — always 200 while the process can answer.
pub async fn live() -> Response {
    (StatusCode::OK, Json(json!({ "alive": true }))).into_response()
}
