//! Route table and router assembly.

pub mod admin;
pub mod decompile;
pub mod health;
pub mod providers;
pub mod system;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::middleware as axum_mw;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};

use crate::middleware;
use crate::state::AppState;

pub fn router(app: AppState) -> Router {
    let cors = cors_layer(&app);

    let api = Router::new()
        .route("/health", get(health::summary))
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/system/info", get(system::info))
        .route("/decompile", post(decompile::submit))
        .route("/decompile/test", get(decompile::test))
        .route(
            "/decompile/{id}",
            get(decompile::status).delete(decompile::cancel),
        )
        .route("/llm-providers", get(providers::list))
        .route("/llm-providers/{id}", get(providers::details))
        .route("/llm-providers/{id}/health-check", post(providers::health_check))
        .route("/admin/api-keys", post(admin::create_key))
        .route("/admin/api-keys/{user}", get(admin::list_keys))
        .route("/admin/api-keys/{user}/{key_id}", delete(admin::revoke_key))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/circuits/{id}/reset", post(admin::reset_circuit))
        .route("/admin/dev/create-api-key", post(admin::dev_create_key));

    // The framework's default body cap is far below a full-size upload;
    // leave one MiB of multipart framing headroom above the file limit.
    let body_limit = app.settings.limits.max_file_size_bytes() as usize + 1024 * 1024;

    Router::new()
        .route("/", get(system::root))
        .route("/docs", get(system::docs))
        .route("/metrics", get(system::metrics))
        .nest("/api/v1", api)
        .fallback(system::fallback)
        .layer(DefaultBodyLimit::max(body_limit))
        // Innermost to outermost: rate limit → auth → logging → envelope
        // → compression → CORS, matching the documented middleware order.
        .layer(axum_mw::from_fn_with_state(app.clone(), middleware::rate_limit))
        .layer(axum_mw::from_fn_with_state(app.clone(), middleware::authenticate))
        .layer(axum_mw::from_fn_with_state(
            app.clone(),
            middleware::request_context,
        ))
        .layer(axum_mw::from_fn(middleware::envelope_errors))
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(app)
}

fn cors_layer(app: &AppState) -> CorsLayer {
    let origins = &app.settings.server.cors_origins;
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    if origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<axum::http::HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(parsed)
    }
}
