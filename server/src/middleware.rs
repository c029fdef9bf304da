//! Request middleware: correlation ids and request logging, bearer-key
//! authentication, and tier-aware rate limiting.
//!
//! Outermost-first the chain is CORS → compression → error mapping →
//! request logging → authentication → rate limiting; the first three are
//! tower layers applied in the router, the rest live here.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use binsight_core::auth::AuthContext;
use binsight_core::model::{Permission, Tier};
use binsight_core::ratelimit::{limits_for, EndpointCategory, WindowDecision};

use crate::error::ApiError;
use crate::state::AppState;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Correlation id attached to every request, echoed in the response and in
/// every log line emitted on the request's behalf.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Endpoints reachable without credentials and exempt from rate limits.
pub fn is_public_path(path: &str) -> bool {
    matches!(
        path,
        "/" | "/docs" | "/metrics"
            | "/api/v1/health"
            | "/api/v1/health/ready"
            | "/api/v1/health/live"
    )
}

/// Collapse per-job path segments so metric labels stay bounded.
pub fn normalized_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if binsight_core::model::is_job_id(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn endpoint_category(method: &Method, path: &str) -> EndpointCategory {
    if *method == Method::POST && path.contains("/decompile") {
        EndpointCategory::Upload
    } else if path.contains("/llm-providers") || path.contains("/translate") {
        EndpointCategory::Translation
    } else {
        EndpointCategory::Standard
    }
}

/// Attach a correlation id, log the request, and record HTTP metrics.
pub async fn request_context(
    State(app): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let span = tracing::info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %method,
        path = %path,
    );

    let started = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;
    let elapsed = started.elapsed();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }

    let status = response.status();
    let metric_path = normalized_path(&path);
    app.metrics
        .http_requests
        .with_label_values(&[method.as_str(), &metric_path, status.as_str()])
        .inc();
    app.metrics
        .http_duration
        .with_label_values(&[method.as_str(), &metric_path])
        .observe(elapsed.as_secs_f64());

    let _enter = span.enter();
    if elapsed.as_secs_f64() > 2.0 {
        tracing::warn!(status = %status, elapsed_ms = elapsed.as_millis() as u64, "slow request");
    } else {
        tracing::info!(status = %status, elapsed_ms = elapsed.as_millis() as u64, "request served");
    }

    response
}

/// Bearer-key authentication. Public paths pass anonymously; dev mode gets
/// a synthetic operator identity so the admin surface stays usable.
pub async fn authenticate(
    State(app): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_public_path(&path) {
        return next.run(request).await;
    }

    if app.settings.server.dev_mode {
        request.extensions_mut().insert(AuthContext {
            user_id: "dev".into(),
            key_id: "dev".into(),
            tier: Tier::Enterprise,
            permissions: vec![Permission::Admin],
        });
        return next.run(request).await;
    }

    let Some(token) = bearer_token(&request) else {
        return ApiError::unauthorized("missing API key").into_response();
    };

    match app.keys.validate(&token).await {
        Ok(Some(context)) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Ok(None) => ApiError::unauthorized("invalid, expired or revoked API key").into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if let Ok(text) = value.to_str() {
            if let Some(token) = text.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    // Fallback: api_key query parameter.
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("api_key=")
                .map(|value| value.trim().to_string())
        })
    })
}

/// Tier- and endpoint-aware sliding-window rate limiting. Disabled in dev
/// mode and for public paths; fails open when the kv store is down.
pub async fn rate_limit(State(app): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if app.settings.server.dev_mode || is_public_path(&path) {
        return next.run(request).await;
    }

    let context = request.extensions().get::<AuthContext>().cloned();
    let (identity, tier) = match &context {
        Some(context) => (format!("user:{}", context.user_id), Some(context.tier)),
        None => (format!("ip:{}", client_ip(&request)), None),
    };

    let quotas = app.settings.rate_tiers.for_tier(tier);
    let category = endpoint_category(request.method(), &path);
    let rules = limits_for(quotas, category);

    match app.limiter.check_all(&identity, &rules).await {
        Err(denied) => {
            let mut response =
                ApiError::rate_limited(denied.retry_after_secs, &denied.limit_name).into_response();
            apply_rate_headers(&mut response, &denied);
            response
        }
        Ok(grant) => {
            let mut response = next.run(request).await;
            apply_rate_headers(&mut response, &grant);
            if grant.fail_open {
                if let Ok(value) = HeaderValue::from_str("rate_limiting_disabled") {
                    response.headers_mut().insert("x-rate-limit-warning", value);
                }
            }
            response
        }
    }
}

fn apply_rate_headers(response: &mut Response, decision: &WindowDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.to_string()),
        ("x-ratelimit-window", decision.window_seconds.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
}

fn client_ip(request: &Request) -> String {
    let headers = request.headers();
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|value| value.to_str().ok()) {
        return real_ip.trim().to_string();
    }
    "unknown".to_string()
}

/// Ensure bare error responses produced below the handlers (rejections,
/// route fallbacks) still leave in the documented envelope.
pub async fn envelope_errors(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false);
    if is_json {
        return response;
    }

    let kind = match status.as_u16() {
        401 => "authentication",
        403 => "authorization",
        404 => "not_found",
        405 => "validation",
        408 => "timeout",
        413 => "validation",
        422 => "validation",
        429 => "rate_limited",
        500..=599 => "internal",
        _ => "validation",
    };
    let mut replacement = ApiError::new(
        kind,
        status,
        status.canonical_reason().unwrap_or("error").to_string(),
    )
    .into_response();
    // Keep headers such as Retry-After or correlation ids from the
    // original response.
    for (name, value) in response.headers() {
        if name != header::CONTENT_TYPE && name != header::CONTENT_LENGTH {
            replacement.headers_mut().insert(name.clone(), value.clone());
        }
    }
    replacement
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_paths_are_exempt() {
        assert!(is_public_path("/api/v1/health"));
        assert!(is_public_path("/api/v1/health/live"));
        assert!(is_public_path("/metrics"));
        assert!(is_public_path("/"));
        assert!(!is_public_path("/api/v1/decompile"));
        assert!(!is_public_path("/api/v1/system/info"));
    }

    #[test]
    fn job_ids_collapse_in_metric_paths() {
        assert_eq!(
            normalized_path("/api/v1/decompile/dec_0123456789abcdef0123456789abcdef"),
            "/api/v1/decompile/{id}"
        );
        assert_eq!(normalized_path("/api/v1/health"), "/api/v1/health");
    }

    #[test]
    fn categories_follow_method_and_path() {
        assert_eq!(
            endpoint_category(&Method::POST, "/api/v1/decompile"),
            EndpointCategory::Upload
        );
        assert_eq!(
            endpoint_category(&Method::GET, "/api/v1/decompile/dec_x"),
            EndpointCategory::Standard
        );
        assert_eq!(
            endpoint_category(&Method::GET, "/api/v1/llm-providers"),
            EndpointCategory::Translation
        );
        assert_eq!(
            endpoint_category(&Method::GET, "/api/v1/system/info"),
            EndpointCategory::Standard
        );
    }
}
