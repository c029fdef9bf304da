//! Operator surface: API key management, aggregate stats and circuit
//! resets.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use binsight_core::auth::AuthContext;
use binsight_core::model::{JobStatus, Permission, Priority, Tier};
use binsight_core::providers::ProviderId;

use crate::error::ApiError;
use crate::state::AppState;

fn require_admin(context: &Option<Extension<AuthContext>>) -> Result<(), ApiError> {
    match context {
        Some(Extension(context)) if context.has_permission(Permission::Admin) => Ok(()),
        Some(_) => Err(ApiError::forbidden("admin permission required")),
        None => Err(ApiError::unauthorized("missing API key")),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub user_id: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub expires_days: Option<u32>,
}

async fn create_key_inner(
    app: &AppState,
    request: CreateKeyRequest,
) -> Result<Response, ApiError> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::validation("user_id must not be empty"));
    }
    let tier = match request.tier.as_deref() {
        None | Some("") => Tier::Basic,
        Some(raw) => Tier::try_from(raw)?,
    };
    let permissions = request
        .permissions
        .iter()
        .map(|raw| Permission::try_from(raw.as_str()))
        .collect::<Result<Vec<_>, _>>()?;

    let issued = app
        .keys
        .create(&request.user_id, tier, permissions, request.expires_days)
        .await?;

    // The raw key appears exactly once, in this response.
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "api_key": issued.api_key,
            "key_id": issued.record.key_id,
            "user_id": issued.record.user_id,
            "tier": issued.record.tier,
            "permissions": issued.record.permissions,
            "expires_at": issued.record.expires_at,
        })),
    )
        .into_response())
}

/// `POST /api/v1/admin/api-keys` — create a key (admin only).
pub async fn create_key(
    State(app): State<AppState>,
    context: Option<Extension<AuthContext>>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Response, ApiError> {
    require_admin(&context)?;
    create_key_inner(&app, request).await
}

/// `GET /api/v1/admin/api-keys/{user}` — list a user's keys.
pub async fn list_keys(
    State(app): State<AppState>,
    context: Option<Extension<AuthContext>>,
    Path(user): Path<String>,
) -> Result<Response, ApiError> {
    require_admin(&context)?;
    let keys = app.keys.list_for_user(&user).await?;
    Ok(Json(json!({ "user_id": user, "keys": keys })).into_response())
}

/// `DELETE /api/v1/admin/api-keys/{user}/{key_id}` — revoke.
pub async fn revoke_key(
    State(app): State<AppState>,
    context: Option<Extension<AuthContext>>,
    Path((user, key_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    require_admin(&context)?;
    let revoked = app.keys.revoke(&user, &key_id).await?;
    if !revoked {
        return Err(ApiError::not_found(format!("key {key_id}")));
    }
    Ok(Json(json!({ "success": true, "key_id": key_id })).into_response())
}

/// `GET /api/v1/admin/stats` — queue depth, job status counts, circuit
/// states, rate-limit counters, uptime.
pub async fn stats(
    State(app): State<AppState>,
    context: Option<Extension<AuthContext>>,
) -> Result<Response, ApiError> {
    require_admin(&context)?;

    let queue_depth = app.pipeline.queue_depth().await?;
    let mut circuits = Vec::new();
    for breaker in app.breakers.all() {
        circuits.push(breaker.snapshot().await);
    }

    let submitted: u64 = Priority::ordered_desc()
        .iter()
        .map(|priority| {
            app.metrics
                .jobs_submitted
                .with_label_values(&[priority.as_str()])
                .get()
        })
        .sum();
    let mut finished = serde_json::Map::new();
    for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
        finished.insert(
            status.as_str().to_string(),
            json!(app
                .metrics
                .jobs_finished
                .with_label_values(&[status.as_str()])
                .get()),
        );
    }

    let mut denied = serde_json::Map::new();
    for limit in ["per_minute", "per_day", "uploads_per_minute", "llm_per_minute"] {
        denied.insert(
            limit.to_string(),
            json!(app.metrics.rate_limit_denied.with_label_values(&[limit]).get()),
        );
    }

    Ok(Json(json!({
        "uptime_seconds": app.started_at.elapsed().as_secs(),
        "queue_depth": queue_depth,
        "workers": app.settings.workers.count,
        "jobs": {
            "submitted": submitted,
            "finished": finished,
        },
        "rate_limiting": {
            "denied": denied,
            "fail_open": app.metrics.rate_limit_fail_open.get(),
        },
        "circuits": circuits,
    }))
    .into_response())
}

/// `POST /api/v1/admin/circuits/{id}/reset` — force a provider's circuit
/// closed and zero its counters (admin only).
pub async fn reset_circuit(
    State(app): State<AppState>,
    context: Option<Extension<AuthContext>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    require_admin(&context)?;

    let provider_id =
        ProviderId::try_from(id.as_str()).map_err(|message| ApiError::not_found(message))?;
    let breaker = app
        .breakers
        .get(provider_id.as_str())
        .ok_or_else(|| ApiError::not_found(format!("circuit for {id}")))?;

    // force_close records the state transition; reset clears the history.
    breaker.force_close().await;
    breaker.reset().await;
    tracing::info!(provider = provider_id.as_str(), "circuit reset by operator");

    Ok(Json(json!({
        "success": true,
        "provider": provider_id.as_str(),
        "circuit": breaker.snapshot().await,
    }))
    .into_response())
}

/// `POST /api/v1/admin/dev/create-api-key` — dev-mode helper, refused in
/// production.
pub async fn dev_create_key(
    State(app): State<AppState>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Response, ApiError> {
    if !app.settings.server.dev_mode {
        return Err(ApiError::forbidden(
            "dev key creation is disabled outside dev mode",
        ));
    }
    create_key_inner(&app, request).await
}
