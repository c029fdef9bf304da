//! Job submission, status, and cancellation.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use binsight_core::auth::AuthContext;
use binsight_core::model::{
    is_job_id, AnalysisDepth, DecompilationArtifact, JobConfig, JobStatus, Priority,
    TranslationDetail, TranslationResult,
};
use binsight_core::providers::ProviderId;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct FileInfo {
    filename: String,
    size_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmittedConfig {
    analysis_depth: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    llm_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    llm_model: Option<String>,
    translation_detail: &'static str,
    priority: &'static str,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    success: bool,
    job_id: String,
    status: &'static str,
    message: &'static str,
    file_info: FileInfo,
    config: SubmittedConfig,
    estimated_completion: &'static str,
    check_status_url: String,
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job_id: String,
    status: JobStatus,
    progress_percentage: u8,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<TranslationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_artifact: Option<DecompilationArtifact>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    success: bool,
    job_id: String,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

struct UploadForm {
    filename: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
    config: JobConfig,
}

async fn read_form(
    mut multipart: Multipart,
    defaults: &binsight_core::config::Settings,
) -> Result<UploadForm, ApiError> {
    let mut filename = None;
    let mut content_type = None;
    let mut bytes: Option<Vec<u8>> = None;
    let mut config = JobConfig {
        timeout_secs: defaults.workers.default_timeout_secs,
        ..JobConfig::default()
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                filename = field.file_name().map(str::to_string);
                content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(multipart_error)?;
                bytes = Some(data.to_vec());
            }
            "analysis_depth" => {
                let value = text_field(field).await?;
                config.analysis_depth = AnalysisDepth::try_from(value.as_str())?;
            }
            "llm_provider" => {
                let value = text_field(field).await?;
                if !value.is_empty() {
                    ProviderId::try_from(value.as_str())
                        .map_err(|message| ApiError::validation(message))?;
                    config.provider = Some(value);
                }
            }
            "llm_model" => {
                let value = text_field(field).await?;
                if !value.is_empty() {
                    config.model = Some(value);
                }
            }
            "translation_detail" => {
                let value = text_field(field).await?;
                config.translation_detail = TranslationDetail::try_from(value.as_str())?;
            }
            "priority" => {
                let value = text_field(field).await?;
                config.priority = Priority::try_from(value.as_str())?;
            }
            "max_functions_translate" => {
                let value = text_field(field).await?;
                config.max_functions_translate = Some(value.parse().map_err(|_| {
                    ApiError::validation("max_functions_translate must be a non-negative integer")
                })?);
            }
            "cost_limit_usd" => {
                let value = text_field(field).await?;
                let limit: f64 = value
                    .parse()
                    .map_err(|_| ApiError::validation("cost_limit_usd must be a number"))?;
                if limit.is_nan() || limit < 0.0 {
                    return Err(ApiError::validation("cost_limit_usd must be non-negative"));
                }
                config.cost_limit_usd = limit;
            }
            "timeout_seconds" => {
                let value = text_field(field).await?;
                config.timeout_secs = value
                    .parse()
                    .map_err(|_| ApiError::validation("timeout_seconds must be an integer"))?;
            }
            "include_functions" => config.include_functions = bool_field(field).await?,
            "include_imports" => config.include_imports = bool_field(field).await?,
            "include_strings" => config.include_strings = bool_field(field).await?,
            "include_overall_summary" => {
                config.include_overall_summary = bool_field(field).await?
            }
            _ => {}
        }
    }

    let bytes = bytes.ok_or_else(|| ApiError::bad_request("no file provided"))?;
    let filename = filename
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::bad_request("no file provided"))?;

    Ok(UploadForm {
        filename,
        content_type,
        bytes,
        config,
    })
}

// Oversize bodies arrive as multipart read failures; keep the 413.
fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large("request body exceeds the upload limit")
    } else {
        ApiError::bad_request(format!("malformed multipart body: {err}"))
    }
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map(|value| value.trim().to_string())
        .map_err(multipart_error)
}

async fn bool_field(field: axum::extract::multipart::Field<'_>) -> Result<bool, ApiError> {
    let value = text_field(field).await?;
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ApiError::validation(format!("expected a boolean, got {other:?}"))),
    }
}

/// `POST /api/v1/decompile` — accept a binary and queue a job.
pub async fn submit(
    State(app): State<AppState>,
    context: Option<Extension<AuthContext>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_form(multipart, &app.settings).await?;
    let user_id = context
        .map(|Extension(context)| context.user_id)
        .unwrap_or_else(|| "anonymous".to_string());

    let job = app
        .pipeline
        .submit(&user_id, &form.filename, &form.bytes, form.config.clone())
        .await?;

    let body = SubmitResponse {
        success: true,
        job_id: job.id.clone(),
        status: "queued",
        message: "decompilation job submitted",
        file_info: FileInfo {
            filename: form.filename,
            size_bytes: form.bytes.len(),
            content_type: form.content_type,
        },
        config: SubmittedConfig {
            analysis_depth: job.config.analysis_depth.as_str(),
            llm_provider: job.config.provider.clone(),
            llm_model: job.config.model.clone(),
            translation_detail: job.config.translation_detail.as_str(),
            priority: job.config.priority.as_str(),
        },
        estimated_completion: "5-10 minutes",
        check_status_url: format!("/api/v1/decompile/{}", job.id),
    };

    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub include_raw: bool,
}

/// `GET /api/v1/decompile/{id}` — job status, plus results when complete.
pub async fn status(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    if !is_job_id(&id) {
        return Err(ApiError::not_found(format!("job {id}")));
    }

    let view = app
        .pipeline
        .fetch(&id, query.include_raw)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;

    Ok(Json(JobStatusResponse {
        job_id: view.job.id,
        status: view.job.status,
        progress_percentage: view.job.progress_percentage,
        created_at: view.job.created_at,
        started_at: view.job.started_at,
        completed_at: view.job.completed_at,
        results: view.result,
        raw_artifact: view.artifact,
        errors: view.job.errors,
        warnings: view.job.warnings,
    })
    .into_response())
}

/// `DELETE /api/v1/decompile/{id}` — cancel a pending or freshly claimed
/// job. Idempotent: repeated cancels on a terminal job keep reporting
/// "cannot cancel" without touching state.
pub async fn cancel(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !is_job_id(&id) {
        return Err(ApiError::not_found(format!("job {id}")));
    }

    let cancelled = app.pipeline.cancel(&id).await?;
    if cancelled {
        return Ok(Json(CancelResponse {
            success: true,
            job_id: id,
            status: JobStatus::Cancelled,
            message: None,
        })
        .into_response());
    }

    let view = app
        .pipeline
        .fetch(&id, false)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;

    Ok(Json(CancelResponse {
        success: false,
        job_id: id,
        status: view.job.status,
        message: Some("job can no longer be cancelled"),
    })
    .into_response())
}

/// `GET /api/v1/decompile/test` — connectivity probe.
pub async fn test() -> Response {
    Json(json!({ "message": "decompilation API is reachable" })).into_response()
}
