//! REST error envelope.
//!
//! Every error leaving the API has the shape
//! `{"success": false, "error": {"type", "message", "status_code", "details"}}`.
//! Stack traces and internal messages never reach clients; internals are
//! logged and replaced with a generic message.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use binsight_core::auth::AuthError;
use binsight_core::kv::KvError;
use binsight_core::model::ValidationError;
use binsight_core::worker::SubmitError;

#[derive(Debug)]
pub struct ApiError {
    pub kind: &'static str,
    pub status: StatusCode,
    pub message: String,
    pub details: Option<Value>,
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(kind: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation", StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("validation", StatusCode::BAD_REQUEST, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new("validation", StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("authentication", StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("authorization", StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            "not_found",
            StatusCode::NOT_FOUND,
            format!("{} not found", resource.into()),
        )
    }

    pub fn rate_limited(retry_after: u64, limit_name: &str) -> Self {
        let mut error = Self::new(
            "rate_limited",
            StatusCode::TOO_MANY_REQUESTS,
            format!("Rate limit exceeded. Try again in {retry_after} seconds."),
        )
        .with_details(json!({ "limit": limit_name }));
        error.retry_after = Some(retry_after);
        error
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            "provider_unavailable",
            StatusCode::SERVICE_UNAVAILABLE,
            message,
        )
    }

    pub fn queue_full() -> Self {
        Self::new(
            "queue_full",
            StatusCode::SERVICE_UNAVAILABLE,
            "job queue is full, retry later",
        )
    }

    pub fn internal() -> Self {
        Self::new(
            "internal",
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error",
        )
    }

    pub fn envelope(&self) -> Value {
        json!({
            "success": false,
            "error": {
                "type": self.kind,
                "message": self.message,
                "status_code": self.status.as_u16(),
                "details": self.details.clone().unwrap_or(Value::Null),
            }
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.envelope())).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        tracing::error!(error = %err, "kv store error");
        match err {
            KvError::Unavailable(_) => {
                Self::service_unavailable("storage backend is unavailable")
            }
            KvError::Command(_) => Self::internal(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        tracing::error!(error = %err, "auth store error");
        match err {
            AuthError::Unavailable(_) => {
                Self::service_unavailable("credential store is unavailable")
            }
            AuthError::Corrupt(_) => Self::internal(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::EmptyFile => Self::bad_request("no file content provided"),
            SubmitError::TooLarge { actual, max } => Self::payload_too_large(format!(
                "file of {actual} bytes exceeds the maximum of {max} bytes"
            )),
            SubmitError::QueueFull => Self::queue_full(),
            SubmitError::BlobWrite(message) => {
                tracing::error!(error = %message, "blob write failed");
                Self::internal()
            }
            SubmitError::Kv(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_has_the_documented_shape() {
        let error = ApiError::validation("analysis_depth is invalid");
        let envelope = error.envelope();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"]["type"], "validation");
        assert_eq!(envelope["error"]["status_code"], 422);
        assert!(envelope["error"]["message"]
            .as_str()
            .unwrap()
            .contains("analysis_depth"));
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let error = ApiError::rate_limited(42, "per_minute");
        assert_eq!(error.retry_after, Some(42));
        assert_eq!(error.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error.envelope()["error"]["details"]["limit"], "per_minute");
    }

    #[test]
    fn submit_errors_map_to_http_statuses() {
        let too_large: ApiError = SubmitError::TooLarge {
            actual: 10,
            max: 5,
        }
        .into();
        assert_eq!(too_large.status, StatusCode::PAYLOAD_TOO_LARGE);

        let empty: ApiError = SubmitError::EmptyFile.into();
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);

        let full: ApiError = SubmitError::QueueFull.into();
        assert_eq!(full.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(full.kind, "queue_full");
    }

    #[test]
    fn internal_errors_hide_detail() {
        let error: ApiError = KvError::Command("secret detail".into()).into();
        assert!(!error.envelope()["error"]["message"]
            .as_str()
            .unwrap()
            .contains("secret"));
    }
}
