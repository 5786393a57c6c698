// Admission-path errors and their HTTP mapping

use crate::guard::{Rejection, Scope};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use pyexec_common::types::ResultPayload;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// One problem with a request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Problem {
    pub field: String,
    pub message: String,
}

impl Problem {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request")]
    Validation(Vec<Problem>),

    #[error("Source failed safety checks")]
    UnsafeSource(Vec<String>),

    #[error("submission rejected: {}", .0.reason())]
    Rejected(Rejection),

    #[error("Execution timed out while waiting for results.")]
    QueueTimeout,

    /// The job ran but its batch failed; the payload carries the reason
    #[error("job failed: {}", .0.error.as_deref().unwrap_or("unknown error"))]
    JobFailed(ResultPayload),

    #[error("{0}")]
    Infrastructure(String),
}

fn retry_after_header(retry_after: Duration) -> HeaderValue {
    // Whole seconds, rounded up, never zero
    let secs = retry_after.as_millis().div_ceil(1000).max(1);
    HeaderValue::from(secs as u64)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(problems) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "INVALID_REQUEST", "problems": problems })),
            )
                .into_response(),
            ApiError::UnsafeSource(issues) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "Source failed safety checks", "issues": issues })),
            )
                .into_response(),
            ApiError::Rejected(Rejection::ForbiddenToken { .. }) => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "ok": false,
                    "error": "FORBIDDEN_TOKEN",
                    "message": "Code contains forbidden tokens"
                })),
            )
                .into_response(),
            ApiError::Rejected(Rejection::RateLimited { scope, retry_after }) => {
                let message = match scope {
                    Scope::Submitter => "Too many requests from this user",
                    Scope::Origin => "Too many requests from this IP",
                };
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_header(retry_after))],
                    Json(json!({
                        "ok": false,
                        "error": "RATE_LIMIT_EXCEEDED",
                        "message": message,
                        "retryAfterMs": retry_after.as_millis() as u64
                    })),
                )
                    .into_response()
            }
            ApiError::Rejected(Rejection::Blocked { retry_after }) => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_header(retry_after))],
                Json(json!({
                    "ok": false,
                    "error": "RATE_LIMIT_EXCEEDED",
                    "code": "TIMEOUT_BLOCK",
                    "message": "User is temporarily blocked due to repeated timeouts. Please check for infinite loops.",
                    "retryAfterMs": retry_after.as_millis() as u64
                })),
            )
                .into_response(),
            ApiError::QueueTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "ok": false, "error": "Execution timed out while waiting for results." })),
            )
                .into_response(),
            ApiError::JobFailed(payload) => (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response(),
            ApiError::Infrastructure(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": message })),
            )
                .into_response(),
        }
    }
}
