// HTTP route handlers for the execution service

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use pyexec_common::screening::check_imports;
use pyexec_common::types::{
    Language, NewJob, TestSpec, MAX_SOURCE_BYTES, MAX_TESTS_PER_JOB, MAX_TEST_TIMEOUT_MS, MIN_TEST_TIMEOUT_MS,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{ApiError, Problem};
use crate::guard::Rejection;
use crate::metrics;
use crate::queue::QueueError;
use crate::AppState;

pub const TRACE_HEADER: &str = "x-trace-id";
pub const SUBMITTER_HEADER: &str = "x-user-id";
const FORWARDED_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

impl ExecuteRequest {
    /// Shape checks only; safety screening happens separately
    pub fn validate(&self) -> Result<Language, Vec<Problem>> {
        let mut problems = Vec::new();

        let language = match self.language.as_deref() {
            None => Some(Language::Python),
            Some(name) => {
                let parsed = Language::from_str(name);
                if parsed.is_none() {
                    problems.push(Problem::new("language", "Only python language is supported currently."));
                }
                parsed
            }
        };

        if self.source.is_empty() {
            problems.push(Problem::new("source", "source is required"));
        } else if self.source.len() > MAX_SOURCE_BYTES {
            problems.push(Problem::new(
                "source",
                format!("source must be at most {} bytes", MAX_SOURCE_BYTES),
            ));
        }

        if self.tests.len() > MAX_TESTS_PER_JOB {
            problems.push(Problem::new(
                "tests",
                format!("at most {} tests are allowed", MAX_TESTS_PER_JOB),
            ));
        }

        for (index, test) in self.tests.iter().enumerate() {
            if let Some(timeout_ms) = test.timeout_ms {
                if !(MIN_TEST_TIMEOUT_MS..=MAX_TEST_TIMEOUT_MS).contains(&timeout_ms) {
                    problems.push(Problem::new(
                        format!("tests[{}].timeoutMs", index),
                        format!(
                            "timeoutMs must be between {} and {}",
                            MIN_TEST_TIMEOUT_MS, MAX_TEST_TIMEOUT_MS
                        ),
                    ));
                }
            }
        }

        match language {
            Some(language) if problems.is_empty() => Ok(language),
            _ => Err(problems),
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Client address. The peer address, unless the service sits behind a
/// trusted proxy, in which case the first hop of X-Forwarded-For.
fn origin_of(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> Option<String> {
    let peer = peer.map(|addr| addr.ip().to_string());
    if !trust_proxy {
        return peer;
    }
    header_value(headers, FORWARDED_HEADER)
        .and_then(|forwarded| forwarded.split(',').next().map(|hop| hop.trim().to_string()))
        .filter(|hop| !hop.is_empty())
        .or(peer)
}

fn reject(rejection: Rejection) -> ApiError {
    metrics::ADMISSION_REJECTED
        .with_label_values(&[rejection.reason()])
        .inc();
    ApiError::Rejected(rejection)
}

/// POST /execute - Screen, enqueue, and wait for the job's result
pub async fn execute(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let trace_id = header_value(&headers, TRACE_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string());
    let submitter_id = header_value(&headers, SUBMITTER_HEADER);
    let origin = origin_of(&headers, peer.map(|ConnectInfo(addr)| addr), state.trust_proxy);

    let span = info_span!(
        "execute",
        trace_id = %trace_id,
        submitter_id = submitter_id.as_deref().unwrap_or("-"),
        origin = origin.as_deref().unwrap_or("-"),
    );

    async move {
        let Json(request) = payload.map_err(|rejection| {
            metrics::ADMISSION_REJECTED.with_label_values(&["invalid_request"]).inc();
            ApiError::Validation(vec![Problem::new("body", rejection.body_text())])
        })?;

        let language = request.validate().map_err(|problems| {
            metrics::ADMISSION_REJECTED.with_label_values(&["invalid_request"]).inc();
            ApiError::Validation(problems)
        })?;

        state
            .guard
            .screen_source(&request.source, submitter_id.as_deref(), origin.as_deref())
            .map_err(reject)?;
        state
            .guard
            .admit(submitter_id.as_deref(), origin.as_deref())
            .await
            .map_err(reject)?;

        let issues = check_imports(&request.source, &state.allowed_modules);
        if !issues.is_empty() {
            warn!(issues = ?issues, "static_analysis_rejected");
            metrics::ADMISSION_REJECTED.with_label_values(&["unsafe_source"]).inc();
            return Err(ApiError::UnsafeSource(issues));
        }

        let tests = request.tests.len();
        let job = state
            .queue
            .enqueue(NewJob {
                language,
                source: request.source,
                tests: request.tests,
                trace_id: trace_id.clone(),
                submitter_id: submitter_id.clone(),
            })
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to enqueue job");
                ApiError::Infrastructure(format!("Failed to enqueue job: {}", e))
            })?;
        info!(job_id = %job.job_id, tests, queue = state.queue.backend(), "job_enqueued");

        let result = match state.queue.subscribe(job.job_id).await {
            Ok(result) => result,
            Err(QueueError::Timeout(waited)) => {
                metrics::QUEUE_TIMEOUTS.inc();
                warn!(job_id = %job.job_id, waited_ms = waited.as_millis() as u64, "Result wait timed out");
                return Err(ApiError::QueueTimeout);
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Failed to receive job result");
                return Err(ApiError::Infrastructure(format!("Failed to receive job result: {}", e)));
            }
        };

        info!(job_id = %job.job_id, ok = result.ok, "execute_job_completed");
        if !result.ok {
            return Err(ApiError::JobFailed(result));
        }
        Ok((StatusCode::OK, Json(result)).into_response())
    }
    .instrument(span)
    .await
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler() -> Response {
    match metrics::gather() {
        Ok((content_type, body)) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// GET /ready - Sandbox and queue availability
pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let sandbox = state.runner.ping().await;
    let queue_up = state.queue.depth().await.is_ok();
    let ok = sandbox.is_some() && queue_up;

    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "ok": ok,
            "services": {
                "sandbox": sandbox.unwrap_or("down"),
                "queue": if queue_up { "up" } else { "down" },
                "queueBackend": state.queue.backend(),
            }
        })),
    )
        .into_response()
}

/// GET /health - Liveness
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
