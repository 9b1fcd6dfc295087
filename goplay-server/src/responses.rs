//! Mapping of execution outcomes to HTTP responses

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use goplay_common::RunResponse;
use goplay_sandbox::{ExecutionResult, SandboxError};
use std::time::Duration;

/// Seconds a client should wait before retrying a capacity rejection
pub(crate) fn retry_after_secs(admission_timeout: Duration) -> u64 {
    admission_timeout.as_secs_f64().ceil().max(1.0) as u64
}

fn status_of(error: &SandboxError) -> StatusCode {
    StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn with_retry_after(error: &SandboxError, mut response: Response, retry_after: u64) -> Response {
    if error.is_retryable() {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    }
    response
}

/// JSON response for `/run`
pub(crate) fn run_response(
    outcome: Result<ExecutionResult, SandboxError>,
    retry_after: u64,
) -> Response {
    let error = match outcome {
        Ok(result) => {
            let body = RunResponse {
                output: result.stdout_lossy(),
                error: result.stderr_lossy(),
                status: result.status.to_string(),
                exit_code: result.exit_code,
                duration_ms: result.duration_ms(),
            };
            return (StatusCode::OK, Json(body)).into_response();
        }
        Err(error) => error,
    };

    let body = match error.result() {
        Some(result) => RunResponse {
            output: result.stdout_lossy(),
            error: error.user_message(),
            status: result.status.to_string(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms(),
        },
        None => RunResponse::rejected(error.kind(), error.user_message()),
    };

    let response = (status_of(&error), Json(body)).into_response();
    with_retry_after(&error, response, retry_after)
}

/// Plain-text error for `/compile` and `/format`; program diagnostics get `prefix`
pub(crate) fn text_response(prefix: &str, error: SandboxError, retry_after: u64) -> Response {
    let message = match &error {
        SandboxError::UntrustedProgram(result) => format!("{}{}", prefix, result.diagnostics()),
        other => other.user_message(),
    };

    let response = (status_of(&error), message).into_response();
    with_retry_after(&error, response, retry_after)
}
