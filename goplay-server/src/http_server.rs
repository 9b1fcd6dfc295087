//! HTTP server for the playground front end
//!
//! Routes:
//! - `POST /run` form field `code`, answers JSON
//! - `POST /compile?target=wasm|wasi` raw source, answers `application/wasm`
//! - `POST /format` raw source, answers the formatted source
//! - `GET /health`
//! - `/static/*` and `/` from the web directory

use crate::responses::{retry_after_secs, run_response, text_response};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::FormRejection, DefaultBodyLimit, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use goplay_common::{CompileQuery, HealthResponse, RunForm, RunResponse};
use goplay_sandbox::{
    CancellationToken, ExecutionResult, SandboxError, SandboxService, Submission, Target,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Room for the form field name and separators around an url-encoded source
const FORM_OVERHEAD: usize = 1024;

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    service: Arc<SandboxService>,
    web_dir: PathBuf,
}

impl AppState {
    pub fn new(service: Arc<SandboxService>, web_dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            web_dir: web_dir.into(),
        }
    }

    pub fn service(&self) -> &SandboxService {
        &self.service
    }

    /// Largest accepted request body; url-encoding can triple the source size
    pub fn body_limit(&self) -> usize {
        self.service
            .governor()
            .limits()
            .max_source_bytes
            .saturating_mul(3)
            .saturating_add(FORM_OVERHEAD)
    }

    fn retry_after(&self) -> u64 {
        retry_after_secs(self.service.governor().admission_timeout())
    }
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    let index = state.web_dir.join("index.html");
    let body_limit = state.body_limit();

    Router::new()
        .route("/run", post(handle_run))
        .route("/compile", post(handle_compile))
        .route("/format", post(handle_format))
        .route("/health", get(handle_health))
        .nest_service("/static", ServeDir::new(&state.web_dir))
        .route_service("/", ServeFile::new(index))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves
pub async fn start_server<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let bind_addr = listener
        .local_addr()
        .context("Failed to obtain HTTP server bind address")?;
    info!("Starting HTTP server on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    Ok(())
}

/// Run a submission in its own task.
///
/// Dropping this future (client went away) cancels the execution, which still
/// runs its cleanup to completion inside the task.
async fn execute(state: &AppState, submission: Submission) -> Result<ExecutionResult, SandboxError> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let service = state.service.clone();
    let task =
        tokio::spawn(async move { service.execute_with_cancel(submission, cancel).await });

    match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Execution task failed: {}", e);
            Err(SandboxError::Internal(format!("execution task failed: {}", e)))
        }
    }
}

/// Handle POST /run
async fn handle_run(
    State(state): State<AppState>,
    form: Result<Form<RunForm>, FormRejection>,
) -> Response {
    let Form(form) = match form {
        Ok(form) => form,
        Err(rejection) => {
            debug!("Rejected /run body: {}", rejection.body_text());
            let status = match rejection.status() {
                StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            return (
                status,
                Json(RunResponse::rejected("validation", rejection.body_text())),
            )
                .into_response();
        }
    };

    let outcome = execute(&state, Submission::new(form.code, Target::Run)).await;
    run_response(outcome, state.retry_after())
}

/// Handle POST /compile
async fn handle_compile(
    State(state): State<AppState>,
    Query(query): Query<CompileQuery>,
    body: String,
) -> Response {
    let flags = query.target.map(|target| format!("-target={}", target));
    let submission = Submission::new(body, Target::CompileWasm).with_flags(flags);

    match execute(&state, submission).await {
        Ok(ExecutionResult {
            artifact: Some(wasm),
            ..
        }) => ([(header::CONTENT_TYPE, "application/wasm")], wasm).into_response(),
        Ok(result) => {
            error!(execution_id = %result.execution_id, "Build succeeded without an artifact");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error, the submission could not be processed",
            )
                .into_response()
        }
        Err(e) => text_response("compile error:\n", e, state.retry_after()),
    }
}

/// Handle POST /format
async fn handle_format(State(state): State<AppState>, body: String) -> Response {
    match execute(&state, Submission::new(body, Target::Format)).await {
        Ok(result) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            result.stdout,
        )
            .into_response(),
        Err(e) => text_response("format error: ", e, state.retry_after()),
    }
}

/// Handle GET /health
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let governor = state.service.governor();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capacity: governor.capacity(),
        in_use: governor.in_use(),
    })
}
