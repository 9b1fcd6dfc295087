//! End-to-end tests for the HTTP API
//!
//! A real server on an ephemeral port, driven with reqwest, backed by the
//! fake toolchain.

use goplay_common::{HealthResponse, RunResponse, SandboxConfig};
use goplay_tests::common::*;
use reqwest::StatusCode;
use std::time::Duration;

struct Fixture {
    server: TestServer,
    client: reqwest::Client,
    _root: tempfile::TempDir,
    _web: tempfile::TempDir,
}

async fn start(adjust: impl FnOnce(&mut SandboxConfig)) -> Fixture {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let web = tempfile::tempdir().unwrap();
    std::fs::write(web.path().join("index.html"), "<h1>goplay</h1>").unwrap();
    std::fs::write(web.path().join("client.js"), "runCode();").unwrap();

    let mut config = test_sandbox_config(root.path(), 2);
    adjust(&mut config);
    let server = TestServer::start(fake_service(&config), web.path())
        .await
        .unwrap();

    Fixture {
        server,
        client: reqwest::Client::new(),
        _root: root,
        _web: web,
    }
}

impl Fixture {
    async fn run(&self, code: &str) -> (StatusCode, RunResponse) {
        let response = self
            .client
            .post(self.server.url("/run"))
            .form(&[("code", code)])
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn post_raw(&self, path: &str, body: &str) -> reqwest::Response {
        self.client
            .post(self.server.url(path))
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_health_reports_capacity() {
    let fx = start(|_| {}).await;

    let response = fx.client.get(fx.server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health: HealthResponse = response.json().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.capacity, 2);
    assert_eq!(health.in_use, 0);
}

#[tokio::test]
async fn test_run_success() {
    let fx = start(|_| {}).await;

    let (status, body) = fx.run("echo hi; echo note >&2").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_ok());
    assert_eq!(body.output, "hi\n");
    assert_eq!(body.error, "note\n");
    assert_eq!(body.exit_code, Some(0));
}

#[tokio::test]
async fn test_run_program_error() {
    let fx = start(|_| {}).await;

    let (status, body) = fx
        .run("echo partial; echo './main.go:4:2: undefined: x' >&2; exit 1")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body.status, "nonzero-exit");
    assert_eq!(body.output, "partial\n");
    assert!(body.error.contains("undefined: x"));
    assert_eq!(body.exit_code, Some(1));
}

#[tokio::test]
async fn test_run_timeout() {
    let fx = start(|config| config.limits.run_deadline = Duration::from_millis(300)).await;

    let (status, body) = fx.run("echo started; while :; do :; done").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body.status, "timeout");
    assert!(body.error.contains("time limit"));
}

#[tokio::test]
async fn test_run_output_flood() {
    let fx = start(|_| {}).await;

    let (status, body) = fx.run("yes flood").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body.status, "output-too-large");
    assert!(body.output.len() <= 64 * 1024);
}

#[tokio::test]
async fn test_run_oversized_source() {
    let fx = start(|config| config.limits.max_source_bytes = 1024).await;

    let (status, body) = fx.run(&"a".repeat(2000)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body.status, "validation");
    assert!(body.error.contains("limit is 1024 bytes"));
    assert_eq!(fx.server.service.workspaces().live_workspaces().unwrap().len(), 0);
}

#[tokio::test]
async fn test_run_without_code_field() {
    let fx = start(|_| {}).await;

    let response = fx
        .client
        .post(fx.server.url("/run"))
        .form(&[("source", "echo hi")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: RunResponse = response.json().await.unwrap();
    assert_eq!(body.status, "validation");
}

#[tokio::test]
async fn test_capacity_rejection_has_retry_after() {
    let fx = start(|config| {
        config.max_concurrent = 1;
        config.admission_timeout = Duration::from_millis(50);
    })
    .await;

    let busy_client = fx.client.clone();
    let url = fx.server.url("/run");
    let first = tokio::spawn(async move {
        busy_client
            .post(url)
            .form(&[("code", "sleep 2")])
            .send()
            .await
            .unwrap()
            .status()
    });

    let service = fx.server.service.clone();
    assert!(wait_until(Duration::from_secs(2), || service.governor().in_use() == 1).await);

    let response = fx
        .client
        .post(fx.server.url("/run"))
        .form(&[("code", "echo hi")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "1");
    let body: RunResponse = response.json().await.unwrap();
    assert_eq!(body.status, "capacity");

    assert_eq!(first.await.unwrap(), StatusCode::OK);
}

#[tokio::test]
async fn test_compile_returns_wasm() {
    let fx = start(|_| {}).await;

    let response = fx.post_raw("/compile?target=wasi", "package main").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/wasm");
    assert_eq!(response.bytes().await.unwrap().as_ref(), FAKE_WASM);
}

#[tokio::test]
async fn test_compile_error() {
    let fx = start(|_| {}).await;

    let response = fx.post_raw("/compile", "package main\nCOMPILE_ERROR").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let text = response.text().await.unwrap();
    assert!(text.starts_with("compile error:\n"));
    assert!(text.contains("undefined: COMPILE_ERROR"));
}

#[tokio::test]
async fn test_compile_unknown_target() {
    let fx = start(|_| {}).await;

    let response = fx.post_raw("/compile?target=js", "package main").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("-target=js"));
}

#[tokio::test]
async fn test_format() {
    let fx = start(|_| {}).await;

    let response = fx.post_raw("/format", "package   main\n").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "package main\n");

    let response = fx.post_raw("/format", "package main\nFORMAT_ERROR\n").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let text = response.text().await.unwrap();
    assert!(text.starts_with("format error: "));
    assert!(text.contains("expected declaration"));
}

#[tokio::test]
async fn test_static_files() {
    let fx = start(|_| {}).await;

    let index = fx.client.get(fx.server.url("/")).send().await.unwrap();
    assert_eq!(index.status(), StatusCode::OK);
    assert!(index.text().await.unwrap().contains("goplay"));

    let script = fx
        .client
        .get(fx.server.url("/static/client.js"))
        .send()
        .await
        .unwrap();
    assert_eq!(script.status(), StatusCode::OK);
    assert_eq!(script.text().await.unwrap(), "runCode();");
}
