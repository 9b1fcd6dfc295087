//! HTTP server for the Go playground sandbox

pub mod http_server;
mod responses;

pub use http_server::{create_router, start_server, AppState};

use anyhow::{Context, Result};
use goplay_common::AppConfig;
use goplay_sandbox::SandboxService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Build the sandbox from `config`, remove stale workspaces, and serve until ctrl-c
pub async fn run_server(config: AppConfig) -> Result<()> {
    let service = Arc::new(SandboxService::from_app_config(&config));

    info!(
        runner = service.runner_name(),
        capacity = service.governor().capacity(),
        workspace_root = %service.workspaces().root().display(),
        "Sandbox ready"
    );

    let sweeper = service.clone();
    match tokio::task::spawn_blocking(move || sweeper.sweep_stale_workspaces()).await {
        Ok(Ok(removed)) => info!("Stale workspace sweep removed {} directories", removed),
        Ok(Err(e)) => warn!("Stale workspace sweep failed: {}", e),
        Err(e) => warn!("Stale workspace sweep panicked: {}", e),
    }

    let bind_addr = config.server.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    let state = AppState::new(service, &config.server.web_dir);
    start_server(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
