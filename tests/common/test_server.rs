//! In-process HTTP server on an ephemeral port

use goplay_sandbox::SandboxService;
use goplay_server::{start_server, AppState};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A running server; shut down when dropped
pub struct TestServer {
    pub base_url: String,
    pub service: Arc<SandboxService>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(service: SandboxService, web_dir: &Path) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let service = Arc::new(service);
        let state = AppState::new(service.clone(), web_dir);
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(start_server(listener, state, async move {
            let _ = rx.await;
        }));

        Ok(Self {
            base_url: format!("http://{}", addr),
            service,
            shutdown: Some(tx),
            handle,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}
