//! HTTP surface of the analysis service.
//!
//! - `POST /analyze` with JSON `{"filePath": ..., "threshold"?: ...}`
//! - `POST /analyze/upload` with a multipart `file` field (and optional
//!   `threshold` field)
//! - `GET /health`, `GET /classes`
//!
//! Both analyze routes take `?view=best` to get the legacy
//! `{objectName, confidence}` body instead of the full summary.

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::service::AnalysisService;

pub use handlers::{BestResult, ErrorBody};

/// Room for multipart boundaries and headers on top of the file limit.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

/// Builds the router with the service injected as shared state.
pub fn build_router(service: Arc<AnalysisService>) -> Router {
    let body_limit = service
        .max_upload_bytes()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    Router::new()
        .route("/health", get(handlers::health))
        .route("/classes", get(handlers::classes))
        .route("/analyze", post(handlers::analyze_path))
        .route("/analyze/upload", post(handlers::analyze_upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<AnalysisService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<AnalysisService>) -> Self {
        Self { cfg, service }
    }

    /// Binds the listener and serves in a background task.
    pub async fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.cfg.addr))?;
        let listener = tokio::net::TcpListener::bind(configured_addr)
            .await
            .with_context(|| format!("failed to bind {}", configured_addr))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = build_router(self.service);
        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(ApiHandle {
            addr,
            shutdown: Some(shutdown_tx),
            join,
        })
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<std::io::Result<()>>,
}

impl ApiHandle {
    /// Stops accepting connections and waits for in-flight requests.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join
            .await
            .map_err(|_| anyhow!("api server task panicked"))?
            .context("api server failed")?;
        Ok(())
    }
}
