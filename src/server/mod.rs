//! Front SSE/HTTP endpoint assembly.
//!
//! Implements the "mailbox" pattern for never-failing client connections:
//! session-based message buffering with ring-buffer replay, broadcast
//! channels for live delivery, and background cleanup of stale sessions.

pub mod session;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::backend::BackendRegistry;
use crate::health::HealthMonitor;
use crate::lifecycle::LifecycleManager;
use crate::router::Router as GatewayRouter;

/// The gateway's front-facing HTTP server.
pub struct GatewayServer {
    state: Arc<transport::AppState>,
}

impl GatewayServer {
    #[must_use]
    pub fn new(
        router: Arc<GatewayRouter>,
        health: Arc<HealthMonitor>,
        registry: Arc<BackendRegistry>,
        lifecycle: Arc<LifecycleManager>,
        api_key: Option<String>,
    ) -> Self {
        let sessions = Arc::new(session::SessionManager::new());
        Arc::clone(&sessions).start_cleanup_task();

        let state = Arc::new(transport::AppState {
            router,
            sessions,
            health,
            registry,
            lifecycle,
            api_key,
        });

        Self { state }
    }

    /// Bind and serve until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn run(self, addr: SocketAddr) -> anyhow::Result<()> {
        let app = transport::build_router(self.state);

        tracing::info!(%addr, "gateway listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

        tracing::info!("gateway shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    tracing::info!("received shutdown signal");
}
