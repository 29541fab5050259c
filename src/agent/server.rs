use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AgentConfig;

use super::api::{self, AppState};
use super::runner::{AgentRunner, PipelineContext};
use super::status::AgentStatusStore;

/// How long running jobs get to clean up their worktrees on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub listen_addr: String,
    pub port: u16,
    pub agent: AgentConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 8080,
            agent: AgentConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.contains(':') && !self.listen_addr.starts_with('[') {
            format!("[{}]:{}", self.listen_addr, self.port)
        } else {
            format!("{}:{}", self.listen_addr, self.port)
        }
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server and serve until Ctrl+C or SIGTERM.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let addr = config.bind_addr();
    let runner = AgentRunner::new(
        PipelineContext::from_config(config.agent),
        AgentStatusStore::new(),
    );
    let state = Arc::new(AppState {
        runner: runner.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr: SocketAddr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        repo = %runner.config().repo_path.display(),
        agent = %runner.config().agent_cmd,
        "AirGit agent server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    runner.shutdown(SHUTDOWN_GRACE).await;
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down...");
}
