//! Server crate provides the operational HTTP surface.
//!
//! The pipeline itself is asynchronous; this server only exposes liveness
//! and the Prometheus registry. There is no order read API here.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Server represents the ops HTTP server.
pub struct Server {
    port: u16,
    registry: Arc<Registry>,
}

/// Application state shared between request handlers
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
}

impl Server {
    /// Creates a new Server instance.
    ///
    /// # Arguments
    ///
    /// * `port` - The port on which the server will listen
    /// * `registry` - The shared Prometheus registry to expose
    pub fn new(port: u16, registry: Arc<Registry>) -> Self {
        info!("Initializing HTTP server on port {}", port);

        Self { port, registry }
    }

    /// Starts the server and blocks until the shutdown signal fires.
    pub async fn start(&self, shutdown: Arc<Notify>) -> Result<()> {
        let app = self.create_router();

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.notified().await;
            })
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    fn create_router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .with_state(AppState {
                registry: self.registry.clone(),
            })
    }
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match String::from_utf8(buffer) {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to convert metrics to UTF-8: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let registry = Arc::new(Registry::new());
        let server = Server::new(8081, registry);
        assert_eq!(server.port, 8081);
        // Router construction must not panic.
        let _router = server.create_router();
    }
}
