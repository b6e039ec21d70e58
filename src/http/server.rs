//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router; every method and path goes to the forwarding handler
//! - Wire up middleware (tracing)
//! - Bind server to listener, with peer addresses available to the handler
//! - Stop accepting on shutdown and drain in-flight requests

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::http::forward::{forward, AppState, ForwardConfig};

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server forwarding with the given configuration.
    pub fn new(config: ForwardConfig) -> Self {
        tracing::debug!(backend = %config.backend(), "Forwarding configured");
        let router = Self::build_router(AppState::new(config));
        Self { router }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(forward)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// The router, for driving the handler without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener until
    /// `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            "Starting proxy server"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        // Serve with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
