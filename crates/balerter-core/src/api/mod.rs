//! REST API implementation
//!
//! This module provides the HTTP API for Balerter.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;

use std::future::Future;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::alerting::AlertManager;
use crate::error::{Error, Result};
use crate::storage::CoreStorage;

/// HTTP API server
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        manager: Arc<AlertManager>,
        kv: Arc<dyn CoreStorage>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            state: AppState {
                manager,
                kv,
                prometheus,
            },
        }
    }

    /// Start the HTTP server, running until `shutdown` resolves
    pub async fn serve<F>(self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = create_router(self.state)
            .layer(TraceLayer::new_for_http())
            .layer(cors);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("HTTP server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}
