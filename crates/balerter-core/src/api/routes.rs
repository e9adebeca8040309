//! API routes

use axum::{routing::get, Router};

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))

        // Alerts
        .route("/api/v1/alerts", get(handlers::list_alerts))
        .route("/api/v1/alert", get(handlers::get_alert))

        // KV
        .route("/api/v1/kv", get(handlers::list_kv))

        // Metrics
        .route("/metrics", get(handlers::metrics))

        .with_state(state)
}
