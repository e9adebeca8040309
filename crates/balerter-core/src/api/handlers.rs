//! API handlers for the HTTP REST API

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

use crate::alerting::AlertManager;
use crate::models::{Alert, AlertSummary, Level};
use crate::storage::CoreStorage;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Alert manager over the alert storage
    pub manager: Arc<AlertManager>,
    /// Storage instance serving the KV API
    pub kv: Arc<dyn CoreStorage>,
    /// Prometheus exporter, when installed
    pub prometheus: Option<PrometheusHandle>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: String,
    /// Crate version
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Query parameters for listing alerts
#[derive(Debug, Default, Deserialize)]
pub struct ListAlertsQuery {
    /// Comma separated exact names
    pub name: Option<String>,
    /// Comma separated level tokens
    pub level: Option<String>,
}

/// List alerts filtered by name and level
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<ListAlertsQuery>,
) -> Result<Json<Vec<AlertSummary>>, (StatusCode, String)> {
    let levels = match params.level.as_deref() {
        Some(levels) => {
            Level::parse_list(levels).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        }
        None => Vec::new(),
    };

    let names: Vec<String> = params
        .name
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .collect();

    let alerts = state.manager.list(&names, &levels).await.map_err(|e| {
        error!(error = %e, "Failed to list alerts");
        (StatusCode::INTERNAL_SERVER_ERROR, "error list alerts".to_string())
    })?;

    Ok(Json(alerts.iter().map(Alert::summary).collect()))
}

/// Query parameters for a single alert
#[derive(Debug, Default, Deserialize)]
pub struct GetAlertQuery {
    /// Alert name
    pub name: Option<String>,
}

/// Get one alert by name
pub async fn get_alert(
    State(state): State<AppState>,
    Query(params): Query<GetAlertQuery>,
) -> Result<Json<Alert>, (StatusCode, String)> {
    let name = params
        .name
        .filter(|n| !n.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "alert name is required".to_string()))?;

    match state.manager.get(&name).await {
        Ok(Some(alert)) => Ok(Json(alert)),
        Ok(None) => Err((StatusCode::NOT_FOUND, "alert not found".to_string())),
        Err(e) => {
            error!(alert = %name, error = %e, "Failed to get alert");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "error get alert".to_string()))
        }
    }
}

/// Every KV pair of the configured KV storage
pub async fn list_kv(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, String>>, (StatusCode, String)> {
    state.kv.kv().all().await.map(Json).map_err(|e| {
        error!(storage = %state.kv.name(), error = %e, "Failed to read kv");
        (StatusCode::INTERNAL_SERVER_ERROR, "error get kv".to_string())
    })
}

/// Prometheus exposition of alert metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter disabled").into_response(),
    }
}
