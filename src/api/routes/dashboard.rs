//! Dashboard, relay and alert handlers.

use crate::api::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// GET /dashboard - Counts, relay state, transfer stats, monthly spend, alerts
#[utoipa::path(
    get,
    path = "/api/v1/dashboard",
    tag = "dashboard",
    responses(
        (status = 200, description = "Dashboard snapshot", body = crate::types::DashboardSnapshot),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn dashboard(State(state): State<AppState>) -> Response {
    match state.orchestrator.dashboard().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to build dashboard");
            e.into_response()
        }
    }
}

/// POST /dashboard/emergency-destroy - Delete the relay now and fail dependent tasks
#[utoipa::path(
    post,
    path = "/api/v1/dashboard/emergency-destroy",
    tag = "dashboard",
    responses(
        (status = 200, description = "What was destroyed and which tasks failed", body = crate::types::EmergencyDestroyReport)
    )
)]
pub async fn emergency_destroy(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.orchestrator.emergency_destroy().await;
    (StatusCode::OK, Json(report))
}

/// POST /dashboard/proxy-check - Probe the active relay
#[utoipa::path(
    post,
    path = "/api/v1/dashboard/proxy-check",
    tag = "dashboard",
    responses(
        (status = 200, description = "Probe result", body = crate::types::ProbeReport),
        (status = 409, description = "No active relay"),
        (status = 502, description = "Probe through the relay failed")
    )
)]
pub async fn proxy_check(State(state): State<AppState>) -> Response {
    match state.orchestrator.proxy_check().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /relay - Relay lease status
#[utoipa::path(
    get,
    path = "/api/v1/relay",
    tag = "dashboard",
    responses(
        (status = 200, description = "Relay lease status", body = crate::types::RelayStatus)
    )
)]
pub async fn relay_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.orchestrator.relay_status()))
}

/// GET /alerts - Unresolved relay alerts
#[utoipa::path(
    get,
    path = "/api/v1/alerts",
    tag = "dashboard",
    responses(
        (status = 200, description = "Unresolved alerts", body = Vec<crate::types::RelayAlert>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_alerts(State(state): State<AppState>) -> Response {
    match state.orchestrator.alerts().await {
        Ok(alerts) => (StatusCode::OK, Json(alerts)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /alerts/:id/resolve - Mark an alert handled
#[utoipa::path(
    post,
    path = "/api/v1/alerts/{id}/resolve",
    tag = "dashboard",
    params(("id" = i64, Path, description = "Alert ID")),
    responses(
        (status = 204, description = "Alert resolved"),
        (status = 404, description = "Alert not found or already resolved"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn resolve_alert(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.orchestrator.resolve_alert(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
