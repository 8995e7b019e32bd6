//! Task review and lifecycle handlers.

use super::{DecisionRequest, TaskListQuery};
use crate::api::AppState;
use crate::error::Error;
use crate::types::{NewTask, TaskId, TaskStatus};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

fn parse_status(raw: &str) -> Result<TaskStatus, Error> {
    TaskStatus::parse(&raw.trim().to_ascii_uppercase())
        .ok_or_else(|| Error::InvalidInput(format!("unknown task status: {raw}")))
}

/// GET /tasks - List tasks newest first
#[utoipa::path(
    get,
    path = "/api/v1/tasks",
    tag = "tasks",
    params(
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("limit" = Option<i64>, Query, description = "Maximum number of items to return (default 20, max 100)"),
        ("offset" = Option<i64>, Query, description = "Number of items to skip")
    ),
    responses(
        (status = 200, description = "One page of tasks", body = crate::types::TaskPage),
        (status = 400, description = "Unknown status filter"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Response {
    let status = match query.status.as_deref().map(parse_status).transpose() {
        Ok(status) => status,
        Err(e) => return e.into_response(),
    };

    match state
        .orchestrator
        .list_tasks(status, query.limit, query.offset)
        .await
    {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list tasks");
            e.into_response()
        }
    }
}

/// GET /tasks/pending - The review queue
#[utoipa::path(
    get,
    path = "/api/v1/tasks/pending",
    tag = "tasks",
    params(
        ("limit" = Option<i64>, Query, description = "Maximum number of items to return (default 20, max 100)"),
        ("offset" = Option<i64>, Query, description = "Number of items to skip")
    ),
    responses(
        (status = 200, description = "Pending tasks awaiting a decision", body = crate::types::TaskPage),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_pending(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Response {
    match state
        .orchestrator
        .list_tasks(Some(TaskStatus::Pending), query.limit, query.offset)
        .await
    {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /tasks/:id - Get a single task
#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = i64, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task", body = crate::types::Task),
        (status = 404, description = "Task not found"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.orchestrator.get_task(TaskId(id)).await {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /tasks/:id/audit - A task's audit trail
#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}/audit",
    tag = "tasks",
    params(("id" = i64, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Audit entries, oldest first", body = Vec<crate::types::AuditEntry>),
        (status = 404, description = "Task not found"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn task_audit(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.orchestrator.task_history(TaskId(id)).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /tasks/:id/decision - Confirm or ignore a pending task
///
/// Confirmation returns as soon as the task is CONFIRMED; provisioning and
/// submission continue in the background.
#[utoipa::path(
    post,
    path = "/api/v1/tasks/{id}/decision",
    tag = "tasks",
    params(("id" = i64, Path, description = "Task ID")),
    request_body(content = DecisionRequest, description = "Operator decision"),
    responses(
        (status = 200, description = "Task after the decision", body = crate::types::Task),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task is no longer pending"),
        (status = 503, description = "Shutting down"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn decide_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<DecisionRequest>,
) -> Response {
    match state.orchestrator.decide(TaskId(id), request.action).await {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /tasks/:id/cancel - Cancel a confirmed or downloading task
#[utoipa::path(
    post,
    path = "/api/v1/tasks/{id}/cancel",
    tag = "tasks",
    params(("id" = i64, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task moved to ERROR", body = crate::types::Task),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task is not confirmed or downloading"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.orchestrator.cancel(TaskId(id)).await {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /internal/tasks - Ingest a candidate from the feed listener
#[utoipa::path(
    post,
    path = "/api/v1/internal/tasks",
    tag = "tasks",
    request_body(content = crate::types::NewTask, description = "Discovered candidate"),
    responses(
        (status = 201, description = "Task created as PENDING", body = crate::types::Task),
        (status = 400, description = "Missing URI or title"),
        (status = 409, description = "Resource already ingested"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn ingest_task(State(state): State<AppState>, Json(candidate): Json<NewTask>) -> Response {
    match state.orchestrator.enqueue(candidate).await {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => e.into_response(),
    }
}
