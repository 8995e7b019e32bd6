//! Source channel handlers.

use super::ChannelUpdateRequest;
use crate::api::AppState;
use crate::types::Channel;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// GET /settings/channels - Watched channels
#[utoipa::path(
    get,
    path = "/api/v1/settings/channels",
    tag = "settings",
    responses(
        (status = 200, description = "Channel list", body = Vec<crate::types::Channel>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_channels(State(state): State<AppState>) -> Response {
    match state.orchestrator.channels().await {
        Ok(channels) => (StatusCode::OK, Json(channels)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PUT /settings/channels - Replace the channel list
#[utoipa::path(
    put,
    path = "/api/v1/settings/channels",
    tag = "settings",
    request_body(content = Vec<crate::types::Channel>, description = "Complete channel list"),
    responses(
        (status = 200, description = "Stored channel list", body = Vec<crate::types::Channel>),
        (status = 400, description = "A channel id appears twice"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn replace_channels(
    State(state): State<AppState>,
    Json(channels): Json<Vec<Channel>>,
) -> Response {
    match state.orchestrator.replace_channels(channels).await {
        Ok(channels) => (StatusCode::OK, Json(channels)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /settings/channels - Add one channel
#[utoipa::path(
    post,
    path = "/api/v1/settings/channels",
    tag = "settings",
    request_body(content = crate::types::Channel, description = "Channel to watch"),
    responses(
        (status = 201, description = "Channel added", body = crate::types::Channel),
        (status = 400, description = "Empty channel id"),
        (status = 409, description = "Channel already present"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn add_channel(State(state): State<AppState>, Json(channel): Json<Channel>) -> Response {
    match state.orchestrator.add_channel(channel).await {
        Ok(channel) => (StatusCode::CREATED, Json(channel)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PATCH /settings/channels/:id - Rename or toggle a channel
#[utoipa::path(
    patch,
    path = "/api/v1/settings/channels/{id}",
    tag = "settings",
    params(("id" = String, Path, description = "Channel id")),
    request_body(content = ChannelUpdateRequest, description = "Fields to change"),
    responses(
        (status = 200, description = "Updated channel", body = crate::types::Channel),
        (status = 404, description = "Channel not found"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn update_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ChannelUpdateRequest>,
) -> Response {
    match state
        .orchestrator
        .update_channel(&id, update.name, update.enabled)
        .await
    {
        Ok(channel) => (StatusCode::OK, Json(channel)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /settings/channels/:id - Stop watching a channel
#[utoipa::path(
    delete,
    path = "/api/v1/settings/channels/{id}",
    tag = "settings",
    params(("id" = String, Path, description = "Channel id")),
    responses(
        (status = 204, description = "Channel removed"),
        (status = 404, description = "Channel not found"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn remove_channel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.remove_channel(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
