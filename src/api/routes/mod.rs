//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`tasks`] - Review queue, decisions, cancellation, audit trail, ingestion
//! - [`dashboard`] - Dashboard snapshot, relay status and actions, alerts
//! - [`settings`] - Source channel management
//! - [`system`] - Health, events, OpenAPI

use crate::types::Decision;
use serde::{Deserialize, Serialize};

mod dashboard;
mod settings;
mod system;
mod tasks;

// Re-export all handlers so `routes::function_name` works
pub use dashboard::*;
pub use settings::*;
pub use system::*;
pub use tasks::*;

// ============================================================================
// Query/Request Types (shared across handlers)
// ============================================================================

/// Query parameters for GET /tasks
#[derive(Debug, Default, Deserialize, Serialize, utoipa::ToSchema)]
pub struct TaskListQuery {
    /// Filter by status (PENDING, CONFIRMED, DOWNLOADING, COMPLETE, IGNORED, ERROR)
    pub status: Option<String>,
    /// Maximum number of items to return (default: 20, max: 100)
    pub limit: Option<i64>,
    /// Number of items to skip (default: 0)
    pub offset: Option<i64>,
}

/// Request body for POST /tasks/:id/decision
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct DecisionRequest {
    /// `confirm` or `ignore`
    pub action: Decision,
}

/// Request body for PATCH /settings/channels/:id
#[derive(Debug, Default, Deserialize, Serialize, utoipa::ToSchema)]
pub struct ChannelUpdateRequest {
    /// New display name
    pub name: Option<String>,
    /// Whether the channel is watched
    pub enabled: Option<bool>,
}
