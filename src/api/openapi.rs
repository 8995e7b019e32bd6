//! OpenAPI documentation and schema generation
//!
//! This module defines the OpenAPI specification for the swipe-dl REST API
//! using utoipa for compile-time spec generation.

use utoipa::OpenApi;

/// OpenAPI documentation for the swipe-dl REST API
///
/// The spec can be accessed via:
/// - `/api/v1/openapi.json` - JSON format OpenAPI specification
/// - `/swagger-ui` - Interactive Swagger UI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "swipe-dl REST API",
        version = "0.1.0",
        description = "Review queue, relay lease dashboard and channel settings for the swipe-dl orchestrator",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:6790/api/v1", description = "Local development server")
    ),
    paths(
        // Tasks
        crate::api::routes::list_tasks,
        crate::api::routes::list_pending,
        crate::api::routes::get_task,
        crate::api::routes::task_audit,
        crate::api::routes::decide_task,
        crate::api::routes::cancel_task,
        crate::api::routes::ingest_task,

        // Dashboard
        crate::api::routes::dashboard,
        crate::api::routes::emergency_destroy,
        crate::api::routes::proxy_check,
        crate::api::routes::relay_status,
        crate::api::routes::list_alerts,
        crate::api::routes::resolve_alert,

        // Settings
        crate::api::routes::list_channels,
        crate::api::routes::replace_channels,
        crate::api::routes::add_channel,
        crate::api::routes::update_channel,
        crate::api::routes::remove_channel,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
        crate::api::routes::event_stream,
    ),
    components(schemas(
        // Core types from types.rs
        crate::types::TaskId,
        crate::types::LeaseId,
        crate::types::TaskStatus,
        crate::types::Decision,
        crate::types::NewTask,
        crate::types::Task,
        crate::types::TaskPage,
        crate::types::StatusCounts,
        crate::types::AuditEntry,
        crate::types::LeaseState,
        crate::types::RelayStatus,
        crate::types::TransferStats,
        crate::types::RelayAlert,
        crate::types::DashboardSnapshot,
        crate::types::EmergencyDestroyReport,
        crate::types::ProbeReport,
        crate::types::Channel,
        crate::types::Event,

        // Request bodies
        crate::api::routes::TaskListQuery,
        crate::api::routes::DecisionRequest,
        crate::api::routes::ChannelUpdateRequest,

        // Error types from error.rs
        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "tasks", description = "Review queue - Ingest candidates, confirm or ignore, cancel, audit"),
        (name = "dashboard", description = "Relay lease, spend and alerts - Emergency destroy and proxy check"),
        (name = "settings", description = "Settings - Source channels shared with the ingestion process"),
        (name = "system", description = "System endpoints - Health checks, OpenAPI spec, events"),
    )
)]
pub struct ApiDoc;
