//! REST API server module
//!
//! Exposes the review queue, the relay dashboard and channel settings as an
//! OpenAPI 3.1 REST API, plus a server-sent events stream.

use crate::{Config, Orchestrator, Result};
use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the API router with all route definitions
///
/// Every route lives under `/api/v1`.
///
/// # Routes
///
/// ## Tasks
/// - `GET /tasks` - List tasks (optional `status` filter, pagination)
/// - `GET /tasks/pending` - Review queue
/// - `GET /tasks/:id` - Get single task
/// - `GET /tasks/:id/audit` - Audit trail
/// - `POST /tasks/:id/decision` - Confirm or ignore
/// - `POST /tasks/:id/cancel` - Cancel a confirmed or downloading task
/// - `POST /internal/tasks` - Ingest a candidate
///
/// ## Dashboard
/// - `GET /dashboard` - Counts, relay, transfer stats, monthly spend, alerts
/// - `POST /dashboard/emergency-destroy` - Delete the relay now
/// - `POST /dashboard/proxy-check` - Probe the active relay
/// - `GET /relay` - Relay lease status
/// - `GET /alerts` - Unresolved alerts
/// - `POST /alerts/:id/resolve` - Resolve an alert
///
/// ## Settings
/// - `GET /settings/channels` - List channels
/// - `PUT /settings/channels` - Replace channel list
/// - `POST /settings/channels` - Add channel
/// - `PATCH /settings/channels/:id` - Rename or toggle channel
/// - `DELETE /settings/channels/:id` - Remove channel
///
/// ## System
/// - `GET /health` - Health check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /events` - Server-sent events stream
/// - `GET /swagger-ui` - Interactive documentation (if enabled, outside `/api/v1`)
pub fn create_router(orchestrator: Arc<Orchestrator>, config: Arc<Config>) -> Router {
    let state = AppState::new(orchestrator, config.clone());

    let api = Router::new()
        // Tasks
        .route("/tasks", get(routes::list_tasks))
        .route("/tasks/pending", get(routes::list_pending))
        .route("/tasks/:id", get(routes::get_task))
        .route("/tasks/:id/audit", get(routes::task_audit))
        .route("/tasks/:id/decision", post(routes::decide_task))
        .route("/tasks/:id/cancel", post(routes::cancel_task))
        .route("/internal/tasks", post(routes::ingest_task))
        // Dashboard
        .route("/dashboard", get(routes::dashboard))
        .route(
            "/dashboard/emergency-destroy",
            post(routes::emergency_destroy),
        )
        .route("/dashboard/proxy-check", post(routes::proxy_check))
        .route("/relay", get(routes::relay_status))
        .route("/alerts", get(routes::list_alerts))
        .route("/alerts/:id/resolve", post(routes::resolve_alert))
        // Settings
        .route(
            "/settings/channels",
            get(routes::list_channels)
                .put(routes::replace_channels)
                .post(routes::add_channel),
        )
        .route(
            "/settings/channels/:id",
            axum::routing::patch(routes::update_channel).delete(routes::remove_channel),
        )
        // System
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec))
        .route("/events", get(routes::event_stream));

    let router = Router::new().nest("/api/v1", api);

    // Swagger UI points at the /api/v1/openapi.json route above
    let router = if config.api.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/api/v1/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    let router = router.with_state(state).layer(TraceLayer::new_for_http());

    if config.api.cors_enabled {
        let cors = build_cors_layer(&config.api.cors_origins);
        router.layer(cors)
    } else {
        router
    }
}

/// Build a CORS layer based on configured origins
///
/// # Arguments
///
/// * `origins` - List of allowed origins (supports "*" for any origin)
///
/// # Returns
///
/// A configured CorsLayer that allows the specified origins, all methods,
/// and all headers for cross-origin requests.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    // Check if "*" (all origins) is in the list
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        // Allow all origins (default for local development)
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        // Allow specific origins
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the API server on the configured bind address
///
/// Runs until the listener fails or `shutdown` resolves.
///
/// # Example
///
/// ```no_run
/// use swipe_dl::{Config, Orchestrator};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Arc::new(Config::default());
/// let orchestrator = Arc::new(Orchestrator::new((*config).clone()).await?);
/// orchestrator.start();
///
/// swipe_dl::api::start_api_server(orchestrator, config, async {
///     let _ = tokio::signal::ctrl_c().await;
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn start_api_server<F>(
    orchestrator: Arc<Orchestrator>,
    config: Arc<Config>,
    shutdown: F,
) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let bind_address = config.api.bind_address;

    tracing::info!(address = %bind_address, "Starting API server");

    let app = create_router(orchestrator, config);

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(address = %bind_address, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
