//! Error types for swipe-dl
//!
//! This module provides error handling for the orchestration engine, including:
//! - Domain-specific error types (task state machine, relay lease, database)
//! - HTTP status code mapping for API integration
//! - Structured error responses with machine-readable error codes

use crate::types::TaskStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for swipe-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for swipe-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "relay.idle_timeout")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Task registry error (state machine, lookup, duplicates)
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// Relay lease error (provisioning, health check, destroy)
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// The remote storage service refused the link
    ///
    /// Never retried: re-submitting a rejected or filtered resource only burns quota.
    #[error("offline download rejected for {uri}: {reason}")]
    SubmissionRejected {
        /// The URI that was submitted
        uri: String,
        /// Reason reported by the storage service
        reason: String,
    },

    /// Remote storage service failure (transient or unexpected response)
    #[error("remote storage error: {0}")]
    Storage(String),

    /// Transfer daemon (aria2) RPC failure
    #[error("transfer daemon error: {0}")]
    Transfer(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller supplied malformed input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Resource already exists (channels, settings keys)
    #[error("already exists: {0}")]
    Duplicate(String),

    /// Generic not-found for resources other than tasks (alerts, channels, ...)
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored value could not be decoded into a domain type
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Task registry errors, returned synchronously to API callers
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Task id is unknown
    #[error("task {id} not found")]
    NotFound {
        /// The task ID that was not found
        id: i64,
    },

    /// Requested transition is not an edge of the task state machine
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The task ID
        id: i64,
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },

    /// An equivalent URI has already been ingested
    #[error("resource already ingested as task {existing_id}")]
    DuplicateResource {
        /// The task that already owns this resource
        existing_id: i64,
        /// Normalized resource key that collided
        uri_key: String,
    },

    /// The download made no progress within the configured grace period
    #[error("task {id} stalled: no progress for {stalled_secs}s")]
    Stalled {
        /// The task ID
        id: i64,
        /// Seconds since the last observed progress
        stalled_secs: u64,
    },
}

/// Relay lease errors
///
/// Cloneable so a single provisioning outcome can be handed to every coalesced waiter.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Instance creation, boot, or bootstrap failed
    #[error("relay provisioning failed: {reason}")]
    ProvisionFailed {
        /// Why provisioning failed
        reason: String,
    },

    /// The instance is running but traffic does not pass through the relay
    #[error("relay health check failed for {address}: {reason}")]
    HealthCheckFailed {
        /// Address that was probed
        address: String,
        /// Last probe failure
        reason: String,
    },

    /// Instance deletion failed after all retries
    #[error("failed to destroy relay instance {instance_id}: {reason}")]
    DestroyFailed {
        /// Provider instance id that is still alive
        instance_id: String,
        /// Last deletion failure
        reason: String,
    },

    /// Acquire was cancelled by an emergency destroy or shutdown
    #[error("relay acquire cancelled")]
    Cancelled,

    /// No relay is currently active
    #[error("no active relay")]
    NotActive,

    /// Provider control-plane call failed
    #[error("relay provider error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Provider {
        /// HTTP status returned by the provider, if any
        status: Option<u16>,
        /// Error message
        message: String,
    },
}

impl Error {
    /// Short, user-facing detail string stored on failed tasks
    pub fn task_detail(&self) -> String {
        match self {
            Error::Relay(e) => e.to_string(),
            Error::Task(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

/// API error response format
///
/// This structure is returned by API endpoints when an error occurs.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "invalid_transition",
///     "message": "task 7 cannot move from COMPLETE to CONFIRMED",
///     "details": { "task_id": 7, "from": "COMPLETE", "to": "CONFIRMED" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "task_not_found", "duplicate_resource")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::InvalidInput(_) => 400,

            Error::NotFound(_) => 404,
            Error::Task(TaskError::NotFound { .. }) => 404,

            Error::Duplicate(_) => 409,
            Error::Task(TaskError::InvalidTransition { .. }) => 409,
            Error::Task(TaskError::DuplicateResource { .. }) => 409,
            Error::Task(TaskError::Stalled { .. }) => 409,
            Error::Relay(RelayError::NotActive) => 409,
            Error::Relay(RelayError::Cancelled) => 409,

            Error::SubmissionRejected { .. } => 422,

            Error::Database(_) => 500,
            Error::Sqlx(_) => 500,
            Error::Io(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Serialization(_) => 500,
            Error::Other(_) => 500,

            // External collaborators
            Error::Relay(_) => 502,
            Error::Storage(_) => 502,
            Error::Transfer(_) => 502,
            Error::Network(_) => 502,

            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::InvalidInput(_) => "validation_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Task(e) => match e {
                TaskError::NotFound { .. } => "task_not_found",
                TaskError::InvalidTransition { .. } => "invalid_transition",
                TaskError::DuplicateResource { .. } => "duplicate_resource",
                TaskError::Stalled { .. } => "stalled",
            },
            Error::Relay(e) => match e {
                RelayError::ProvisionFailed { .. } => "provision_failed",
                RelayError::HealthCheckFailed { .. } => "health_check_failed",
                RelayError::DestroyFailed { .. } => "destroy_failed",
                RelayError::Cancelled => "relay_cancelled",
                RelayError::NotActive => "relay_not_active",
                RelayError::Provider { .. } => "relay_provider_error",
            },
            Error::SubmissionRejected { .. } => "submission_rejected",
            Error::Storage(_) => "storage_error",
            Error::Transfer(_) => "transfer_error",
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::Duplicate(_) => "duplicate",
            Error::ShuttingDown => "shutting_down",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Task(TaskError::NotFound { id }) => Some(serde_json::json!({
                "task_id": id,
            })),
            Error::Task(TaskError::InvalidTransition { id, from, to }) => Some(serde_json::json!({
                "task_id": id,
                "from": from,
                "to": to,
            })),
            Error::Task(TaskError::DuplicateResource {
                existing_id,
                uri_key,
            }) => Some(serde_json::json!({
                "existing_task_id": existing_id,
                "uri_key": uri_key,
            })),
            Error::Relay(RelayError::DestroyFailed { instance_id, .. }) => {
                Some(serde_json::json!({
                    "instance_id": instance_id,
                }))
            }
            Error::SubmissionRejected { uri, .. } => Some(serde_json::json!({
                "uri": uri,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
