//! Database layer for swipe-dl
//!
//! Handles SQLite persistence for tasks, their audit trail, the relay cost
//! ledger, operator alerts and settings.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`tasks`] - Task CRUD, compare-and-set transitions, audit trail
//! - [`leases`] - Relay cost ledger and operator alerts
//! - [`settings`] - Key/value settings and the source channel list
//! - [`state`] - Runtime state (shutdown tracking)

use crate::error::DatabaseError;
use crate::Error;
use crate::types::{AuditEntry, LeaseId, RelayAlert, Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod leases;
mod migrations;
mod settings;
mod state;
mod tasks;

pub use settings::CHANNELS_KEY;
pub(crate) use tasks::resource_key;

/// Relay ledger status values
pub mod lease_status {
    /// Instance requested; not yet healthy
    pub const PROVISIONING: &str = "provisioning";
    /// Relay healthy and carrying traffic
    pub const ACTIVE: &str = "active";
    /// Instance deleted; minutes are final
    pub const DESTROYED: &str = "destroyed";
    /// Provisioning failed before any instance existed
    pub const FAILED: &str = "failed";
    /// Deletion exhausted its retries; instance may still be billing
    pub const DESTROY_PENDING: &str = "destroy_pending";
}

/// A requested status change, applied with compare-and-set semantics
///
/// `lease_id` replaces the stored value outright, so every transition out of
/// `DOWNLOADING` clears it. The optional text fields only overwrite when set.
#[derive(Debug, Clone)]
pub struct TaskTransition<'a> {
    /// Task to change
    pub id: TaskId,
    /// Status the task must currently be in
    pub from: TaskStatus,
    /// Target status
    pub to: TaskStatus,
    /// Lease held after the transition
    pub lease_id: Option<LeaseId>,
    /// Failure detail
    pub error: Option<&'a str>,
    /// Remote storage job id
    pub offline_task_id: Option<&'a str>,
    /// Transfer daemon job id
    pub transfer_id: Option<&'a str>,
    /// Unix timestamp of the change
    pub at: i64,
}

impl<'a> TaskTransition<'a> {
    /// A bare transition with no side fields
    pub fn new(id: TaskId, from: TaskStatus, to: TaskStatus) -> Self {
        Self {
            id,
            from,
            to,
            lease_id: None,
            error: None,
            offline_task_id: None,
            transfer_id: None,
            at: Utc::now().timestamp(),
        }
    }
}

/// Task record from database
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    /// Unique database ID
    pub id: i64,
    /// Magnet link or URL, as ingested
    pub uri: String,
    /// Normalized resource key used for deduplication
    pub uri_key: String,
    /// Display title
    pub title: String,
    /// Optional description
    pub description: Option<String>,
    /// Advertised size in bytes
    pub size_bytes: i64,
    /// JSON array of preview image references
    pub preview_images: String,
    /// Source channel
    pub source_chat_id: Option<i64>,
    /// Source message
    pub source_msg_id: Option<i64>,
    /// Status string (see [`TaskStatus::as_str`])
    pub status: String,
    /// Lease held while downloading
    pub lease_id: Option<i64>,
    /// Remote storage job id
    pub offline_task_id: Option<String>,
    /// Transfer daemon job id
    pub transfer_id: Option<String>,
    /// Failure detail
    pub error_detail: Option<String>,
    /// Unix timestamp of ingestion
    pub created_at: i64,
    /// Unix timestamp of last change
    pub updated_at: i64,
    /// Unix timestamp of confirmation
    pub confirmed_at: Option<i64>,
    /// Unix timestamp of completion
    pub completed_at: Option<i64>,
}

impl TryFrom<TaskRow> for Task {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::parse(&row.status).ok_or_else(|| {
            Error::Database(DatabaseError::CorruptRow(format!(
                "task {} has unknown status {:?}",
                row.id, row.status
            )))
        })?;
        let preview_images: Vec<String> =
            serde_json::from_str(&row.preview_images).unwrap_or_default();

        Ok(Task {
            id: TaskId(row.id),
            title: row.title,
            description: row.description,
            size_bytes: row.size_bytes,
            preview_images,
            uri: row.uri,
            status,
            lease_id: row.lease_id.map(LeaseId),
            error: row.error_detail,
            source_chat_id: row.source_chat_id,
            source_msg_id: row.source_msg_id,
            offline_task_id: row.offline_task_id,
            transfer_id: row.transfer_id,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
            confirmed_at: row.confirmed_at.map(timestamp),
            completed_at: row.completed_at.map(timestamp),
        })
    }
}

/// Audit record from database
#[derive(Debug, Clone, FromRow)]
pub struct AuditRow {
    /// Unique database ID
    pub id: i64,
    /// Task the entry belongs to
    pub task_id: i64,
    /// Entry kind
    pub kind: String,
    /// Status before
    pub from_status: Option<String>,
    /// Status after
    pub to_status: Option<String>,
    /// Free-form detail
    pub detail: Option<String>,
    /// Unix timestamp
    pub created_at: i64,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        AuditEntry {
            id: row.id,
            task_id: TaskId(row.task_id),
            kind: row.kind,
            from_status: row.from_status.as_deref().and_then(TaskStatus::parse),
            to_status: row.to_status.as_deref().and_then(TaskStatus::parse),
            detail: row.detail,
            created_at: timestamp(row.created_at),
        }
    }
}

/// New relay lease to be recorded in the ledger
#[derive(Debug, Clone)]
pub struct NewLease {
    /// Region the instance is created in
    pub region: String,
    /// Instance plan
    pub instance_type: String,
    /// Hourly price at creation time
    pub hourly_rate: f64,
    /// Unix timestamp the lease was opened
    pub created_at: i64,
}

/// Relay ledger record from database
#[derive(Debug, Clone, FromRow)]
pub struct LeaseRow {
    /// Unique database ID
    pub id: i64,
    /// Provider instance id
    pub instance_id: Option<String>,
    /// Instance label
    pub label: Option<String>,
    /// Region
    pub region: String,
    /// Instance plan
    pub instance_type: String,
    /// Public address
    pub address: Option<String>,
    /// Relay proxy password
    pub relay_secret: Option<String>,
    /// Ledger status (see [`lease_status`])
    pub status: String,
    /// Hourly price at creation time
    pub hourly_rate: f64,
    /// Unix timestamp the lease was opened
    pub created_at: i64,
    /// Unix timestamp the relay became healthy
    pub ready_at: Option<i64>,
    /// Unix timestamp the instance was deleted
    pub destroyed_at: Option<i64>,
    /// Billed minutes (final once destroyed)
    pub billable_minutes: i64,
    /// Last error seen for this lease
    pub last_error: Option<String>,
}

impl LeaseRow {
    /// Lease id
    pub fn lease_id(&self) -> LeaseId {
        LeaseId(self.id)
    }

    /// Creation time
    pub fn created(&self) -> DateTime<Utc> {
        timestamp(self.created_at)
    }
}

/// Alert record from database
#[derive(Debug, Clone, FromRow)]
pub struct AlertRow {
    /// Unique database ID
    pub id: i64,
    /// Alert kind
    pub kind: String,
    /// Message
    pub message: String,
    /// Affected instance
    pub instance_id: Option<String>,
    /// Unix timestamp raised
    pub created_at: i64,
    /// Unix timestamp resolved
    pub resolved_at: Option<i64>,
}

impl From<AlertRow> for RelayAlert {
    fn from(row: AlertRow) -> Self {
        RelayAlert {
            id: row.id,
            kind: row.kind,
            message: row.message,
            instance_id: row.instance_id,
            created_at: timestamp(row.created_at),
            resolved_at: row.resolved_at.map(timestamp),
        }
    }
}

pub(crate) fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Database handle for swipe-dl
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
