//! Core types for swipe-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

macro_rules! sqlite_i64_newtype {
    ($name:ident) => {
        impl $name {
            /// Wrap a raw database id
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

/// Unique identifier for a task
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct TaskId(pub i64);

sqlite_i64_newtype!(TaskId);

/// Identifier of a relay lease in the cost ledger
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct LeaseId(pub i64);

sqlite_i64_newtype!(LeaseId);

/// Task status
///
/// `Complete`, `Ignored` and `Error` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Awaiting an operator decision
    Pending,
    /// Approved; waiting for a relay and submission
    Confirmed,
    /// Handed to the transfer daemon
    Downloading,
    /// Transfer finished
    Complete,
    /// Rejected by the operator
    Ignored,
    /// Failed; see the task's error detail
    Error,
}

impl TaskStatus {
    /// Every status, in lifecycle order
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Confirmed,
        TaskStatus::Downloading,
        TaskStatus::Complete,
        TaskStatus::Ignored,
        TaskStatus::Error,
    ];

    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Confirmed => "CONFIRMED",
            TaskStatus::Downloading => "DOWNLOADING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Ignored => "IGNORED",
            TaskStatus::Error => "ERROR",
        }
    }

    /// Parse the database representation
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// True for statuses with no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Ignored | TaskStatus::Error
        )
    }

    /// Edges of the task state machine
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Ignored)
                | (Pending, Error)
                | (Confirmed, Downloading)
                | (Confirmed, Error)
                | (Downloading, Complete)
                | (Downloading, Error)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator decision on a pending task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Download it
    Confirm,
    /// Drop it
    Ignore,
}

impl Decision {
    /// Status the decision moves a pending task into
    pub fn target_status(&self) -> TaskStatus {
        match self {
            Decision::Confirm => TaskStatus::Confirmed,
            Decision::Ignore => TaskStatus::Ignored,
        }
    }
}

/// A discovered candidate, as delivered by the ingestion process
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct NewTask {
    /// Magnet link or direct URL
    pub uri: String,
    /// Display title
    pub title: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Advertised size in bytes (0 if unknown)
    #[serde(default)]
    pub size_bytes: i64,
    /// Preview image references
    #[serde(default)]
    pub preview_images: Vec<String>,
    /// Source channel
    #[serde(default)]
    pub source_chat_id: Option<i64>,
    /// Source message
    #[serde(default)]
    pub source_msg_id: Option<i64>,
}

/// A reviewable download task
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Task {
    /// Task ID
    pub id: TaskId,
    /// Display title
    pub title: String,
    /// Optional description
    pub description: Option<String>,
    /// Advertised size in bytes
    pub size_bytes: i64,
    /// Preview image references
    pub preview_images: Vec<String>,
    /// Magnet link or direct URL
    pub uri: String,
    /// Current status
    pub status: TaskStatus,
    /// Relay lease held while downloading
    pub lease_id: Option<LeaseId>,
    /// Failure detail for `ERROR` tasks
    pub error: Option<String>,
    /// Source channel
    pub source_chat_id: Option<i64>,
    /// Source message
    pub source_msg_id: Option<i64>,
    /// Remote storage job id
    pub offline_task_id: Option<String>,
    /// Transfer daemon job id
    pub transfer_id: Option<String>,
    /// Ingestion time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Operator confirmation time
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}

/// One page of tasks
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct TaskPage {
    /// Tasks, newest first
    pub tasks: Vec<Task>,
    /// Total tasks matching the filter
    pub total: i64,
    /// Page size used
    pub limit: i64,
    /// Offset used
    pub offset: i64,
}

/// Task counts per status
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StatusCounts {
    /// PENDING tasks
    pub pending: i64,
    /// CONFIRMED tasks
    pub confirmed: i64,
    /// DOWNLOADING tasks
    pub downloading: i64,
    /// COMPLETE tasks
    pub complete: i64,
    /// IGNORED tasks
    pub ignored: i64,
    /// ERROR tasks
    pub error: i64,
}

impl StatusCounts {
    /// Add `count` tasks in `status`
    pub fn add(&mut self, status: TaskStatus, count: i64) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Confirmed => &mut self.confirmed,
            TaskStatus::Downloading => &mut self.downloading,
            TaskStatus::Complete => &mut self.complete,
            TaskStatus::Ignored => &mut self.ignored,
            TaskStatus::Error => &mut self.error,
        };
        *slot += count;
    }
}

/// An entry in a task's audit trail
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditEntry {
    /// Entry ID
    pub id: i64,
    /// Task ID
    pub task_id: TaskId,
    /// Entry kind (`transition`, `stalled`, `resumed`, ...)
    pub kind: String,
    /// Status before, for transitions
    pub from_status: Option<TaskStatus>,
    /// Status after, for transitions
    pub to_status: Option<TaskStatus>,
    /// Free-form detail
    pub detail: Option<String>,
    /// When it happened
    pub created_at: DateTime<Utc>,
}

/// Relay lease state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    /// No instance exists
    #[default]
    Absent,
    /// Instance is being created, booted and probed
    Provisioning,
    /// Relay is healthy and usable
    Active,
    /// Instance is being deleted
    Destroying,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaseState::Absent => "ABSENT",
            LeaseState::Provisioning => "PROVISIONING",
            LeaseState::Active => "ACTIVE",
            LeaseState::Destroying => "DESTROYING",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the relay lease
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct RelayStatus {
    /// Lifecycle state
    pub state: LeaseState,
    /// Ledger id of the current lease
    pub lease_id: Option<LeaseId>,
    /// Provider instance id
    pub instance_id: Option<String>,
    /// Public address of the relay
    pub address: Option<String>,
    /// When the instance was created
    pub created_at: Option<DateTime<Utc>>,
    /// When the relay passed its health probe
    pub ready_at: Option<DateTime<Utc>>,
    /// Seconds since creation
    pub uptime_secs: i64,
    /// Tasks currently holding the lease
    pub holders: Vec<TaskId>,
    /// Minutes billed so far for this lease
    pub billable_minutes: i64,
    /// Cost accrued so far for this lease
    pub estimated_cost: f64,
    /// Instances that could not be deleted and are awaiting retry
    pub destroy_pending: usize,
}

/// Daemon-wide transfer statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TransferStats {
    /// Aggregate download speed in bytes per second
    pub download_speed: u64,
    /// Aggregate upload speed in bytes per second
    pub upload_speed: u64,
    /// Active transfers
    pub num_active: u64,
    /// Waiting transfers
    pub num_waiting: u64,
    /// Stopped transfers
    pub num_stopped: u64,
}

/// Operator alert raised by the relay lease manager
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RelayAlert {
    /// Alert ID
    pub id: i64,
    /// Alert kind (`destroy_failed`, `orphan_found`, ...)
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Affected instance
    pub instance_id: Option<String>,
    /// When it was raised
    pub created_at: DateTime<Utc>,
    /// When it was resolved
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Aggregated view for the operator dashboard
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct DashboardSnapshot {
    /// Task counts per status
    pub counts: StatusCounts,
    /// Relay lease state
    pub relay: RelayStatus,
    /// Transfer daemon statistics (absent if the daemon is unreachable)
    pub transfer: Option<TransferStats>,
    /// Relay spend for the current calendar month
    pub monthly_cost: f64,
    /// Relay minutes billed this month
    pub monthly_minutes: i64,
    /// Unresolved alerts
    pub alerts: Vec<RelayAlert>,
}

/// Result of an emergency destroy
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct EmergencyDestroyReport {
    /// Instances confirmed deleted
    pub destroyed_instances: Vec<String>,
    /// Instances still alive after retries
    pub destroy_pending: Vec<String>,
    /// Tasks moved to ERROR
    pub failed_tasks: Vec<TaskId>,
}

/// Result of probing the live relay on demand
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ProbeReport {
    /// Egress address observed by the probe endpoint
    pub egress_ip: String,
    /// Round-trip time of the probe request
    pub latency_ms: u64,
}

/// A source channel the ingestion process watches
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Channel {
    /// Numeric chat id or `@username`
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the channel is watched
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Event emitted by the orchestrator
///
/// Subscribe via `Orchestrator::subscribe()` or the `/api/v1/events` SSE stream.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new candidate entered the review queue
    TaskEnqueued {
        /// Task ID
        id: TaskId,
        /// Title
        title: String,
    },

    /// A task moved between statuses
    TaskTransitioned {
        /// Task ID
        id: TaskId,
        /// Previous status
        from: TaskStatus,
        /// New status
        to: TaskStatus,
        /// Detail (error message for failures)
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Progress reported by the transfer daemon
    DownloadProgress {
        /// Task ID
        id: TaskId,
        /// Bytes completed
        completed_bytes: u64,
        /// Total bytes (0 until known)
        total_bytes: u64,
        /// Current speed in bytes per second
        speed_bps: u64,
    },

    /// A download stopped making progress
    DownloadStalled {
        /// Task ID
        id: TaskId,
        /// Seconds without progress
        stalled_secs: u64,
    },

    /// Relay lease changed state
    RelayStateChanged {
        /// New state
        state: LeaseState,
        /// Lease id, if one exists
        #[serde(skip_serializing_if = "Option::is_none")]
        lease_id: Option<LeaseId>,
    },

    /// Something needs operator attention
    RelayAlert {
        /// Alert kind
        kind: String,
        /// Message
        message: String,
    },

    /// Operator pressed the emergency stop
    EmergencyDestroy {
        /// Tasks failed as a result
        failed_tasks: Vec<TaskId>,
    },

    /// Orchestrator is shutting down
    Shutdown,
}
