//! Task registry: durable task records and their state machine
//!
//! Every mutation goes through a [`TaskGuard`], obtained from
//! [`TaskRegistry::lock`], so at most one mutation per task is in flight at a
//! time. Different tasks never contend. Each applied transition is persisted
//! together with its audit entry and then broadcast as an [`Event`].

use crate::db::{Database, TaskTransition};
use crate::error::{Error, Result, TaskError};
use crate::types::{
    AuditEntry, Decision, Event, LeaseId, NewTask, StatusCounts, Task, TaskId, TaskPage,
    TaskStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, broadcast};

/// Default page size for task listings
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// Largest page size a caller may request
pub const MAX_PAGE_SIZE: i64 = 100;

/// Per-task mutual exclusion
#[derive(Clone, Default)]
pub struct TaskLocks {
    inner: Arc<Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl TaskLocks {
    /// Wait for exclusive access to one task
    pub async fn lock(&self, id: TaskId) -> TaskGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            // Drop slots nobody holds or waits on
            map.retain(|_, slot| Arc::strong_count(slot) > 1);
            map.entry(id).or_default().clone()
        };
        TaskGuard {
            id,
            _guard: slot.lock_owned().await,
        }
    }
}

/// Proof of exclusive access to one task
pub struct TaskGuard {
    id: TaskId,
    _guard: OwnedMutexGuard<()>,
}

impl TaskGuard {
    /// The task this guard covers
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl std::fmt::Debug for TaskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGuard").field("id", &self.id).finish()
    }
}

/// Durable store of tasks and the only place their status changes
#[derive(Clone)]
pub struct TaskRegistry {
    db: Arc<Database>,
    event_tx: broadcast::Sender<Event>,
    locks: TaskLocks,
}

impl TaskRegistry {
    /// Create a registry over a database
    pub fn new(db: Arc<Database>, event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            db,
            event_tx,
            locks: TaskLocks::default(),
        }
    }

    /// Serialize access to one task
    pub async fn lock(&self, id: TaskId) -> TaskGuard {
        self.locks.lock(id).await
    }

    /// Record a new candidate as PENDING
    pub async fn enqueue(&self, candidate: NewTask) -> Result<Task> {
        if candidate.uri.trim().is_empty() {
            return Err(Error::InvalidInput("uri must not be empty".into()));
        }
        if candidate.title.trim().is_empty() {
            return Err(Error::InvalidInput("title must not be empty".into()));
        }

        let id = self.db.insert_task(&candidate).await?;
        let task = self.get(id).await?;

        tracing::info!(task_id = %id, title = %task.title, "task enqueued");
        self.emit(Event::TaskEnqueued {
            id,
            title: task.title.clone(),
        });
        Ok(task)
    }

    /// Get a task by ID
    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.db
            .get_task(id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id: id.get() }.into())
    }

    /// List tasks newest first
    ///
    /// `limit` defaults to [`DEFAULT_PAGE_SIZE`] and is clamped to [`MAX_PAGE_SIZE`].
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<TaskPage> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);
        let (tasks, total) = self.db.list_tasks(status, limit, offset).await?;
        Ok(TaskPage {
            tasks,
            total,
            limit,
            offset,
        })
    }

    /// All tasks in a status, oldest first
    pub async fn with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.db.tasks_with_status(status).await
    }

    /// Task counts per status
    pub async fn counts(&self) -> Result<StatusCounts> {
        self.db.count_tasks_by_status().await
    }

    /// A task's audit trail, oldest first
    pub async fn history(&self, id: TaskId) -> Result<Vec<AuditEntry>> {
        self.get(id).await?;
        self.db.task_events(id).await
    }

    /// Apply the operator's decision to a PENDING task
    pub async fn decide(&self, guard: &TaskGuard, decision: Decision) -> Result<Task> {
        self.transition(guard, decision.target_status(), |_| {})
            .await
    }

    /// CONFIRMED -> DOWNLOADING, recording the lease and both job ids
    pub async fn mark_downloading(
        &self,
        guard: &TaskGuard,
        lease_id: LeaseId,
        offline_task_id: &str,
        transfer_id: &str,
    ) -> Result<Task> {
        self.transition(guard, TaskStatus::Downloading, |t| {
            t.lease_id = Some(lease_id);
            t.offline_task_id = Some(offline_task_id);
            t.transfer_id = Some(transfer_id);
        })
        .await
    }

    /// DOWNLOADING -> COMPLETE
    pub async fn mark_complete(&self, guard: &TaskGuard) -> Result<Task> {
        self.transition(guard, TaskStatus::Complete, |_| {}).await
    }

    /// Any non-terminal status -> ERROR with a detail message
    pub async fn mark_error(&self, guard: &TaskGuard, detail: &str) -> Result<Task> {
        self.transition(guard, TaskStatus::Error, |t| t.error = Some(detail))
            .await
    }

    /// Append a non-transition note to the audit trail
    pub async fn note(&self, guard: &TaskGuard, kind: &str, detail: Option<&str>) -> Result<()> {
        self.db.record_task_event(guard.id(), kind, detail).await
    }

    async fn transition<'a>(
        &self,
        guard: &TaskGuard,
        to: TaskStatus,
        fill: impl FnOnce(&mut TaskTransition<'a>),
    ) -> Result<Task> {
        let id = guard.id();
        let current = self.get(id).await?;

        if !current.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                id: id.get(),
                from: current.status,
                to,
            }
            .into());
        }

        let mut transition = TaskTransition::new(id, current.status, to);
        fill(&mut transition);
        let detail = transition.error.map(str::to_string);

        if !self.db.apply_transition(&transition).await? {
            // Someone changed the row without holding the guard
            let now = self.get(id).await?;
            tracing::warn!(task_id = %id, expected = %current.status, found = %now.status, "task changed underneath transition");
            return Err(TaskError::InvalidTransition {
                id: id.get(),
                from: now.status,
                to,
            }
            .into());
        }

        tracing::info!(
            task_id = %id,
            from = %current.status,
            to = %to,
            detail = detail.as_deref().unwrap_or(""),
            "task transitioned"
        );
        self.emit(Event::TaskTransitioned {
            id,
            from: current.status,
            to,
            detail,
        });

        self.get(id).await
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}
