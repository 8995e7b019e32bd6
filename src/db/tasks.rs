//! Task CRUD, compare-and-set transitions and the audit trail.

use crate::error::{DatabaseError, TaskError};
use crate::types::{AuditEntry, NewTask, StatusCounts, Task, TaskId, TaskStatus};
use crate::{Error, Result};

use super::{AuditRow, Database, TaskRow, TaskTransition};

const TASK_COLUMNS: &str = r#"
    id, uri, uri_key, title, description, size_bytes, preview_images,
    source_chat_id, source_msg_id, status, lease_id, offline_task_id,
    transfer_id, error_detail, created_at, updated_at, confirmed_at, completed_at
"#;

/// Normalized identity of a resource
///
/// Magnet links collapse to their BitTorrent info-hash (`btih:<lowercase>`), so the
/// same torrent re-posted with a different display name or tracker list is still a
/// duplicate. Anything else is keyed by its trimmed URI.
pub(crate) fn resource_key(uri: &str) -> String {
    let trimmed = uri.trim();
    let is_magnet = trimmed
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("magnet:"));

    if is_magnet && let Ok(parsed) = url::Url::parse(trimmed) {
        for (key, value) in parsed.query_pairs() {
            if key != "xt" {
                continue;
            }
            let lower = value.to_ascii_lowercase();
            if let Some(hash) = lower.strip_prefix("urn:btih:") {
                return format!("btih:{hash}");
            }
        }
    }

    trimmed.to_string()
}

impl Database {
    /// Insert a new PENDING task
    ///
    /// Fails with [`TaskError::DuplicateResource`] if an equivalent resource was
    /// ingested before, whatever that task's current status.
    pub async fn insert_task(&self, task: &NewTask) -> Result<TaskId> {
        let now = chrono::Utc::now().timestamp();
        let key = resource_key(&task.uri);
        let images = serde_json::to_string(&task.preview_images)?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                uri, uri_key, title, description, size_bytes, preview_images,
                source_chat_id, source_msg_id, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri_key) DO NOTHING
            "#,
        )
        .bind(task.uri.trim())
        .bind(&key)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.size_bytes)
        .bind(&images)
        .bind(task.source_chat_id)
        .bind(task.source_msg_id)
        .bind(TaskStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert task: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            let existing_id: i64 = sqlx::query_scalar("SELECT id FROM tasks WHERE uri_key = ?")
                .bind(&key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to look up duplicate task: {}",
                        e
                    )))
                })?;
            return Err(TaskError::DuplicateResource {
                existing_id,
                uri_key: key,
            }
            .into());
        }

        Ok(TaskId(result.last_insert_rowid()))
    }

    /// Get a task by ID
    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get task: {}",
                e
            )))
        })?;

        row.map(Task::try_from).transpose()
    }

    /// List tasks newest first, optionally filtered by status
    ///
    /// Returns the page and the total number of matching tasks.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Task>, i64)> {
        let (rows, total) = match status {
            Some(status) => {
                let rows = sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
                ))
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await;
                let total = sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM tasks WHERE status = ?",
                )
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await;
                (rows, total)
            }
            None => {
                let rows = sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await;
                let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks")
                    .fetch_one(&self.pool)
                    .await;
                (rows, total)
            }
        };

        let rows = rows.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list tasks: {}",
                e
            )))
        })?;
        let total = total.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count tasks: {}",
                e
            )))
        })?;

        let tasks = rows
            .into_iter()
            .map(Task::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((tasks, total))
    }

    /// All tasks in a status, oldest first
    pub async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list tasks by status: {}",
                e
            )))
        })?;

        rows.into_iter().map(Task::try_from).collect()
    }

    /// Task counts per status
    pub async fn count_tasks_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to count tasks: {}",
                        e
                    )))
                })?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match TaskStatus::parse(&status) {
                Some(status) => counts.add(status, count),
                None => tracing::warn!(status = %status, "ignoring unknown task status in counts"),
            }
        }
        Ok(counts)
    }

    /// Apply a status change if the task is still in `transition.from`
    ///
    /// The update and its audit entry commit together. Returns `false` without
    /// writing anything when the stored status no longer matches.
    pub async fn apply_transition(&self, transition: &TaskTransition<'_>) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let confirmed_at = (transition.to == TaskStatus::Confirmed).then_some(transition.at);
        let completed_at = (transition.to == TaskStatus::Complete).then_some(transition.at);

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = ?,
                lease_id = ?,
                error_detail = COALESCE(?, error_detail),
                offline_task_id = COALESCE(?, offline_task_id),
                transfer_id = COALESCE(?, transfer_id),
                confirmed_at = COALESCE(?, confirmed_at),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(transition.to.as_str())
        .bind(transition.lease_id)
        .bind(transition.error)
        .bind(transition.offline_task_id)
        .bind(transition.transfer_id)
        .bind(confirmed_at)
        .bind(completed_at)
        .bind(transition.at)
        .bind(transition.id)
        .bind(transition.from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update task status: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            let _ = tx.rollback().await;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, kind, from_status, to_status, detail, created_at)
            VALUES (?, 'transition', ?, ?, ?, ?)
            "#,
        )
        .bind(transition.id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.error)
        .bind(transition.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record task event: {}",
                e
            )))
        })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit transition: {}",
                e
            )))
        })?;

        Ok(true)
    }

    /// Append a non-transition entry (stall, resume, ...) to a task's audit trail
    pub async fn record_task_event(&self, id: TaskId, kind: &str, detail: Option<&str>) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, kind, detail, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(kind)
        .bind(detail)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record task event: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// A task's audit trail, oldest first
    pub async fn task_events(&self, id: TaskId) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, task_id, kind, from_status, to_status, detail, created_at
            FROM task_events
            WHERE task_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list task events: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }
}
