//! Relay cost ledger and operator alerts.

use crate::error::DatabaseError;
use crate::types::{LeaseId, RelayAlert};
use crate::{Error, Result};

use super::{AlertRow, Database, LeaseRow, NewLease, lease_status};

const LEASE_COLUMNS: &str = r#"
    id, instance_id, label, region, instance_type, address, relay_secret, status,
    hourly_rate, created_at, ready_at, destroyed_at, billable_minutes, last_error
"#;

impl Database {
    /// Open a ledger row for a lease that is about to be provisioned
    pub async fn insert_lease(&self, lease: &NewLease) -> Result<LeaseId> {
        let result = sqlx::query(
            r#"
            INSERT INTO relay_leases (region, instance_type, status, hourly_rate, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&lease.region)
        .bind(&lease.instance_type)
        .bind(lease_status::PROVISIONING)
        .bind(lease.hourly_rate)
        .bind(lease.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert lease: {}",
                e
            )))
        })?;

        Ok(LeaseId(result.last_insert_rowid()))
    }

    /// Record the provider instance backing a lease
    pub async fn set_lease_instance(
        &self,
        id: LeaseId,
        instance_id: &str,
        label: &str,
        relay_secret: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE relay_leases SET instance_id = ?, label = ?, relay_secret = ? WHERE id = ?",
        )
        .bind(instance_id)
        .bind(label)
        .bind(relay_secret)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record lease instance: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Mark a lease healthy
    pub async fn set_lease_active(&self, id: LeaseId, address: &str, ready_at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE relay_leases SET status = ?, address = ?, ready_at = ? WHERE id = ?",
        )
        .bind(lease_status::ACTIVE)
        .bind(address)
        .bind(ready_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to activate lease: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Checkpoint the billed minutes of a live lease
    pub async fn update_lease_minutes(&self, id: LeaseId, minutes: i64) -> Result<()> {
        sqlx::query("UPDATE relay_leases SET billable_minutes = ? WHERE id = ?")
            .bind(minutes)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update lease minutes: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Close a lease: `destroyed`, `failed` or `destroy_pending`
    pub async fn close_lease(
        &self,
        id: LeaseId,
        status: &str,
        destroyed_at: Option<i64>,
        minutes: i64,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE relay_leases SET
                status = ?,
                destroyed_at = ?,
                billable_minutes = ?,
                last_error = COALESCE(?, last_error)
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(destroyed_at)
        .bind(minutes)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to close lease: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Get a ledger row by ID
    pub async fn get_lease(&self, id: LeaseId) -> Result<Option<LeaseRow>> {
        sqlx::query_as::<_, LeaseRow>(&format!(
            "SELECT {LEASE_COLUMNS} FROM relay_leases WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get lease: {}",
                e
            )))
        })
    }

    /// Ledger rows that may still have a live instance behind them
    pub async fn open_leases(&self) -> Result<Vec<LeaseRow>> {
        sqlx::query_as::<_, LeaseRow>(&format!(
            "SELECT {LEASE_COLUMNS} FROM relay_leases WHERE status IN (?, ?, ?) ORDER BY id ASC"
        ))
        .bind(lease_status::PROVISIONING)
        .bind(lease_status::ACTIVE)
        .bind(lease_status::DESTROY_PENDING)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list open leases: {}",
                e
            )))
        })
    }

    /// Most recent ledger rows, newest first
    pub async fn recent_leases(&self, limit: i64) -> Result<Vec<LeaseRow>> {
        sqlx::query_as::<_, LeaseRow>(&format!(
            "SELECT {LEASE_COLUMNS} FROM relay_leases ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list leases: {}",
                e
            )))
        })
    }

    /// Minutes and cost recorded for leases opened since `since`
    ///
    /// `exclude` skips one lease (the live one, whose usage the caller computes fresh).
    pub async fn lease_usage_since(
        &self,
        since: i64,
        exclude: Option<LeaseId>,
    ) -> Result<(i64, f64)> {
        let (minutes, cost): (Option<i64>, Option<f64>) = sqlx::query_as(
            r#"
            SELECT SUM(billable_minutes), SUM(billable_minutes * hourly_rate / 60.0)
            FROM relay_leases
            WHERE created_at >= ? AND (? IS NULL OR id != ?)
            "#,
        )
        .bind(since)
        .bind(exclude)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to sum lease usage: {}",
                e
            )))
        })?;

        Ok((minutes.unwrap_or(0), cost.unwrap_or(0.0)))
    }

    /// Raise an operator alert
    pub async fn insert_alert(
        &self,
        kind: &str,
        message: &str,
        instance_id: Option<&str>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO relay_alerts (kind, message, instance_id, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(kind)
        .bind(message)
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert alert: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Unresolved alerts, newest first
    pub async fn open_alerts(&self) -> Result<Vec<RelayAlert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT id, kind, message, instance_id, created_at, resolved_at
            FROM relay_alerts
            WHERE resolved_at IS NULL
            ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list alerts: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(RelayAlert::from).collect())
    }

    /// Resolve one alert; returns false if it does not exist or was already resolved
    pub async fn resolve_alert(&self, id: i64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE relay_alerts SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to resolve alert: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Resolve every open alert about an instance
    pub async fn resolve_alerts_for_instance(&self, instance_id: &str) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE relay_alerts SET resolved_at = ? WHERE instance_id = ? AND resolved_at IS NULL",
        )
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to resolve alerts: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }
}
