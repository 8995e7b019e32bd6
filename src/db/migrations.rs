//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // Foreign keys guard task -> lease references; WAL keeps readers off the writer
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: Create initial schema
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v1");

        // Partial failures must not leave the DB half-migrated
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            Self::create_relay_leases_schema(conn).await?;
            Self::create_tasks_schema(conn).await?;
            Self::create_audit_schema(conn).await?;
            Self::create_alerts_table(conn).await?;
            Self::create_settings_table(conn).await?;
            Self::create_runtime_state_table(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v1: {}",
                            e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("Database migration v1 complete");
        Ok(())
    }

    /// Execute one DDL statement, labelling failures with `what`
    async fn ddl(conn: &mut SqliteConnection, what: &str, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create {}: {}",
                what, e
            )))
        })?;
        Ok(())
    }

    /// Create the relay cost ledger
    async fn create_relay_leases_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            "relay_leases table",
            r#"
            CREATE TABLE relay_leases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT,
                label TEXT,
                region TEXT NOT NULL,
                instance_type TEXT NOT NULL,
                address TEXT,
                relay_secret TEXT,
                status TEXT NOT NULL,
                hourly_rate REAL NOT NULL,
                created_at INTEGER NOT NULL,
                ready_at INTEGER,
                destroyed_at INTEGER,
                billable_minutes INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .await?;

        Self::ddl(
            conn,
            "index",
            "CREATE INDEX idx_relay_leases_status ON relay_leases(status)",
        )
        .await?;

        Self::ddl(
            conn,
            "index",
            "CREATE INDEX idx_relay_leases_created_at ON relay_leases(created_at)",
        )
        .await
    }

    /// Create tasks table and its indexes
    async fn create_tasks_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            "tasks table",
            r#"
            CREATE TABLE tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uri TEXT NOT NULL,
                uri_key TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                preview_images TEXT NOT NULL DEFAULT '[]',
                source_chat_id INTEGER,
                source_msg_id INTEGER,
                status TEXT NOT NULL,
                lease_id INTEGER REFERENCES relay_leases(id),
                offline_task_id TEXT,
                transfer_id TEXT,
                error_detail TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                confirmed_at INTEGER,
                completed_at INTEGER,
                CHECK (lease_id IS NULL OR status = 'DOWNLOADING')
            )
            "#,
        )
        .await?;

        Self::ddl(
            conn,
            "index",
            "CREATE INDEX idx_tasks_status ON tasks(status)",
        )
        .await?;

        Self::ddl(
            conn,
            "index",
            "CREATE INDEX idx_tasks_created_at ON tasks(created_at DESC, id DESC)",
        )
        .await?;

        Self::ddl(
            conn,
            "index",
            "CREATE INDEX idx_tasks_lease_id ON tasks(lease_id)",
        )
        .await
    }

    /// Create the per-task audit trail
    async fn create_audit_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            "task_events table",
            r#"
            CREATE TABLE task_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                from_status TEXT,
                to_status TEXT,
                detail TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .await?;

        Self::ddl(
            conn,
            "index",
            "CREATE INDEX idx_task_events_task_id ON task_events(task_id, id)",
        )
        .await
    }

    /// Create operator alerts table
    async fn create_alerts_table(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            "relay_alerts table",
            r#"
            CREATE TABLE relay_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                instance_id TEXT,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER
            )
            "#,
        )
        .await
    }

    /// Create key/value settings table
    async fn create_settings_table(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            "settings table",
            r#"
            CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .await
    }

    /// Create runtime state table for shutdown tracking
    async fn create_runtime_state_table(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            "runtime_state table",
            r#"
            CREATE TABLE runtime_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .await?;

        // Unclean until the first set_clean_shutdown()
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES ('clean_shutdown', 'false', ?)
            "#,
        )
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to initialize runtime_state: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record a migration version
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
