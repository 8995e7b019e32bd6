//! Key/value settings and the source channel list.

use crate::error::DatabaseError;
use crate::types::Channel;
use crate::{Error, Result};
use sqlx::SqliteConnection;

use super::Database;

/// Settings key holding the JSON channel list
pub const CHANNELS_KEY: &str = "source_channels";

impl Database {
    /// Get a setting value
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get setting {}: {}",
                    key, e
                )))
            })
    }

    /// Insert or replace a setting value
    pub async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;
        Self::write_setting(&mut conn, key, value).await
    }

    async fn write_setting(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write setting {}: {}",
                key, e
            )))
        })?;

        Ok(())
    }

    /// The source channel list
    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        match self.get_setting(CHANNELS_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Read-modify-write the channel list in one transaction
    ///
    /// `edit` returns the value to hand back to the caller, or an error that aborts
    /// the change.
    async fn edit_channels<T>(
        &self,
        edit: impl FnOnce(&mut Vec<Channel>) -> Result<T>,
    ) -> Result<T> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(CHANNELS_KEY)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read channels: {}",
                    e
                )))
            })?;

        let mut channels: Vec<Channel> = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        let out = edit(&mut channels)?;
        let encoded = serde_json::to_string(&channels)?;
        Self::write_setting(&mut *tx, CHANNELS_KEY, &encoded).await?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit channels: {}",
                e
            )))
        })?;

        Ok(out)
    }

    /// Replace the whole channel list; ids must be unique
    pub async fn replace_channels(&self, replacement: Vec<Channel>) -> Result<Vec<Channel>> {
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = replacement.iter().find(|c| !seen.insert(c.id.as_str())) {
            return Err(Error::InvalidInput(format!("channel {} listed twice", dup.id)));
        }
        self.edit_channels(|channels| {
            *channels = replacement.clone();
            Ok(replacement)
        })
        .await
    }

    /// Add a channel; fails if one with the same id exists
    pub async fn add_channel(&self, channel: Channel) -> Result<Channel> {
        self.edit_channels(|channels| {
            if channels.iter().any(|c| c.id == channel.id) {
                return Err(Error::Duplicate(format!("channel {}", channel.id)));
            }
            channels.push(channel.clone());
            Ok(channel)
        })
        .await
    }

    /// Update a channel's name and enabled flag
    pub async fn update_channel(
        &self,
        id: &str,
        name: Option<String>,
        enabled: Option<bool>,
    ) -> Result<Channel> {
        self.edit_channels(|channels| {
            let channel = channels
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| Error::NotFound(format!("channel {id}")))?;
            if let Some(name) = name {
                channel.name = Some(name);
            }
            if let Some(enabled) = enabled {
                channel.enabled = enabled;
            }
            Ok(channel.clone())
        })
        .await
    }

    /// Remove a channel
    pub async fn remove_channel(&self, id: &str) -> Result<()> {
        self.edit_channels(|channels| {
            let before = channels.len();
            channels.retain(|c| c.id != id);
            if channels.len() == before {
                return Err(Error::NotFound(format!("channel {id}")));
            }
            Ok(())
        })
        .await
    }
}
