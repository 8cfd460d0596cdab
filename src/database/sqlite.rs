//! SQLite implementation of the ProviderStore trait
//!
//! This module provides a SQLite-based implementation of the ProviderStore
//! trait using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row};
use tokio_rusqlite::Connection;

use super::migrations::CREATE_SCHEMA;
use super::ProviderStore;
use crate::error::DbError;
use crate::models::{
    CredentialUpdate, ProviderCredential, ProviderType, SecretFields, SyncStatusValue,
};

const PROVIDER_COLUMNS: &str = r#"
    id, user_id, workspace_id, email, provider_type,
    access_token_enc, refresh_token_enc, password_enc, token_expires_at,
    is_active, sync_status, sync_lease_expires_at, last_synced_at,
    last_sync_error, last_sync_error_at, created_at, updated_at
"#;

/// Duplicate ids and unknown provider types surface as constraint violations
fn constraint_error(err: rusqlite::Error) -> DbError {
    match err {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            DbError::ConstraintViolation(message.unwrap_or_else(|| code.to_string()))
        }
        other => DbError::Sqlite(other),
    }
}

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;

        // Run migrations
        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok::<_, rusqlite::Error>(())
        })
        .await
        .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }
}

#[async_trait]
impl ProviderStore for SqliteDatabase {
    // =========================================================================
    // Provider records
    // =========================================================================

    async fn insert_provider(&self, provider: &ProviderCredential) -> Result<(), DbError> {
        let p = provider.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO provider_credentials ({}) VALUES \
                         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                        PROVIDER_COLUMNS
                    ),
                    rusqlite::params![
                        p.id,
                        p.user_id,
                        p.workspace_id,
                        p.email,
                        p.provider_type.to_string(),
                        p.access_token_enc,
                        p.refresh_token_enc,
                        p.password_enc,
                        p.token_expires_at.map(format_datetime),
                        p.is_active,
                        p.sync_status.to_string(),
                        p.sync_lease_expires_at.map(format_datetime),
                        p.last_synced_at.map(format_datetime),
                        p.last_sync_error,
                        p.last_sync_error_at.map(format_datetime),
                        format_datetime(p.created_at),
                        format_datetime(p.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(constraint_error)?;

        Ok(())
    }

    async fn get_provider(&self, id: &str) -> Result<Option<ProviderCredential>, DbError> {
        let id = id.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM provider_credentials WHERE id = ?1",
                    PROVIDER_COLUMNS
                ))?;

                let result = stmt.query_row([&id], row_to_provider).optional()?;
                Ok::<_, rusqlite::Error>(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn list_providers(&self) -> Result<Vec<ProviderCredential>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM provider_credentials ORDER BY created_at, id",
                    PROVIDER_COLUMNS
                ))?;

                let providers = stmt
                    .query_map([], row_to_provider)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(providers)
            })
            .await
            .map_err(Into::into)
    }

    async fn delete_provider(&self, id: &str) -> Result<(), DbError> {
        let id = id.to_string();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute("DELETE FROM provider_credentials WHERE id = ?1", [&id])?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn replace_credentials(
        &self,
        id: &str,
        expected: &SecretFields,
        update: &CredentialUpdate,
    ) -> Result<bool, DbError> {
        let id = id.to_string();
        let expected = expected.clone();
        let update = update.clone();
        let now = format_datetime(Utc::now());

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE provider_credentials SET
                        access_token_enc = COALESCE(?5, access_token_enc),
                        refresh_token_enc = COALESCE(?6, refresh_token_enc),
                        password_enc = COALESCE(?7, password_enc),
                        token_expires_at = COALESCE(?8, token_expires_at),
                        updated_at = ?9
                    WHERE id = ?1
                      AND access_token_enc IS ?2
                      AND refresh_token_enc IS ?3
                      AND password_enc IS ?4
                    "#,
                    rusqlite::params![
                        id,
                        expected.access_token_enc,
                        expected.refresh_token_enc,
                        expected.password_enc,
                        update.access_token_enc,
                        update.refresh_token_enc,
                        update.password_enc,
                        update.token_expires_at.map(format_datetime),
                        now,
                    ],
                )?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        Ok(rows_affected == 1)
    }

    async fn find_eligible_providers(
        &self,
        provider_type: ProviderType,
    ) -> Result<Vec<ProviderCredential>, DbError> {
        let provider_type = provider_type.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM provider_credentials \
                     WHERE provider_type = ?1 AND is_active = 1 \
                     ORDER BY id",
                    PROVIDER_COLUMNS
                ))?;

                let providers = stmt
                    .query_map([&provider_type], row_to_provider)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(providers)
            })
            .await
            .map_err(Into::into)
    }

    async fn update_credentials(
        &self,
        id: &str,
        update: &CredentialUpdate,
    ) -> Result<(), DbError> {
        let id = id.to_string();
        let update = update.clone();
        let now = format_datetime(Utc::now());

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE provider_credentials SET
                        access_token_enc = COALESCE(?2, access_token_enc),
                        refresh_token_enc = COALESCE(?3, refresh_token_enc),
                        password_enc = COALESCE(?4, password_enc),
                        token_expires_at = COALESCE(?5, token_expires_at),
                        updated_at = ?6
                    WHERE id = ?1
                    "#,
                    rusqlite::params![
                        id,
                        update.access_token_enc,
                        update.refresh_token_enc,
                        update.password_enc,
                        update.token_expires_at.map(format_datetime),
                        now,
                    ],
                )?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    // =========================================================================
    // Lease and sync status
    // =========================================================================

    async fn try_acquire_lease(
        &self,
        id: &str,
        provider_type: ProviderType,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let id = id.to_string();
        let provider_type = provider_type.to_string();
        let now = format_datetime(now);
        let expires_at = format_datetime(expires_at);

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE provider_credentials SET
                        sync_status = 'syncing',
                        sync_lease_expires_at = ?3,
                        updated_at = ?4
                    WHERE id = ?1
                      AND provider_type = ?2
                      AND is_active = 1
                      AND (sync_lease_expires_at IS NULL OR sync_lease_expires_at < ?4)
                    "#,
                    rusqlite::params![id, provider_type, expires_at, now],
                )?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        Ok(rows_affected == 1)
    }

    async fn mark_sync_success(&self, id: &str, synced_at: DateTime<Utc>) -> Result<(), DbError> {
        let id = id.to_string();
        let synced_at = format_datetime(synced_at);

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE provider_credentials SET
                        sync_status = 'connected',
                        sync_lease_expires_at = NULL,
                        last_synced_at = ?2,
                        last_sync_error = NULL,
                        last_sync_error_at = NULL,
                        updated_at = ?2
                    WHERE id = ?1
                    "#,
                    rusqlite::params![id, synced_at],
                )?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn mark_sync_error(
        &self,
        id: &str,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let id = id.to_string();
        let error = error.to_string();
        let failed_at = format_datetime(failed_at);

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE provider_credentials SET
                        sync_status = 'error',
                        sync_lease_expires_at = NULL,
                        last_sync_error = ?2,
                        last_sync_error_at = ?3,
                        updated_at = ?3
                    WHERE id = ?1
                    "#,
                    rusqlite::params![id, error, failed_at],
                )?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }
}

/// Format a timestamp as fixed-width RFC 3339 UTC with milliseconds
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

/// Parse a text column with `FromStr`, reporting failures as conversion errors
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn row_to_provider(row: &Row<'_>) -> rusqlite::Result<ProviderCredential> {
    let created_at = parse_datetime(row.get(15)?).unwrap_or_else(Utc::now);
    Ok(ProviderCredential {
        id: row.get(0)?,
        user_id: row.get(1)?,
        workspace_id: row.get(2)?,
        email: row.get(3)?,
        provider_type: parse_column::<ProviderType>(row, 4)?,
        access_token_enc: row.get(5)?,
        refresh_token_enc: row.get(6)?,
        password_enc: row.get(7)?,
        token_expires_at: parse_datetime(row.get(8)?),
        is_active: row.get(9)?,
        sync_status: parse_column::<SyncStatusValue>(row, 10)?,
        sync_lease_expires_at: parse_datetime(row.get(11)?),
        last_synced_at: parse_datetime(row.get(12)?),
        last_sync_error: row.get(13)?,
        last_sync_error_at: parse_datetime(row.get(14)?),
        created_at,
        updated_at: parse_datetime(row.get(16)?).unwrap_or(created_at),
    })
}
