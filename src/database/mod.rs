//! Database layer for mailbridge-sync
//!
//! This module defines the provider store trait and its SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DbError;
use crate::models::{CredentialUpdate, ProviderCredential, ProviderType, SecretFields};

/// Persistence for provider credential records
///
/// Lease and status fields are only ever changed through
/// [`ProviderStore::try_acquire_lease`] and the two terminal writes, each a
/// single statement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderStore: Send + Sync {
    // =========================================================================
    // Provider records
    // =========================================================================

    /// Insert a provider record
    async fn insert_provider(&self, provider: &ProviderCredential) -> Result<(), DbError>;

    /// Get a provider by id
    async fn get_provider(&self, id: &str) -> Result<Option<ProviderCredential>, DbError>;

    /// List every provider record
    async fn list_providers(&self) -> Result<Vec<ProviderCredential>, DbError>;

    /// Delete a provider record
    async fn delete_provider(&self, id: &str) -> Result<(), DbError>;

    /// Active providers of a type, candidates for the next sweep
    async fn find_eligible_providers(
        &self,
        provider_type: ProviderType,
    ) -> Result<Vec<ProviderCredential>, DbError>;

    /// Overwrite the encrypted credential fields that are set in `update`
    async fn update_credentials(&self, id: &str, update: &CredentialUpdate)
        -> Result<(), DbError>;

    /// Apply `update` only if the stored credential columns still equal
    /// `expected`
    ///
    /// Returns false when another writer changed them since they were read.
    async fn replace_credentials(
        &self,
        id: &str,
        expected: &SecretFields,
        update: &CredentialUpdate,
    ) -> Result<bool, DbError>;

    // =========================================================================
    // Lease and sync status
    // =========================================================================

    /// Atomically take the sync lease if it is free or expired
    ///
    /// Returns true iff exactly one row changed.
    async fn try_acquire_lease(
        &self,
        id: &str,
        provider_type: ProviderType,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Terminal success: status `connected`, lease and error cleared
    async fn mark_sync_success(&self, id: &str, synced_at: DateTime<Utc>) -> Result<(), DbError>;

    /// Terminal failure: status `error`, lease cleared, error recorded
    async fn mark_sync_error(
        &self,
        id: &str,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<(), DbError>;
}
