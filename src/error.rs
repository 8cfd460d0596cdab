//! Application error types for mailbridge-sync
//!
//! This module defines common error types used throughout the application.
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Keyring and secret envelope errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CryptoError {
    /// Missing or invalid keyring configuration
    #[error("Encryption configuration error: {0}")]
    Configuration(String),

    /// Ciphertext could not be authenticated by any candidate key
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Synchronization-related errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Neither an access token nor a refresh token (or password) is stored
    #[error("Missing credentials for provider {0}")]
    MissingCredentials(String),

    /// OAuth refresh token exchange failed
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// Stored secret could not be decrypted
    #[error("Credential error: {0}")]
    Crypto(#[from] CryptoError),

    /// Persistence layer failed while syncing
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Provider sync call failed in a way worth retrying
    #[error("Transient sync failure: {0}")]
    Transient(String),

    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Rate limited by upstream
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Server error
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Unauthorized
    #[error("Unauthorized")]
    Unauthorized,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid data received
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Resource not found
    #[error("Resource not found")]
    NotFound,
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

/// Application-level error type
///
/// Aggregates the domain-specific error types for the binary and tooling.
#[derive(Debug, Error)]
pub enum AppError {
    /// Keyring or envelope error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            // Nothing changes between attempts for these
            SyncError::MissingCredentials(_) => false,
            SyncError::Crypto(_) => false,

            SyncError::TokenRefresh(_) => true,
            SyncError::Persistence(_) => true,
            SyncError::Transient(_) => true,
            SyncError::NetworkTimeout => true,
            SyncError::ConnectionRefused => true,
            SyncError::RateLimited(_) => true,
            SyncError::ServerError(_) => true,
            SyncError::Unauthorized => true,
            SyncError::Network(_) => true,
            SyncError::InvalidData(_) => true,
            SyncError::NotFound => true,
        }
    }
}
