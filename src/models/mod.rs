//! Domain models for mailbridge-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod notification;
pub mod provider;

// Re-export commonly used types
pub use notification::{truncate_message, SyncFailureNotification, MAX_ERROR_MESSAGE_CHARS};
pub use provider::{
    CredentialUpdate, ProviderCredential, ProviderType, SecretFields, SyncStatusValue,
};
