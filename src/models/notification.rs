//! Sync failure notification payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProviderCredential, ProviderType};

/// Maximum characters of an error message stored or sent to users
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Notification sent to a user after a provider exhausted its sync retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailureNotification {
    /// Provider that failed
    pub provider_id: String,

    /// Provider kind
    pub provider_type: ProviderType,

    /// Owning workspace
    pub workspace_id: String,

    /// Recipient
    pub user_id: String,

    /// Attempts made before giving up
    pub attempts: u32,

    /// Truncated error message
    pub error: String,

    /// Human-readable message for the user
    pub message: String,

    /// When the failure was recorded
    pub failed_at: DateTime<Utc>,
}

impl SyncFailureNotification {
    /// Build the notification for a provider that gave up after `attempts`
    pub fn for_provider(
        provider: &ProviderCredential,
        attempts: u32,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id: provider.id.clone(),
            provider_type: provider.provider_type,
            workspace_id: provider.workspace_id.clone(),
            user_id: provider.user_id.clone(),
            attempts,
            error: truncate_message(error, MAX_ERROR_MESSAGE_CHARS),
            message: format!(
                "Syncing your {} account failed after {} attempt(s). We will retry automatically.",
                provider.provider_type, attempts
            ),
            failed_at,
        }
    }
}

/// Truncate a message to at most `max_chars` characters
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
