//! Provider credential domain models
//!
//! This module defines the connected mail provider record together with
//! its provider type and sync status values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of mail provider an account is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderType {
    /// Google Gmail (OAuth)
    Gmail,
    /// Microsoft Outlook / Office 365 (OAuth)
    Outlook,
    /// Generic SMTP (password)
    Smtp,
}

impl ProviderType {
    /// Whether credentials for this provider are OAuth tokens
    pub fn uses_oauth(&self) -> bool {
        !matches!(self, ProviderType::Smtp)
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::Gmail => write!(f, "GMAIL"),
            ProviderType::Outlook => write!(f, "OUTLOOK"),
            ProviderType::Smtp => write!(f, "SMTP"),
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GMAIL" => Ok(ProviderType::Gmail),
            "OUTLOOK" => Ok(ProviderType::Outlook),
            "SMTP" => Ok(ProviderType::Smtp),
            _ => Err(format!("Invalid provider type: {}", s)),
        }
    }
}

/// Sync status stored on the provider record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatusValue {
    /// Connected and idle
    #[default]
    Connected,
    /// A sync lease is held
    Syncing,
    /// Last sync exhausted its retries
    Error,
    /// User disconnected the provider
    Disconnected,
}

impl std::fmt::Display for SyncStatusValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatusValue::Connected => write!(f, "connected"),
            SyncStatusValue::Syncing => write!(f, "syncing"),
            SyncStatusValue::Error => write!(f, "error"),
            SyncStatusValue::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl std::str::FromStr for SyncStatusValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(SyncStatusValue::Connected),
            "syncing" => Ok(SyncStatusValue::Syncing),
            "error" => Ok(SyncStatusValue::Error),
            "disconnected" => Ok(SyncStatusValue::Disconnected),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}

/// A connected provider account and its encrypted credentials
///
/// The `*_enc` fields hold secret envelopes (or legacy plaintext) produced
/// by [`crate::crypto::SecretCodec`]. The lease is encoded as
/// `sync_status == Syncing` plus `sync_lease_expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredential {
    /// Unique provider id
    pub id: String,

    /// Owning user
    pub user_id: String,

    /// Owning workspace
    pub workspace_id: String,

    /// Mailbox address
    pub email: String,

    /// Provider kind
    pub provider_type: ProviderType,

    /// Encrypted OAuth access token
    pub access_token_enc: Option<String>,

    /// Encrypted OAuth refresh token
    pub refresh_token_enc: Option<String>,

    /// Encrypted SMTP password
    pub password_enc: Option<String>,

    /// When the access token expires
    pub token_expires_at: Option<DateTime<Utc>>,

    /// Inactive providers are never synced
    pub is_active: bool,

    /// Current sync status
    pub sync_status: SyncStatusValue,

    /// Lease expiry while `sync_status` is `Syncing`
    pub sync_lease_expires_at: Option<DateTime<Utc>>,

    /// Last successful sync
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Truncated message of the last terminal failure
    pub last_sync_error: Option<String>,

    /// When the last terminal failure was recorded
    pub last_sync_error_at: Option<DateTime<Utc>>,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

impl ProviderCredential {
    /// Create a new active provider record with no credentials
    pub fn new(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        provider_type: ProviderType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: String::new(),
            workspace_id: workspace_id.into(),
            email: String::new(),
            provider_type,
            access_token_enc: None,
            refresh_token_enc: None,
            password_enc: None,
            token_expires_at: None,
            is_active: true,
            sync_status: SyncStatusValue::Connected,
            sync_lease_expires_at: None,
            last_synced_at: None,
            last_sync_error: None,
            last_sync_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the owning user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Set the mailbox address
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    /// Set encrypted OAuth tokens and their expiry
    pub fn with_tokens(
        mut self,
        access_token_enc: impl Into<String>,
        refresh_token_enc: Option<String>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.access_token_enc = Some(access_token_enc.into());
        self.refresh_token_enc = refresh_token_enc;
        self.token_expires_at = token_expires_at;
        self
    }

    /// Set the encrypted SMTP password
    pub fn with_password(mut self, password_enc: impl Into<String>) -> Self {
        self.password_enc = Some(password_enc.into());
        self
    }

    /// Mark the provider inactive
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Whether a sync lease is held at `now`
    pub fn lease_held_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.sync_lease_expires_at, Some(expires) if expires > now)
    }

    /// The encrypted credential columns as read
    pub fn secret_fields(&self) -> SecretFields {
        SecretFields {
            access_token_enc: self.access_token_enc.clone(),
            refresh_token_enc: self.refresh_token_enc.clone(),
            password_enc: self.password_enc.clone(),
        }
    }
}

/// Snapshot of a record's encrypted credential columns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretFields {
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
    pub password_enc: Option<String>,
}

/// Encrypted credential fields, as written by the token refresher or key rotation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialUpdate {
    /// New encrypted access token
    pub access_token_enc: Option<String>,

    /// New encrypted refresh token
    pub refresh_token_enc: Option<String>,

    /// New encrypted password
    pub password_enc: Option<String>,

    /// New token expiry; `None` leaves the stored value unchanged
    pub token_expires_at: Option<DateTime<Utc>>,
}
