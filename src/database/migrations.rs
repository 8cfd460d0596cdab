//! Database migrations for mailbridge-sync
//!
//! This module contains SQL migrations for the SQLite database schema.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings
//! (`YYYY-MM-DDTHH:MM:SS.mmmZ`) so that lexical comparison in SQL matches
//! chronological order.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Connected mail provider accounts
CREATE TABLE IF NOT EXISTS provider_credentials (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL DEFAULT '',
    workspace_id TEXT NOT NULL,
    email TEXT NOT NULL DEFAULT '',
    provider_type TEXT NOT NULL CHECK (provider_type IN ('GMAIL', 'OUTLOOK', 'SMTP')),
    access_token_enc TEXT,
    refresh_token_enc TEXT,
    password_enc TEXT,
    token_expires_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    sync_status TEXT NOT NULL DEFAULT 'connected',
    sync_lease_expires_at TEXT,
    last_synced_at TEXT,
    last_sync_error TEXT,
    last_sync_error_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_provider_type_active ON provider_credentials(provider_type, is_active);
CREATE INDEX IF NOT EXISTS idx_provider_workspace ON provider_credentials(workspace_id);
"#;
