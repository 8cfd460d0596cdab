//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use mailbridge_sync::config::{OAuthConfig, OAuthProviderConfig, SchedulerConfig};
use mailbridge_sync::crypto::{Keyring, SecretCodec};
use mailbridge_sync::database::{ProviderStore, SqliteDatabase};
use mailbridge_sync::lease::LeaseCoordinator;
use mailbridge_sync::models::{ProviderCredential, ProviderType};
use mailbridge_sync::notify::{LogNotifier, NotificationPublisher, WebhookNotifier};
use mailbridge_sync::oauth::{HttpTokenExchanger, TokenRefresher};
use mailbridge_sync::sync::{HttpProviderSyncer, SyncScheduler, SyncServices};

/// Key material used by integration tests
pub const TEST_KEY: &str = "integration-test-key-0123456789abcdef";

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Codec over a single-key keyring
pub fn create_test_codec() -> SecretCodec {
    let keyring = Keyring::from_material("k1", &[("k1", TEST_KEY)]).expect("valid test keyring");
    SecretCodec::new(Arc::new(keyring))
}

/// Insert an active Gmail provider with an encrypted access token
pub async fn insert_gmail_provider(
    db: &SqliteDatabase,
    codec: &SecretCodec,
    id: &str,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> ProviderCredential {
    let provider = ProviderCredential::new(id, "ws-1", ProviderType::Gmail)
        .with_user("user-1")
        .with_email(format!("{}@example.com", id))
        .with_tokens(
            codec.encrypt(access_token).expect("encrypt access token"),
            refresh_token.map(|t| codec.encrypt(t).expect("encrypt refresh token")),
            expires_at,
        );
    db.insert_provider(&provider)
        .await
        .expect("Failed to insert provider");
    provider
}

/// Scheduler configuration with no jitter and a short backoff
pub fn create_scheduler_config(max_retries: u32) -> SchedulerConfig {
    SchedulerConfig {
        max_retries,
        backoff_base_ms: 50,
        max_jitter_ms: 0,
        interval_secs: 3600,
        session_idle_secs: 900,
        provider_types: vec![ProviderType::Gmail],
    }
}

/// OAuth configuration pointing Gmail at `token_url`
pub fn create_oauth_config(token_url: &str) -> OAuthConfig {
    let mut providers = HashMap::new();
    providers.insert(
        ProviderType::Gmail,
        OAuthProviderConfig {
            token_url: token_url.to_string(),
            client_id: "test-client".to_string(),
            client_secret: Some("test-secret".to_string()),
            timeout_secs: 5,
        },
    );
    OAuthConfig { providers }
}

/// Wire the real HTTP collaborators against test endpoints
///
/// `webhook_url` selects a [`WebhookNotifier`]; otherwise failures are only logged.
pub fn create_test_services(
    db: Arc<SqliteDatabase>,
    codec: SecretCodec,
    sync_api_url: &str,
    token_url: &str,
    webhook_url: Option<&str>,
) -> SyncServices {
    let store: Arc<dyn ProviderStore> = db;
    let exchanger = HttpTokenExchanger::new(&create_oauth_config(token_url))
        .expect("Failed to create token exchanger");
    let notifier: Arc<dyn NotificationPublisher> = match webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url, Duration::from_secs(5)).expect("Failed to create notifier"),
        ),
        None => Arc::new(LogNotifier),
    };

    SyncServices {
        store: Arc::clone(&store),
        leases: LeaseCoordinator::new(Arc::clone(&store), None),
        refresher: TokenRefresher::new(Arc::clone(&store), codec, Arc::new(exchanger)),
        syncer: Arc::new(HttpProviderSyncer::new(sync_api_url, Duration::from_secs(5))),
        notifier,
    }
}

/// Create a scheduler and the sender that stops it
pub fn create_test_scheduler(
    services: SyncServices,
    max_retries: u32,
) -> (SyncScheduler, broadcast::Sender<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = SyncScheduler::new(create_scheduler_config(max_retries), services, shutdown_rx);
    (scheduler, shutdown_tx)
}
