//! Provider sync collaborator
//!
//! The scheduler owns leases, retries and status writes; the actual mailbox
//! sync is delegated to a [`ProviderSyncer`]. [`HttpProviderSyncer`] calls
//! the mail sync API and keeps one pooled session per provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::pool::SessionPool;
use crate::config::SyncApiConfig;
use crate::error::SyncError;
use crate::models::ProviderCredential;
use crate::oauth::Credential;

/// Default wait when a 429 carries no usable Retry-After header
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 30;

/// What one successful provider sync did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Messages fetched or updated
    #[serde(default)]
    pub messages_synced: u64,
}

/// Runs the provider-specific part of a sync
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderSyncer: Send + Sync {
    /// Sync one provider's mailbox with the given credential
    async fn sync(
        &self,
        provider: &ProviderCredential,
        credential: &Credential,
    ) -> Result<SyncSummary, SyncError>;

    /// Drop sessions unused for at least `max_idle`; returns how many
    async fn sweep_idle(&self, max_idle: Duration) -> usize;

    /// Drop any session held for `provider_id`
    async fn disconnect(&self, provider_id: &str);
}

/// A pooled connection to the sync API for one provider
#[derive(Debug, Clone)]
struct SyncSession {
    client: Client,
    credential: Credential,
}

/// [`ProviderSyncer`] backed by the mail sync HTTP API
///
/// Calls `POST {base_url}/providers/{type}/{id}/sync`, authenticating with
/// the provider credential (bearer token, or basic auth for SMTP).
pub struct HttpProviderSyncer {
    base_url: String,
    timeout: Duration,
    sessions: Mutex<SessionPool<SyncSession>>,
}

impl HttpProviderSyncer {
    /// Create a syncer for the sync API at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            sessions: Mutex::new(SessionPool::new()),
        }
    }

    /// Create a syncer from configuration; `None` if no base URL is set
    pub fn from_config(config: &SyncApiConfig) -> Option<Self> {
        config
            .base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| Self::new(url, Duration::from_secs(config.timeout_secs)))
    }

    /// Number of pooled sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn session_for(
        &self,
        provider: &ProviderCredential,
        credential: &Credential,
    ) -> Result<SyncSession, SyncError> {
        let mut pool = self.sessions.lock().await;

        // A refreshed token or changed password invalidates the session
        if let Some(existing) = pool.get(&provider.id) {
            if &existing.credential == credential {
                return Ok(existing);
            }
            pool.remove(&provider.id);
        }

        let timeout = self.timeout;
        pool.get_or_connect(&provider.id, || async move {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| SyncError::Network(e.to_string()))?;
            Ok(SyncSession {
                client,
                credential: credential.clone(),
            })
        })
        .await
    }
}

#[async_trait]
impl ProviderSyncer for HttpProviderSyncer {
    async fn sync(
        &self,
        provider: &ProviderCredential,
        credential: &Credential,
    ) -> Result<SyncSummary, SyncError> {
        let session = self.session_for(provider, credential).await?;
        let url = format!(
            "{}/providers/{}/{}/sync",
            self.base_url,
            provider.provider_type.to_string().to_lowercase(),
            provider.id
        );

        let request = session.client.post(&url).json(&serde_json::json!({
            "provider_id": provider.id,
            "workspace_id": provider.workspace_id,
            "email": provider.email,
        }));
        let request = match credential {
            Credential::AccessToken(token) => request.bearer_auth(token),
            Credential::Password(password) => request.basic_auth(&provider.email, Some(password)),
        };

        debug!(provider_id = %provider.id, url = %url, "Sending sync request");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::NetworkTimeout
            } else if e.is_connect() {
                SyncError::ConnectionRefused
            } else {
                SyncError::Network(e.to_string())
            }
        })?;

        match response.status() {
            status if status.is_success() => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| SyncError::Network(e.to_string()))?;
                if body.trim().is_empty() {
                    return Ok(SyncSummary::default());
                }
                serde_json::from_str(&body).map_err(|e| SyncError::InvalidData(e.to_string()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS);

                warn!(provider_id = %provider.id, retry_after = wait, "Rate limited by sync API");
                Err(SyncError::RateLimited(wait))
            }
            StatusCode::NOT_FOUND => Err(SyncError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(provider_id = %provider.id, status = ?response.status(), "Unauthorized");
                // Credential was rejected; reconnect on the next attempt
                self.disconnect(&provider.id).await;
                Err(SyncError::Unauthorized)
            }
            status if status.is_server_error() => {
                Err(SyncError::ServerError(status.as_u16()))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SyncError::Transient(format!(
                    "unexpected HTTP {}: {}",
                    status.as_u16(),
                    body
                )))
            }
        }
    }

    async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let removed = self.sessions.lock().await.sweep_idle(max_idle);
        if removed > 0 {
            debug!(removed, "Swept idle provider sessions");
        }
        removed
    }

    async fn disconnect(&self, provider_id: &str) {
        if self.sessions.lock().await.remove(provider_id).is_some() {
            debug!(provider_id = %provider_id, "Session closed");
        }
    }
}
