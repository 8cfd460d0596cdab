//! Sync failure notifications
//!
//! Publishing is best effort: the scheduler logs and drops publish errors.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::models::SyncFailureNotification;

/// Notification delivery errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NotifyError {
    /// Request could not be sent
    #[error("Notification request failed: {0}")]
    Request(String),

    /// Endpoint answered with a non-success status
    #[error("Notification rejected: HTTP {0}")]
    Rejected(u16),
}

/// Delivers sync failure notifications to users
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Publish one notification
    async fn publish(&self, notification: &SyncFailureNotification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl NotificationPublisher for LogNotifier {
    async fn publish(&self, notification: &SyncFailureNotification) -> Result<(), NotifyError> {
        warn!(
            provider_id = %notification.provider_id,
            provider_type = %notification.provider_type,
            workspace_id = %notification.workspace_id,
            user_id = %notification.user_id,
            attempts = notification.attempts,
            error = %notification.error,
            "Sync failure notification"
        );
        Ok(())
    }
}

/// POSTs notifications as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier for `url`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationPublisher for WebhookNotifier {
    async fn publish(&self, notification: &SyncFailureNotification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }

        debug!(provider_id = %notification.provider_id, "Failure notification delivered");
        Ok(())
    }
}

/// Build the publisher selected by configuration
///
/// A webhook URL selects [`WebhookNotifier`]; otherwise notifications are
/// only logged.
pub fn from_config(
    config: &NotificationConfig,
) -> Result<Box<dyn NotificationPublisher>, NotifyError> {
    match config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Ok(Box::new(WebhookNotifier::new(
            url,
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Box::new(LogNotifier)),
    }
}
