//! Sync scheduler for connected mail providers
//!
//! Every tick sweeps the configured provider types. For each eligible
//! provider the scheduler takes the sync lease, waits a random jitter, runs
//! the bounded retry loop (credential, then provider sync) and finishes
//! with exactly one terminal status write. Terminal failures also publish a
//! best-effort user notification.
//!
//! Each provider is handled in its own task, so a panic while syncing one
//! provider cannot abort the sweep for the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::provider::{ProviderSyncer, SyncSummary};
use super::retry::RetryPolicy;
use crate::config::SchedulerConfig;
use crate::database::ProviderStore;
use crate::error::SyncError;
use crate::lease::LeaseCoordinator;
use crate::models::{
    truncate_message, ProviderCredential, ProviderType, SyncFailureNotification,
    MAX_ERROR_MESSAGE_CHARS,
};
use crate::notify::NotificationPublisher;
use crate::oauth::TokenRefresher;

/// Final state of one provider in a sweep
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutcome {
    /// Another holder owns an unexpired lease, or the provider is inactive
    LeaseDenied,
    /// Synced; `attempts` includes the successful one
    Succeeded { attempts: u32 },
    /// Gave up after `attempts`; status is now `error`
    Failed { attempts: u32, error: SyncError },
    /// The provider's task panicked
    Crashed,
}

/// Result of sweeping one provider type
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    /// Provider type swept
    pub provider_type: ProviderType,
    /// When the sweep started
    pub started_at: DateTime<Utc>,
    /// When the sweep finished
    pub finished_at: DateTime<Utc>,
    /// Outcome per provider id, in sweep order
    pub outcomes: Vec<(String, ProviderOutcome)>,
}

impl SweepReport {
    fn count(&self, pred: impl Fn(&ProviderOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, ProviderOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ProviderOutcome::Failed { .. }))
    }

    pub fn lease_denied(&self) -> usize {
        self.count(|o| matches!(o, ProviderOutcome::LeaseDenied))
    }

    pub fn crashed(&self) -> usize {
        self.count(|o| matches!(o, ProviderOutcome::Crashed))
    }

    /// Outcome for one provider id
    pub fn outcome(&self, provider_id: &str) -> Option<&ProviderOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == provider_id)
            .map(|(_, o)| o)
    }
}

/// Collaborators the scheduler drives
#[derive(Clone)]
pub struct SyncServices {
    pub store: Arc<dyn ProviderStore>,
    pub leases: LeaseCoordinator,
    pub refresher: TokenRefresher,
    pub syncer: Arc<dyn ProviderSyncer>,
    pub notifier: Arc<dyn NotificationPublisher>,
}

/// Everything a provider task needs, shared across spawned tasks
struct SyncContext {
    services: SyncServices,
    policy: RetryPolicy,
}

/// Manual sync request
struct ManualSyncRequest {
    provider_id: String,
    response: mpsc::Sender<Result<ProviderOutcome, SyncError>>,
}

/// Periodic sync scheduler for provider accounts
pub struct SyncScheduler {
    config: SchedulerConfig,
    ctx: Arc<SyncContext>,
    reports: Arc<RwLock<HashMap<ProviderType, SweepReport>>>,
    shutdown_rx: broadcast::Receiver<()>,
    manual_sync_rx: mpsc::Receiver<ManualSyncRequest>,
    manual_sync_tx: mpsc::Sender<ManualSyncRequest>,
}

impl SyncScheduler {
    /// Create a new sync scheduler
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler configuration; retry bounds are clamped
    /// * `services` - Store, lease, token, sync and notification collaborators
    /// * `shutdown_rx` - Broadcast receiver for shutdown signal
    pub fn new(
        config: SchedulerConfig,
        services: SyncServices,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (manual_sync_tx, manual_sync_rx) = mpsc::channel(32);
        let policy = RetryPolicy::from_config(&config);

        Self {
            config,
            ctx: Arc::new(SyncContext { services, policy }),
            reports: Arc::new(RwLock::new(HashMap::new())),
            shutdown_rx,
            manual_sync_rx,
            manual_sync_tx,
        }
    }

    /// Get a handle for triggering manual syncs
    pub fn manual_sync_handle(&self) -> ManualSyncHandle {
        ManualSyncHandle {
            tx: self.manual_sync_tx.clone(),
        }
    }

    /// Latest sweep report per provider type
    pub async fn get_status(&self) -> HashMap<ProviderType, SweepReport> {
        self.reports.read().await.clone()
    }

    /// Retry policy in effect
    pub fn policy(&self) -> RetryPolicy {
        self.ctx.policy
    }

    /// Sweep every eligible provider of one type
    pub async fn sweep(&self, provider_type: ProviderType) -> Result<SweepReport, SyncError> {
        let started_at = Utc::now();
        let providers = self
            .ctx
            .services
            .store
            .find_eligible_providers(provider_type)
            .await?;

        debug!(
            provider_type = %provider_type,
            eligible = providers.len(),
            "Starting sweep"
        );

        let mut outcomes = Vec::with_capacity(providers.len());
        for provider in providers {
            let id = provider.id.clone();
            let outcome = Self::process_isolated(self.ctx.clone(), provider).await;
            outcomes.push((id, outcome));
        }

        let report = SweepReport {
            provider_type,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };

        info!(
            provider_type = %provider_type,
            succeeded = report.succeeded(),
            failed = report.failed(),
            lease_denied = report.lease_denied(),
            crashed = report.crashed(),
            "Sweep finished"
        );

        self.reports
            .write()
            .await
            .insert(provider_type, report.clone());
        Ok(report)
    }

    /// Sweep all configured provider types, then drop idle sessions
    pub async fn run_tick(&self) {
        for provider_type in &self.config.provider_types {
            if let Err(e) = self.sweep(*provider_type).await {
                error!(provider_type = %provider_type, error = %e, "Sweep failed");
            }
        }

        let max_idle = Duration::from_secs(self.config.session_idle_secs);
        self.ctx.services.syncer.sweep_idle(max_idle).await;
    }

    /// Run the scheduler until shutdown is signaled
    pub async fn run(mut self) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            interval_secs = period.as_secs(),
            provider_types = ?self.config.provider_types,
            max_retries = self.ctx.policy.max_retries(),
            "Starting sync scheduler"
        );

        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping sync scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
                Some(request) = self.manual_sync_rx.recv() => {
                    self.handle_manual_sync(request).await;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn handle_manual_sync(&self, request: ManualSyncRequest) {
        info!(provider_id = %request.provider_id, "Manual sync triggered");

        let result = match self
            .ctx
            .services
            .store
            .get_provider(&request.provider_id)
            .await
        {
            Ok(Some(provider)) => Ok(Self::process_isolated(self.ctx.clone(), provider).await),
            Ok(None) => {
                warn!(
                    provider_id = %request.provider_id,
                    "Manual sync requested for unknown provider"
                );
                Err(SyncError::NotFound)
            }
            Err(e) => Err(SyncError::from(e)),
        };

        let _ = request.response.send(result).await;
    }

    /// Handle one provider in its own task
    async fn process_isolated(ctx: Arc<SyncContext>, provider: ProviderCredential) -> ProviderOutcome {
        let record = provider.clone();
        let task_ctx = ctx.clone();

        match tokio::spawn(async move { task_ctx.process_provider(provider).await }).await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!(provider_id = %record.id, error = %join_error, "Provider sync task crashed");
                // Releases the lease rather than waiting for it to expire
                ctx.record_failure(&record, 1, "sync task crashed").await;
                ProviderOutcome::Crashed
            }
        }
    }
}

impl SyncContext {
    async fn process_provider(&self, provider: ProviderCredential) -> ProviderOutcome {
        let services = &self.services;

        if !services
            .leases
            .acquire_lease(&provider.id, provider.provider_type, None)
            .await
        {
            debug!(provider_id = %provider.id, "Lease denied, skipping");
            return ProviderOutcome::LeaseDenied;
        }

        let jitter = self.policy.jitter();
        if !jitter.is_zero() {
            tokio::time::sleep(jitter).await;
        }

        let provider_ref = &provider;
        let outcome = self
            .policy
            .execute(move |attempt| async move { self.attempt_sync(provider_ref, attempt).await })
            .await;

        match outcome.result {
            Ok(summary) => {
                info!(
                    provider_id = %provider.id,
                    provider_type = %provider.provider_type,
                    attempts = outcome.attempts,
                    messages_synced = summary.messages_synced,
                    "Provider synced"
                );
                if let Err(e) = services.store.mark_sync_success(&provider.id, Utc::now()).await {
                    error!(provider_id = %provider.id, error = %e, "Failed to record sync success");
                }
                ProviderOutcome::Succeeded {
                    attempts: outcome.attempts,
                }
            }
            Err(err) => {
                self.record_failure(&provider, outcome.attempts, &err.to_string())
                    .await;
                ProviderOutcome::Failed {
                    attempts: outcome.attempts,
                    error: err,
                }
            }
        }
    }

    async fn attempt_sync(
        &self,
        provider: &ProviderCredential,
        attempt: u32,
    ) -> Result<SyncSummary, SyncError> {
        debug!(provider_id = %provider.id, attempt, "Sync attempt");

        // Earlier attempts may have refreshed and persisted new tokens
        let reloaded;
        let provider = if attempt > 1 {
            reloaded = self
                .services
                .store
                .get_provider(&provider.id)
                .await?
                .ok_or(SyncError::NotFound)?;
            &reloaded
        } else {
            provider
        };

        let credential = self.services.refresher.resolve_credential(provider).await?;
        self.services.syncer.sync(provider, &credential).await
    }

    async fn record_failure(&self, provider: &ProviderCredential, attempts: u32, error: &str) {
        let failed_at = Utc::now();
        let message = truncate_message(error, MAX_ERROR_MESSAGE_CHARS);

        error!(
            provider_id = %provider.id,
            provider_type = %provider.provider_type,
            attempts,
            error = %message,
            "Provider sync failed"
        );

        if let Err(e) = self
            .services
            .store
            .mark_sync_error(&provider.id, &message, failed_at)
            .await
        {
            error!(provider_id = %provider.id, error = %e, "Failed to record sync error");
        }

        let notification =
            SyncFailureNotification::for_provider(provider, attempts, &message, failed_at);
        if let Err(e) = self.services.notifier.publish(&notification).await {
            warn!(provider_id = %provider.id, error = %e, "Failed to publish sync failure notification");
        }
    }
}

/// Handle for triggering manual syncs
#[derive(Clone)]
pub struct ManualSyncHandle {
    tx: mpsc::Sender<ManualSyncRequest>,
}

impl ManualSyncHandle {
    /// Sync one provider now, through the same lease gate as the sweep
    pub async fn trigger_sync(&self, provider_id: &str) -> Result<ProviderOutcome, SyncError> {
        let (response_tx, mut response_rx) = mpsc::channel(1);

        self.tx
            .send(ManualSyncRequest {
                provider_id: provider_id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| SyncError::Network("Scheduler not running".to_string()))?;

        response_rx
            .recv()
            .await
            .ok_or_else(|| SyncError::Network("No response from scheduler".to_string()))?
    }
}
