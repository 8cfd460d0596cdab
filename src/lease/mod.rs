//! Sync lease coordination
//!
//! A provider may only be synced by the process that holds its lease. The
//! lease lives on the provider row and is taken with one conditional
//! update, so any number of scheduler instances can race for it safely.
//! There is no release operation: the terminal status writes clear it, and
//! an abandoned lease simply expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::{DEFAULT_LEASE_TTL_MS, MAX_LEASE_TTL_MS, MIN_LEASE_TTL_MS};
use crate::database::ProviderStore;
use crate::models::ProviderType;

/// Clamp a lease TTL to [1 min, 1 h], defaulting to 9 minutes
pub fn normalize_ttl(ttl: Option<Duration>) -> Duration {
    let ms = ttl
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(DEFAULT_LEASE_TTL_MS)
        .clamp(MIN_LEASE_TTL_MS, MAX_LEASE_TTL_MS);
    Duration::from_millis(ms)
}

/// Grants exclusive, expiring sync leases on provider records
#[derive(Clone)]
pub struct LeaseCoordinator {
    store: Arc<dyn ProviderStore>,
    default_ttl: Option<Duration>,
}

impl LeaseCoordinator {
    /// Create a coordinator; `default_ttl` is used when a caller passes none
    pub fn new(store: Arc<dyn ProviderStore>, default_ttl: Option<Duration>) -> Self {
        Self { store, default_ttl }
    }

    /// Try to take the lease for one provider
    ///
    /// Returns false when another holder has an unexpired lease, the
    /// provider is inactive or missing, or the store fails.
    pub async fn acquire_lease(
        &self,
        provider_id: &str,
        provider_type: ProviderType,
        ttl: Option<Duration>,
    ) -> bool {
        self.acquire_lease_at(provider_id, provider_type, ttl, Utc::now())
            .await
    }

    /// [`acquire_lease`](Self::acquire_lease) evaluated at a given instant
    pub async fn acquire_lease_at(
        &self,
        provider_id: &str,
        provider_type: ProviderType,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> bool {
        let ttl = normalize_ttl(ttl.or(self.default_ttl));
        let expires_at = match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now + ttl,
            Err(_) => return false,
        };

        match self
            .store
            .try_acquire_lease(provider_id, provider_type, now, expires_at)
            .await
        {
            Ok(granted) => {
                debug!(
                    provider_id = %provider_id,
                    provider_type = %provider_type,
                    granted,
                    expires_at = %expires_at,
                    "Lease attempt"
                );
                granted
            }
            Err(e) => {
                warn!(
                    provider_id = %provider_id,
                    provider_type = %provider_type,
                    error = %e,
                    "Lease acquisition failed, treating as denied"
                );
                false
            }
        }
    }
}
