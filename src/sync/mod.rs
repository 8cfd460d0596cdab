//! Provider synchronization
//!
//! This module drives periodic mailbox sync for connected provider accounts
//! with lease gating, bounded retry and failure notification.
//!
//! # Components
//!
//! - [`retry`]: pure retry decision and the linear-backoff retry policy
//! - [`pool`]: per-provider session pool with idle sweeping
//! - [`provider`]: the provider sync collaborator and its HTTP implementation
//! - [`scheduler`]: the sweep loop, manual triggers and terminal status writes
//!
//! # Example
//!
//! ```ignore
//! use mailbridge_sync::sync::{SyncScheduler, SyncServices};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! let scheduler = SyncScheduler::new(config.scheduler.clone(), services, shutdown_rx);
//! let manual = scheduler.manual_sync_handle();
//! tokio::spawn(scheduler.run());
//!
//! let outcome = manual.trigger_sync("provider-id").await?;
//! ```

pub mod pool;
pub mod provider;
pub mod retry;
pub mod scheduler;

// Re-export main types for convenience
pub use pool::SessionPool;
pub use provider::{HttpProviderSyncer, ProviderSyncer, SyncSummary};
pub use retry::{decide, RetryDecision, RetryOutcome, RetryPolicy};
pub use scheduler::{
    ManualSyncHandle, ProviderOutcome, SweepReport, SyncScheduler, SyncServices,
};
