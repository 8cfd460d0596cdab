//! mailbridge-sync - Background mailbox sync for connected email providers
//!
//! This crate keeps provider credentials encrypted at rest under a rotatable
//! keyring, gates each provider sync behind a database lease, and retries
//! failed syncs with bounded backoff before recording a terminal status and
//! notifying the owner.

pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod lease;
pub mod models;
pub mod notify;
pub mod oauth;
pub mod sync;
pub mod telemetry;
