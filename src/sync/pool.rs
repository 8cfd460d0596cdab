//! Per-provider session pool
//!
//! Sessions are keyed by provider id and remember when they were last
//! used. The scheduler sweeps sessions that sat idle for too long; a
//! disconnected provider's session is removed explicitly.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug)]
struct PooledSession<S> {
    session: S,
    last_used: Instant,
}

/// Owned map of live provider sessions
#[derive(Debug)]
pub struct SessionPool<S> {
    sessions: HashMap<String, PooledSession<S>>,
}

impl<S> Default for SessionPool<S> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<S: Clone> SessionPool<S> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pooled session for `provider_id`, connecting a new one if
    /// none exists
    pub async fn get_or_connect<F, Fut, E>(&mut self, provider_id: &str, connect: F) -> Result<S, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, E>>,
    {
        if let Some(session) = self.get(provider_id) {
            return Ok(session);
        }

        let session = connect().await?;
        debug!(provider_id = %provider_id, "Session connected");
        self.insert(provider_id, session.clone());
        Ok(session)
    }

    /// The pooled session for `provider_id`, marking it used
    pub fn get(&mut self, provider_id: &str) -> Option<S> {
        self.sessions.get_mut(provider_id).map(|entry| {
            entry.last_used = Instant::now();
            entry.session.clone()
        })
    }

    /// Insert or replace the session for `provider_id`
    pub fn insert(&mut self, provider_id: &str, session: S) {
        self.sessions.insert(
            provider_id.to_string(),
            PooledSession {
                session,
                last_used: Instant::now(),
            },
        );
    }

    /// Drop the session for `provider_id`
    pub fn remove(&mut self, provider_id: &str) -> Option<S> {
        self.sessions.remove(provider_id).map(|entry| entry.session)
    }

    /// Drop sessions unused for at least `max_idle`; returns how many
    pub fn sweep_idle(&mut self, max_idle: Duration) -> usize {
        self.sweep_idle_at(Instant::now(), max_idle)
    }

    fn sweep_idle_at(&mut self, now: Instant, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| now.duration_since(entry.last_used) < max_idle);
        before - self.sessions.len()
    }

    /// Whether a session is pooled for `provider_id`
    pub fn contains(&self, provider_id: &str) -> bool {
        self.sessions.contains_key(provider_id)
    }

    /// Number of pooled sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
