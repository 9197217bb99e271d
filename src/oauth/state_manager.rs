//! OAuth state management for CSRF protection.
//!
//! Each authorization flow gets a random single-use `state` bound to the
//! identifier it was started for.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Pending authorization flow
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub identifier: String,
    pub created_at: DateTime<Utc>,
}

/// Upper bound for how long an authorization state stays valid (one day)
pub const MAX_STATE_EXPIRY_SECONDS: i64 = 86_400;

/// OAuth state manager with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    states: Arc<DashMap<String, StateEntry>>,
    expiry_duration: Duration,
}

impl StateManager {
    /// Create a new state manager
    ///
    /// # Arguments
    /// * `expiry_seconds` - How long states remain valid (default: 600 = 10 minutes),
    ///   clamped to `0..=MAX_STATE_EXPIRY_SECONDS`
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            expiry_duration: Duration::seconds(expiry_seconds.clamp(0, MAX_STATE_EXPIRY_SECONDS)),
        }
    }

    /// Generate a new state token (UUID v4) for `identifier` and store it
    pub fn create_state(&self, identifier: &str) -> String {
        let state = Uuid::new_v4().to_string();
        self.states.insert(
            state.clone(),
            StateEntry {
                identifier: identifier.to_string(),
                created_at: Utc::now(),
            },
        );
        state
    }

    /// Validate and consume a state token
    ///
    /// Returns the entry if known and not expired. The state is removed either
    /// way (single-use).
    pub fn validate_and_consume(&self, state: &str) -> Option<StateEntry> {
        self.validate_and_consume_at(state, Utc::now())
    }

    fn validate_and_consume_at(&self, state: &str, now: DateTime<Utc>) -> Option<StateEntry> {
        let (_, entry) = self.states.remove(state)?;
        if now - entry.created_at > self.expiry_duration {
            return None;
        }
        Some(entry)
    }

    /// Clean up expired states (should be called periodically)
    pub fn cleanup_expired(&self) {
        self.cleanup_expired_at(Utc::now());
    }

    fn cleanup_expired_at(&self, now: DateTime<Utc>) {
        self.states
            .retain(|_, entry| now - entry.created_at <= self.expiry_duration);
    }

    /// Get count of pending states
    pub fn count(&self) -> usize {
        self.states.len()
    }
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!("OAuth state cleanup complete, {} states remaining", manager.count());
    }
}
