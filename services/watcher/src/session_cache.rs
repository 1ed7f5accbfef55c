//! A value that goes stale after a fixed window.
//!
//! Callers pass the current instant explicitly so freshness can be tested
//! without waiting.

use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct Expiring<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
}

impl<T> Expiring<T> {
    pub fn new(value: T, stored_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            stored_at,
            ttl,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }

    /// The value, if still fresh at `now`.
    pub fn get(&self, now: Instant) -> Option<&T> {
        self.is_fresh(now).then_some(&self.value)
    }
}
