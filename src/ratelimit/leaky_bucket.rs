//! Leaky bucket rate limiter.
//!
//! Each identity has a bucket holding a fractional fill level. The level
//! leaks at `limit / window` units per second; a request is admitted when the
//! drained level is below the limit, adding one unit. Cheaper than the
//! sliding window (one small record per identity) at the cost of precision.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, trace, warn};

use super::RateLimiter;
use crate::clock::{Clock, SystemClock};
use crate::error::{QuotaError, Result};
use crate::store::{leaky_key, record_ttl_secs, BucketState, CounterStore};

/// Drain `level`, last written at `last_update_ms`, up to `now_ms`.
///
/// The leak rate is `limit` units per `window_ms`. Clock skew that puts
/// `now_ms` before the last update leaks nothing. The result is never
/// negative.
pub(crate) fn drain(level: f64, last_update_ms: i64, now_ms: i64, limit: u64, window_ms: u64) -> f64 {
    let elapsed_secs = (now_ms - last_update_ms).max(0) as f64 / 1000.0;
    let leak_per_sec = limit as f64 / (window_ms as f64 / 1000.0);
    (level - elapsed_secs * leak_per_sec).max(0.0)
}

/// Approximate limiter backed by one (level, last_update) hash per identity.
pub struct LeakyBucket {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl LeakyBucket {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current drained level from raw stored fields, or `None` when the
    /// record is missing or unreadable.
    fn current_level(state: &BucketState, now_ms: i64, limit: u64, window_ms: u64) -> Option<f64> {
        let level = state.level.as_deref()?.parse::<f64>().ok()?;
        let last_update = state.last_update.as_deref()?.parse::<i64>().ok()?;
        if !level.is_finite() {
            return None;
        }
        Some(drain(level, last_update, now_ms, limit, window_ms))
    }
}

#[async_trait]
impl RateLimiter for LeakyBucket {
    async fn allow(&self, identity: &str, limit: u64, window: Duration) -> Result<bool> {
        let key = leaky_key(identity);
        let now_ms = self.clock.now_millis();
        let window_ms = window.as_millis() as u64;

        trace!(identity = %identity, limit = limit, window_ms = window_ms, "Checking leaky bucket");

        let allowed = self
            .store
            .leaky_bucket_admit(&key, now_ms, limit, window_ms, record_ttl_secs(window_ms))
            .await
            .map_err(|e| {
                error!(identity = %identity, error = %e, "Leaky bucket rate limit check failed");
                QuotaError::store("rate limit check failed", e)
            })?;

        if !allowed {
            debug!(identity = %identity, limit = limit, "Rate limit exceeded (leaky bucket)");
        }

        Ok(allowed)
    }

    async fn remaining(&self, identity: &str, limit: u64, window: Duration) -> Result<u64> {
        let key = leaky_key(identity);
        let now_ms = self.clock.now_millis();

        let state = self
            .store
            .leaky_bucket_state(&key)
            .await
            .map_err(|e| QuotaError::store("failed to get bucket state", e))?;

        if state.level.is_none() || state.last_update.is_none() {
            return Ok(limit);
        }

        match Self::current_level(&state, now_ms, limit, window.as_millis() as u64) {
            Some(level) => Ok(limit.saturating_sub(level.round() as u64)),
            None => {
                warn!(identity = %identity, state = ?state, "Unreadable bucket record, assuming full capacity");
                Ok(limit)
            }
        }
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.store
            .delete(&leaky_key(identity))
            .await
            .map_err(|e| QuotaError::store("failed to reset rate limit", e))
    }
}
