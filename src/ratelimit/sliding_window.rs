//! Sliding window rate limiter.
//!
//! Every admitted request is recorded in a sorted set scored by its arrival
//! time. A check purges entries older than the window, counts the rest and
//! records the new request only if the count is under the limit, all in one
//! atomic store call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, trace};

use super::RateLimiter;
use crate::clock::{Clock, SystemClock};
use crate::error::{QuotaError, Result};
use crate::store::{record_ttl_secs, sliding_key, CounterStore};

/// Precise limiter backed by one sorted set per identity.
pub struct SlidingWindow {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

/// Sorted set member for a request admitted at `now_ms`.
///
/// The random suffix keeps requests that arrive in the same millisecond
/// from collapsing into one entry.
fn request_member(now_ms: i64) -> String {
    format!("{}-{:08x}", now_ms, rand::random::<u32>())
}

fn window_start(now_ms: i64, window: Duration) -> i64 {
    now_ms - window.as_millis() as i64
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    async fn allow(&self, identity: &str, limit: u64, window: Duration) -> Result<bool> {
        let key = sliding_key(identity);
        let now_ms = self.clock.now_millis();
        let window_ms = window.as_millis() as u64;

        trace!(identity = %identity, limit = limit, window_ms = window_ms, "Checking sliding window");

        let allowed = self
            .store
            .sliding_window_admit(
                &key,
                now_ms,
                window_start(now_ms, window),
                limit,
                record_ttl_secs(window_ms),
                &request_member(now_ms),
            )
            .await
            .map_err(|e| {
                error!(identity = %identity, error = %e, "Sliding window rate limit check failed");
                QuotaError::store("rate limit check failed", e)
            })?;

        if !allowed {
            debug!(identity = %identity, limit = limit, "Rate limit exceeded");
        }

        Ok(allowed)
    }

    async fn remaining(&self, identity: &str, limit: u64, window: Duration) -> Result<u64> {
        let key = sliding_key(identity);
        let now_ms = self.clock.now_millis();

        let count = self
            .store
            .sliding_window_count(&key, window_start(now_ms, window))
            .await
            .map_err(|e| QuotaError::store("failed to get remaining requests", e))?;

        Ok(limit.saturating_sub(count))
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.store
            .delete(&sliding_key(identity))
            .await
            .map_err(|e| QuotaError::store("failed to reset rate limit", e))
    }
}
