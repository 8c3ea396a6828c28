//! Rate limiter service.
//!
//! Front door for callers: resolves the effective limit for an identity
//! (local cache, then the shared store, then the caller's fallback) and
//! delegates the decision to the configured algorithm.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use super::cache::LimitCache;
use super::{Algorithm, LeakyBucket, RateLimiter, SlidingWindow};
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::error::{QuotaError, Result};
use crate::store::{config_key, CounterStore};
use crate::sweeper::Sweeper;

/// Per-identity rate limiting with dynamic overrides.
///
/// The algorithm is chosen once at construction. When the local cache is
/// enabled a background sweeper is started, so construction must happen
/// inside a Tokio runtime.
pub struct RateLimiterService {
    limiter: Box<dyn RateLimiter>,
    store: Arc<dyn CounterStore>,
    algorithm: Algorithm,
    window: Duration,
    override_ttl: Duration,
    cache: Option<Arc<LimitCache>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RateLimiterService {
    /// Create a service using the system clock.
    pub fn new(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a service reading time from `clock`.
    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        config: &RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter: Box<dyn RateLimiter> = match config.algorithm {
            Algorithm::SlidingWindow => {
                Box::new(SlidingWindow::with_clock(store.clone(), clock.clone()))
            }
            Algorithm::LeakyBucket => Box::new(LeakyBucket::with_clock(store.clone(), clock.clone())),
        };

        let (cache, sweeper) = if config.enable_local_cache {
            let cache = Arc::new(LimitCache::new(config.local_cache_ttl(), clock));
            let sweeper = cache.spawn_sweeper(config.cache_sweep_interval());
            (Some(cache), Some(sweeper))
        } else {
            (None, None)
        };

        info!(
            algorithm = %config.algorithm,
            window_ms = config.window_size_ms,
            local_cache = config.enable_local_cache,
            "Rate limiter service initialized"
        );

        Self {
            limiter,
            store,
            algorithm: config.algorithm,
            window: config.window(),
            override_ttl: config.local_cache_ttl(),
            cache,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Check whether a request from `identity` is allowed, recording it if so.
    ///
    /// `limit` applies unless an override exists for the identity. A store
    /// failure is returned as an error; deciding whether to fail open or
    /// closed is up to the caller.
    #[instrument(level = "debug", skip(self), fields(algorithm = %self.algorithm))]
    pub async fn rate_limit(&self, identity: &str, limit: u64) -> Result<bool> {
        validate_identity(identity)?;
        let effective = self.effective_limit(identity, limit).await;
        self.limiter.allow(identity, effective, self.window).await
    }

    /// Number of requests `identity` may still make in the current window.
    pub async fn remaining(&self, identity: &str, limit: u64) -> Result<u64> {
        validate_identity(identity)?;
        let effective = self.effective_limit(identity, limit).await;
        self.limiter.remaining(identity, effective, self.window).await
    }

    /// Store a limit override for `identity`.
    ///
    /// The override expires after the cache TTL. This instance's cache is
    /// refreshed immediately; other instances see it on their next miss.
    pub async fn set_user_limit(&self, identity: &str, limit: u64) -> Result<()> {
        validate_identity(identity)?;
        if limit == 0 {
            return Err(QuotaError::InvalidLimit(limit));
        }

        self.store
            .set_with_ttl(&config_key(identity), &limit.to_string(), self.override_ttl)
            .await
            .map_err(|e| QuotaError::store("failed to set user limit", e))?;

        if let Some(cache) = &self.cache {
            cache.put(identity, limit);
        }

        info!(identity = %identity, limit = limit, "User rate limit updated");
        Ok(())
    }

    /// Read the override for `identity` straight from the store.
    pub async fn user_limit(&self, identity: &str) -> Result<Option<u64>> {
        validate_identity(identity)?;
        self.lookup_override(identity).await
    }

    /// Remove the override for `identity` from the store and this instance's
    /// cache.
    pub async fn clear_user_limit(&self, identity: &str) -> Result<()> {
        validate_identity(identity)?;

        self.store
            .delete(&config_key(identity))
            .await
            .map_err(|e| QuotaError::store("failed to clear user limit", e))?;

        if let Some(cache) = &self.cache {
            cache.remove(identity);
        }

        info!(identity = %identity, "User rate limit cleared");
        Ok(())
    }

    /// Forget recorded traffic for `identity`. Overrides are kept.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        validate_identity(identity)?;
        self.limiter.reset(identity).await?;
        debug!(identity = %identity, "Rate limit reset");
        Ok(())
    }

    /// The limit that applies to `identity` when the caller offers `fallback`.
    ///
    /// Lookup failures are logged and resolve to `fallback`.
    pub async fn effective_limit(&self, identity: &str, fallback: u64) -> u64 {
        if let Some(limit) = self.cache.as_ref().and_then(|cache| cache.get(identity)) {
            trace!(identity = %identity, limit = limit, "Limit override served from cache");
            return limit;
        }

        match self.lookup_override(identity).await {
            Ok(Some(limit)) => {
                if let Some(cache) = &self.cache {
                    cache.put(identity, limit);
                }
                limit
            }
            Ok(None) => fallback,
            Err(e) => {
                warn!(
                    identity = %identity,
                    fallback_limit = fallback,
                    error = %e,
                    "Failed to get user limit, using provided limit"
                );
                fallback
            }
        }
    }

    async fn lookup_override(&self, identity: &str) -> Result<Option<u64>> {
        let raw = self
            .store
            .get(&config_key(identity))
            .await
            .map_err(|e| QuotaError::store("failed to get user limit", e))?;

        match raw {
            None => Ok(None),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(limit) if limit > 0 => Ok(Some(limit)),
                _ => Err(QuotaError::Config(format!(
                    "invalid limit value {:?} for {}",
                    raw, identity
                ))),
            },
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// The local override cache, if enabled.
    pub fn cache(&self) -> Option<&Arc<LimitCache>> {
        self.cache.as_ref()
    }

    /// Stop the background cache sweeper. Safe to call more than once.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
            info!("Rate limiter service stopped");
        }
    }
}

fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() {
        return Err(QuotaError::InvalidIdentity);
    }
    Ok(())
}
