//! Rate limiting algorithms and the service that fronts them.

mod cache;
pub(crate) mod leaky_bucket;
mod service;
mod sliding_window;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use cache::{CachedLimit, LimitCache};
pub use leaky_bucket::LeakyBucket;
pub use service::RateLimiterService;
pub use sliding_window::SlidingWindow;

/// Trait for rate limiting algorithms.
///
/// Implementations keep their state in the shared counter store, so any
/// number of service instances can share one limiter.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record a request for `identity` if it fits within `limit` requests per
    /// `window`. Returns `true` if the request is allowed.
    async fn allow(&self, identity: &str, limit: u64, window: Duration) -> Result<bool>;

    /// How many more requests `identity` could make right now.
    async fn remaining(&self, identity: &str, limit: u64, window: Duration) -> Result<u64>;

    /// Forget all recorded traffic for `identity`.
    async fn reset(&self, identity: &str) -> Result<()>;
}

/// The counting algorithm a service instance uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Exact count of requests in the trailing window
    #[default]
    SlidingWindow,
    /// Decaying fill level with a constant leak rate
    LeakyBucket,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            "leaky_bucket" => Ok(Algorithm::LeakyBucket),
            other => Err(format!(
                "unknown algorithm '{}', expected 'sliding_window' or 'leaky_bucket'",
                other
            )),
        }
    }
}
