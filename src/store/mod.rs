//! Shared counter store abstraction.
//!
//! Every admission decision is a single call on [`CounterStore`] that the
//! implementation must execute atomically with respect to other callers for
//! the same key. Redis does this with server-side scripts; the in-memory
//! store holds the key's shard lock for the whole read-decide-write.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Key prefix of sliding window sorted sets.
pub const SLIDING_PREFIX: &str = "rate_limit:sliding:";
/// Key prefix of leaky bucket hashes.
pub const LEAKY_PREFIX: &str = "rate_limit:leaky:";
/// Key prefix of per-identity limit overrides.
pub const CONFIG_PREFIX: &str = "rate_limit:config:";

pub fn sliding_key(identity: &str) -> String {
    format!("{}{}", SLIDING_PREFIX, identity)
}

pub fn leaky_key(identity: &str) -> String {
    format!("{}{}", LEAKY_PREFIX, identity)
}

pub fn config_key(identity: &str) -> String {
    format!("{}{}", CONFIG_PREFIX, identity)
}

/// Expiry applied to counter records: the window rounded up to whole
/// seconds, plus one.
pub fn record_ttl_secs(window_ms: u64) -> u64 {
    window_ms.div_ceil(1000) + 1
}

/// Raw fields of a leaky bucket record, exactly as stored.
///
/// Parsing is left to the reader so that malformed values can be handled
/// by policy instead of failing the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketState {
    pub level: Option<String>,
    pub last_update: Option<String>,
}

/// Operations the rate limiters need from the shared store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically purge entries with score `<= window_start_ms`, count the
    /// rest and, if the count is below `limit`, insert `member` with score
    /// `now_ms` and set the key expiry. Returns whether the entry was added.
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        limit: u64,
        ttl_secs: u64,
        member: &str,
    ) -> StoreResult<bool>;

    /// Purge entries with score `<= window_start_ms` and return how many
    /// remain. Need not be atomic.
    async fn sliding_window_count(&self, key: &str, window_start_ms: i64) -> StoreResult<u64>;

    /// Atomically decay the bucket at `key` to `now_ms`, add one unit if the
    /// decayed level is below `limit`, and persist. Returns whether the unit
    /// was added.
    async fn leaky_bucket_admit(
        &self,
        key: &str,
        now_ms: i64,
        limit: u64,
        window_ms: u64,
        ttl_secs: u64,
    ) -> StoreResult<bool>;

    /// Read the bucket fields without modifying them.
    async fn leaky_bucket_state(&self, key: &str) -> StoreResult<BucketState>;

    /// Read a scalar value; `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a scalar value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}
