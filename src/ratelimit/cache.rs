//! Local cache of per-identity limit overrides.
//!
//! The cache is an advisory shadow of the overrides held in the shared
//! store: entries may be stale for up to their TTL. Expired entries are
//! ignored on read and removed by a periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::clock::Clock;
use crate::sweeper::Sweeper;

/// A cached override and when it stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedLimit {
    pub limit: u64,
    pub expires_at_ms: i64,
}

/// Thread-safe override cache. Readers share the lock; writers exclude.
pub struct LimitCache {
    entries: RwLock<HashMap<String, CachedLimit>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl LimitCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// The cached limit for `identity`, if present and unexpired.
    pub fn get(&self, identity: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        let entries = self.entries.read();
        entries
            .get(identity)
            .filter(|cached| cached.expires_at_ms > now)
            .map(|cached| cached.limit)
    }

    /// Cache `limit` for `identity` for one TTL from now.
    pub fn put(&self, identity: &str, limit: u64) -> CachedLimit {
        let cached = CachedLimit {
            limit,
            expires_at_ms: self.clock.now_millis() + self.ttl.as_millis() as i64,
        };
        self.entries.write().insert(identity.to_string(), cached);
        cached
    }

    pub fn remove(&self, identity: &str) {
        self.entries.write().remove(identity);
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, cached| cached.expires_at_ms > now);
        before - entries.len()
    }

    /// Number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Start a background task that sweeps this cache every `interval`.
    ///
    /// Must be called from within a Tokio runtime. The task runs until the
    /// returned handle is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Sweeper {
        let cache = Arc::clone(self);
        Sweeper::spawn("limit_cache", interval, move || cache.sweep())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(ttl: Duration) -> (Arc<LimitCache>, ManualClock) {
        let clock = ManualClock::default();
        (Arc::new(LimitCache::new(ttl, Arc::new(clock.clone()))), clock)
    }

    #[test]
    fn test_put_and_get() {
        let (cache, clock) = cache(Duration::from_secs(60));

        let cached = cache.put("alice", 50);
        assert_eq!(cached.expires_at_ms, clock.now_millis() + 60_000);
        assert_eq!(cache.get("alice"), Some(50));
        assert_eq!(cache.get("bob"), None);
    }

    #[test]
    fn test_expired_entries_are_invisible_until_swept() {
        let (cache, clock) = cache(Duration::from_secs(1));

        cache.put("alice", 50);
        clock.advance(Duration::from_secs(1));

        assert_eq!(cache.get("alice"), None);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_keeps_live_entries() {
        let (cache, clock) = cache(Duration::from_secs(10));

        cache.put("old", 1);
        clock.advance(Duration::from_secs(6));
        cache.put("new", 2);
        clock.advance(Duration::from_secs(5));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get("new"), Some(2));
    }

    #[test]
    fn test_put_refreshes_expiry() {
        let (cache, clock) = cache(Duration::from_secs(10));

        cache.put("alice", 1);
        clock.advance(Duration::from_secs(8));
        cache.put("alice", 2);
        clock.advance(Duration::from_secs(8));

        assert_eq!(cache.get("alice"), Some(2));
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let (cache, clock) = cache(Duration::from_secs(1));
        cache.put("alice", 5);
        clock.advance(Duration::from_secs(2));

        let sweeper = cache.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.is_empty());
        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_dropped() {
        let (cache, _clock) = cache(Duration::from_secs(1));
        let sweeper = cache.spawn_sweeper(Duration::from_millis(10));
        assert!(!sweeper.is_finished());

        drop(sweeper);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the test's reference remains once the task has exited.
        assert_eq!(Arc::strong_count(&cache), 1);
    }
}
