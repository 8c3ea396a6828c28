//! In-process counter store.
//!
//! Mirrors the Redis data model (scalars, sorted sets, hashes, key TTLs)
//! closely enough that the limiters behave identically on either store.
//! Limits are per-process, so this is only suitable for tests and
//! single-instance deployments. Expired keys are invisible on read; long-lived
//! stores should run [`MemoryStore::spawn_purger`] so they are also freed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BucketState, CounterStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::ratelimit::leaky_bucket::drain;
use crate::sweeper::Sweeper;

const LEVEL_FIELD: &str = "level";
const LAST_UPDATE_FIELD: &str = "last_update";

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    /// (score, member), kept ordered by score
    SortedSet(Vec<(i64, String)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<i64>,
}

impl StoredEntry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_empty(&self) -> bool {
        match &self.value {
            Value::Scalar(_) => false,
            Value::SortedSet(set) => set.is_empty(),
            Value::Hash(fields) => fields.is_empty(),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::UnexpectedReply(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// A [`CounterStore`] held entirely in memory.
///
/// Each operation works on a single key while holding that key's shard lock,
/// which gives the same per-key atomicity Redis scripts provide.
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store that expires keys by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that expires keys by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Whether `key` currently exists (expired keys do not).
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Milliseconds until `key` expires, if it exists and has an expiry.
    pub fn ttl_millis(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at.map(|at| at - now)
    }

    /// Number of members in the sorted set at `key`, without purging.
    pub fn sorted_set_len(&self, key: &str) -> usize {
        let now = self.clock.now_millis();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::SortedSet(set) => set.len(),
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Overwrite the raw leaky bucket fields at `key`.
    ///
    /// Values are stored verbatim, which allows seeding records that another
    /// writer left in an unexpected shape.
    pub fn put_bucket_fields(&self, key: &str, level: &str, last_update: &str) {
        let mut fields = HashMap::new();
        fields.insert(LEVEL_FIELD.to_string(), level.to_string());
        fields.insert(LAST_UPDATE_FIELD.to_string(), last_update.to_string());
        self.entries
            .insert(key.to_string(), StoredEntry::new(Value::Hash(fields)));
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Purge expired keys every `interval` in the background.
    ///
    /// Must be called from within a Tokio runtime. Stops when the returned
    /// handle is stopped or dropped.
    pub fn spawn_purger(self: &Arc<Self>, interval: Duration) -> Sweeper {
        let store = Arc::clone(self);
        Sweeper::spawn("memory_store", interval, move || store.purge_expired())
    }

    fn expiry_after(&self, ttl: Duration) -> i64 {
        self.clock.now_millis() + ttl.as_millis() as i64
    }

    /// Remove `key` if a collection operation left it empty without expiry,
    /// as Redis does for empty sets and hashes.
    fn drop_if_empty(&self, key: &str) {
        self.entries
            .remove_if(key, |_, entry| entry.is_empty() && entry.expires_at.is_none());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_field<T: std::str::FromStr>(key: &str, field: &str, raw: &str) -> StoreResult<T> {
    raw.parse().map_err(|_| {
        StoreError::UnexpectedReply(format!(
            "field {} of {} is not a number: {:?}",
            field, key, raw
        ))
    })
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        limit: u64,
        ttl_secs: u64,
        member: &str,
    ) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry_after(Duration::from_secs(ttl_secs));

        let admitted = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| StoredEntry::new(Value::SortedSet(Vec::new())));
            if entry.is_expired(now) {
                *entry = StoredEntry::new(Value::SortedSet(Vec::new()));
            }

            let set = match &mut entry.value {
                Value::SortedSet(set) => set,
                _ => return Err(wrong_type(key)),
            };

            set.retain(|(score, _)| *score > window_start_ms);

            if (set.len() as u64) < limit {
                match set.iter_mut().find(|(_, m)| m == member) {
                    Some(existing) => existing.0 = now_ms,
                    None => set.push((now_ms, member.to_string())),
                }
                set.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                entry.expires_at = Some(expires_at);
                true
            } else {
                false
            }
        };

        if !admitted {
            self.drop_if_empty(key);
        }
        Ok(admitted)
    }

    async fn sliding_window_count(&self, key: &str, window_start_ms: i64) -> StoreResult<u64> {
        let now = self.clock.now_millis();

        let count = match self.entries.get_mut(key) {
            None => return Ok(0),
            Some(mut entry) => {
                if entry.is_expired(now) {
                    None
                } else {
                    match &mut entry.value {
                        Value::SortedSet(set) => {
                            set.retain(|(score, _)| *score > window_start_ms);
                            Some(set.len() as u64)
                        }
                        _ => return Err(wrong_type(key)),
                    }
                }
            }
        };

        match count {
            Some(count) => {
                self.drop_if_empty(key);
                Ok(count)
            }
            None => {
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                Ok(0)
            }
        }
    }

    async fn leaky_bucket_admit(
        &self,
        key: &str,
        now_ms: i64,
        limit: u64,
        window_ms: u64,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry_after(Duration::from_secs(ttl_secs));

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(Value::Hash(HashMap::new())));
        if entry.is_expired(now) {
            *entry = StoredEntry::new(Value::Hash(HashMap::new()));
        }

        let fields = match &mut entry.value {
            Value::Hash(fields) => fields,
            _ => return Err(wrong_type(key)),
        };

        let (level, last_update) = match (fields.get(LEVEL_FIELD), fields.get(LAST_UPDATE_FIELD)) {
            (Some(level), Some(last_update)) => (
                parse_field::<f64>(key, LEVEL_FIELD, level)?,
                parse_field::<i64>(key, LAST_UPDATE_FIELD, last_update)?,
            ),
            _ => (0.0, now_ms),
        };

        let level = drain(level, last_update, now_ms, limit, window_ms);
        let admitted = level < limit as f64;

        if admitted {
            fields.insert(LEVEL_FIELD.to_string(), (level + 1.0).to_string());
        }
        fields.insert(LAST_UPDATE_FIELD.to_string(), now_ms.to_string());
        entry.expires_at = Some(expires_at);

        Ok(admitted)
    }

    async fn leaky_bucket_state(&self, key: &str) -> StoreResult<BucketState> {
        let now = self.clock.now_millis();
        let entry = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry,
            _ => return Ok(BucketState::default()),
        };

        match &entry.value {
            Value::Hash(fields) => Ok(BucketState {
                level: fields.get(LEVEL_FIELD).cloned(),
                last_update: fields.get(LAST_UPDATE_FIELD).cloned(),
            }),
            _ => Err(wrong_type(key)),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_millis();
        let entry = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry,
            _ => return Ok(None),
        };

        match &entry.value {
            Value::Scalar(value) => Ok(Some(value.clone())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let entry = StoredEntry {
            value: Value::Scalar(value.to_string()),
            expires_at: Some(self.expiry_after(ttl)),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_sliding_admit_respects_limit() {
        let (store, clock) = store();
        let now = clock.now_millis();

        assert!(store.sliding_window_admit("k", now, now - 1000, 2, 2, "a").await.unwrap());
        assert!(store.sliding_window_admit("k", now, now - 1000, 2, 2, "b").await.unwrap());
        assert!(!store.sliding_window_admit("k", now, now - 1000, 2, 2, "c").await.unwrap());
        assert_eq!(store.sorted_set_len("k"), 2);
        assert_eq!(store.ttl_millis("k"), Some(2000));
    }

    #[tokio::test]
    async fn test_sliding_duplicate_member_is_not_counted_twice() {
        let (store, clock) = store();
        let now = clock.now_millis();

        store.sliding_window_admit("k", now, now - 1000, 5, 2, "same").await.unwrap();
        store.sliding_window_admit("k", now, now - 1000, 5, 2, "same").await.unwrap();
        assert_eq!(store.sorted_set_len("k"), 1);
    }

    #[tokio::test]
    async fn test_sliding_count_purges_boundary_inclusive() {
        let (store, _clock) = store();

        store.sliding_window_admit("k", 100, 0, 10, 2, "a").await.unwrap();
        store.sliding_window_admit("k", 200, 0, 10, 2, "b").await.unwrap();
        store.sliding_window_admit("k", 300, 0, 10, 2, "c").await.unwrap();

        assert_eq!(store.sliding_window_count("k", 200).await.unwrap(), 1);
        assert_eq!(store.sliding_window_count("missing", 200).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_limit_leaves_no_key_behind() {
        let (store, clock) = store();
        let now = clock.now_millis();

        assert!(!store.sliding_window_admit("k", now, now - 1000, 0, 2, "a").await.unwrap());
        assert!(!store.contains_key("k"));
    }

    #[tokio::test]
    async fn test_keys_expire_with_clock() {
        let (store, clock) = store();

        store.set_with_ttl("cfg", "50", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.get("cfg").await.unwrap(), Some("50".to_string()));

        clock.advance(Duration::from_millis(1000));
        assert_eq!(store.get("cfg").await.unwrap(), None);
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_purger_frees_expired_keys() {
        let (store, clock) = store();
        let store = Arc::new(store);

        store.set_with_ttl("gone", "1", Duration::from_secs(1)).await.unwrap();
        store.set_with_ttl("kept", "2", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.entries.len(), 2);

        let purger = store.spawn_purger(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        purger.stop().await;

        assert_eq!(store.entries.len(), 1);
        assert!(store.contains_key("kept"));
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let (store, _clock) = store();

        store.set_with_ttl("k", "1", Duration::from_secs(10)).await.unwrap();
        let result = store.sliding_window_count("k", 0).await;
        assert!(matches!(result, Err(StoreError::UnexpectedReply(_))));
    }

    #[tokio::test]
    async fn test_bucket_admit_writes_fields() {
        let (store, clock) = store();
        let now = clock.now_millis();

        assert!(store.leaky_bucket_admit("b", now, 3, 1000, 2).await.unwrap());
        let state = store.leaky_bucket_state("b").await.unwrap();
        assert_eq!(state.level.as_deref(), Some("1"));
        assert_eq!(state.last_update, Some(now.to_string()));
    }

    #[tokio::test]
    async fn test_bucket_denial_only_touches_last_update() {
        let (store, clock) = store();
        let now = clock.now_millis();
        store.put_bucket_fields("b", "3", &now.to_string());

        assert!(!store.leaky_bucket_admit("b", now, 3, 1000, 2).await.unwrap());

        let state = store.leaky_bucket_state("b").await.unwrap();
        assert_eq!(state.level.as_deref(), Some("3"));
        assert_eq!(store.ttl_millis("b"), Some(2000));
    }

    #[tokio::test]
    async fn test_delete_missing_key() {
        let (store, _clock) = store();
        assert!(store.delete("nothing").await.is_ok());
    }
}
