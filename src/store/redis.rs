//! Redis counter store.
//!
//! Admission decisions run as Lua scripts so that the read-decide-write
//! sequence for one identity executes atomically on the server, in a single
//! round-trip.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use tracing::info;

use super::{BucketState, CounterStore};
use crate::config::RedisConfig;
use crate::error::{StoreError, StoreResult};

/// Purge, count and conditionally insert.
///
/// KEYS[1] sorted set; ARGV: now_ms, window_start_ms, limit, ttl_secs, member.
/// Returns 1 when the request was recorded, 0 otherwise.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_start = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)

local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('EXPIRE', key, ttl)
    return 1
end
return 0
"#;

/// Drain, compare and conditionally fill.
///
/// KEYS[1] hash with fields `level` and `last_update`;
/// ARGV: now_ms, limit, window_ms, ttl_secs.
/// Returns 1 when the request was admitted, 0 otherwise. The level is written
/// with tostring() because numbers passed to redis.call are truncated to
/// integers.
const LEAKY_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local leak_per_ms = limit / window_ms

local fields = redis.call('HMGET', key, 'level', 'last_update')
local level = 0
local last_update = now
if fields[1] and fields[2] then
    level = tonumber(fields[1])
    last_update = tonumber(fields[2])
end

local elapsed = math.max(0, now - last_update)
level = math.max(0, level - elapsed * leak_per_ms)

if level < limit then
    redis.call('HSET', key, 'level', tostring(level + 1), 'last_update', tostring(now))
    redis.call('EXPIRE', key, ttl)
    return 1
end

redis.call('HSET', key, 'last_update', tostring(now))
redis.call('EXPIRE', key, ttl)
return 0
"#;

/// Redis-backed [`CounterStore`].
///
/// Uses a connection manager for automatic reconnection. Every command is
/// bounded by the configured command timeout.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    command_timeout: Duration,
    sliding_window: Script,
    leaky_bucket: Script,
}

impl RedisStore {
    /// Connect to the server described by `config`.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let conn = tokio::time::timeout(config.connect_timeout(), ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(url = %redacted_url(&config.url), "Connected to Redis counter store");

        Ok(Self {
            conn,
            command_timeout: config.command_timeout(),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            leaky_bucket: Script::new(LEAKY_BUCKET_SCRIPT),
        })
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = self.run(redis::cmd("PING").query_async(&mut conn)).await?;
        if pong != "PONG" {
            return Err(StoreError::UnexpectedReply(pong));
        }
        Ok(())
    }

    async fn run<T, F>(&self, command: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, command)
            .await
            .map_err(|_| StoreError::Timeout(self.command_timeout))?
            .map_err(StoreError::from)
    }
}

/// Hide the password part of a Redis URL for logging.
fn redacted_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn decision(reply: i64) -> StoreResult<bool> {
    match reply {
        1 => Ok(true),
        0 => Ok(false),
        other => Err(StoreError::UnexpectedReply(format!(
            "script returned {}",
            other
        ))),
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        limit: u64,
        ttl_secs: u64,
        member: &str,
    ) -> StoreResult<bool> {
        let mut invocation = self.sliding_window.key(key);
        invocation
            .arg(now_ms)
            .arg(window_start_ms)
            .arg(limit)
            .arg(ttl_secs)
            .arg(member);

        let mut conn = self.conn.clone();
        let reply: i64 = self.run(invocation.invoke_async(&mut conn)).await?;
        decision(reply)
    }

    async fn sliding_window_count(&self, key: &str, window_start_ms: i64) -> StoreResult<u64> {
        let mut pipe = redis::pipe();
        pipe.cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(window_start_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(key);

        let mut conn = self.conn.clone();
        let (count,): (u64,) = self.run(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn leaky_bucket_admit(
        &self,
        key: &str,
        now_ms: i64,
        limit: u64,
        window_ms: u64,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let mut invocation = self.leaky_bucket.key(key);
        invocation.arg(now_ms).arg(limit).arg(window_ms).arg(ttl_secs);

        let mut conn = self.conn.clone();
        let reply: i64 = self.run(invocation.invoke_async(&mut conn)).await?;
        decision(reply)
    }

    async fn leaky_bucket_state(&self, key: &str) -> StoreResult<BucketState> {
        let mut conn = self.conn.clone();
        let (level, last_update): (Option<String>, Option<String>) = self
            .run(
                redis::cmd("HMGET")
                    .arg(key)
                    .arg("level")
                    .arg("last_update")
                    .query_async(&mut conn),
            )
            .await?;

        Ok(BucketState { level, last_update })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .run(redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let mut conn = self.conn.clone();
        let () = self
            .run(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = self.run(redis::cmd("DEL").arg(key).query_async(&mut conn)).await?;
        Ok(())
    }
}
