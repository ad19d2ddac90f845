use async_trait::async_trait;
use errors::StorageError;
use gen_core::traits::{CounterStore, KeyValueStore};
use gen_core::types::SlidingWindowOutcome;
use redis::AsyncCommands;
use redis::aio::ConnectionManagerConfig;
use std::time::Duration;

/// Connection and response timeout used by [`RedisStore::with_prefix`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect attempts before a connection error is returned.
const CONNECT_RETRIES: usize = 2;

/// INCR, then set the window expiry only on the first write of the window.
const INCREMENT_AND_EXPIRE_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 then
    redis.call("EXPIRE", KEYS[1], ARGV[1])
end
return current
"#;

/// Sorted-set log: trim, count, admit under the limit, refresh TTL.
/// Returns {count, allowed, oldest_score or -1}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call("ZREMRANGEBYSCORE", key, "-inf", now - window)
local count = redis.call("ZCARD", key)
local allowed = 0
if count < limit then
    redis.call("ZADD", key, now, member)
    count = count + 1
    allowed = 1
end
if count > 0 then
    redis.call("PEXPIRE", key, window)
end

local oldest = redis.call("ZRANGE", key, 0, 0, "WITHSCORES")
local oldest_score = -1
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {count, allowed, oldest_score}
"#;

/// Redis-backed cache and counter store shared by every broker process.
///
/// Cloning the inner `ConnectionManager` per call is cheap; it multiplexes a
/// single connection and reconnects on failure.
pub struct RedisStore {
    connection_manager: redis::aio::ConnectionManager,
    key_prefix: String,
    increment_script: redis::Script,
    sliding_window_script: redis::Script
}

impl RedisStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, "").await
    }

    /// Connects and namespaces every key with `key_prefix`.
    pub async fn with_prefix(
        connection_string: &str,
        key_prefix: &str
    ) -> Result<Self, StorageError> {
        Self::connect(connection_string, key_prefix, DEFAULT_TIMEOUT).await
    }

    /// Connects with `timeout` bounding connection setup and every command
    /// response, so a stalled server surfaces as an error instead of a hang.
    pub async fn connect(
        connection_string: &str,
        key_prefix: &str,
        timeout: Duration
    ) -> Result<Self, StorageError> {
        let client =
            redis::Client::open(connection_string).map_err(|e| StorageError::ConnectionError {
                backend: "Redis".to_string(),
                reason: e.to_string()
            })?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Some(timeout))
            .set_response_timeout(Some(timeout))
            .set_number_of_retries(CONNECT_RETRIES)
            .set_max_delay(timeout);

        let connection_manager = client
            .get_connection_manager_with_config(manager_config)
            .await
            .map_err(|e| StorageError::ConnectionError {
                backend: "Redis".to_string(),
                reason: e.to_string()
            })?;

        tracing::debug!(prefix = key_prefix, "Connected to Redis");

        Ok(Self {
            connection_manager,
            key_prefix: key_prefix.to_string(),
            increment_script: redis::Script::new(INCREMENT_AND_EXPIRE_SCRIPT),
            sliding_window_script: redis::Script::new(SLIDING_WINDOW_SCRIPT)
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(StorageError::redis_query)?;
        Ok(())
    }

    /// Remaining lifetime of a key in milliseconds, `None` if absent or persistent.
    pub async fn ttl_millis(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let mut conn = self.connection_manager.clone();
        let ttl: i64 = conn
            .pttl(self.prefixed(key))
            .await
            .map_err(StorageError::redis_query)?;
        Ok((ttl >= 0).then_some(ttl))
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection_manager.clone();
        conn.get(self.prefixed(key))
            .await
            .map_err(StorageError::redis_query)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration
    ) -> Result<(), StorageError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if ttl_ms == 0 {
            return Err(StorageError::InvalidArgument {
                reason: "TTL must be at least one millisecond".to_string()
            });
        }

        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("SET")
            .arg(self.prefixed(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(StorageError::redis_query)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection_manager.clone();
        let removed: u64 = conn
            .del(self.prefixed(key))
            .await
            .map_err(StorageError::redis_query)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection_manager.clone();
        conn.exists(self.prefixed(key))
            .await
            .map_err(StorageError::redis_query)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_and_expire_on_first_write(
        &self,
        key: &str,
        window: Duration
    ) -> Result<u64, StorageError> {
        let mut conn = self.connection_manager.clone();
        let count: u64 = self
            .increment_script
            .key(self.prefixed(key))
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(StorageError::redis_query)?;
        Ok(count)
    }

    async fn sliding_window_acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: i64,
        member: &str
    ) -> Result<SlidingWindowOutcome, StorageError> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
        let mut conn = self.connection_manager.clone();
        let reply: Vec<i64> = self
            .sliding_window_script
            .key(self.prefixed(key))
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(StorageError::redis_query)?;

        match reply.as_slice() {
            [count, allowed, oldest] => Ok(SlidingWindowOutcome {
                count: (*count).max(0) as u64,
                allowed: *allowed == 1,
                oldest_ms: (*oldest >= 0).then_some(*oldest)
            }),
            other => Err(StorageError::redis_query(format!(
                "unexpected sliding window reply: {other:?}"
            )))
        }
    }
}
