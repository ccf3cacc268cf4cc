//! Redis lease store
//!
//! Compound primitives run as Lua scripts so each one is a single atomic
//! round trip. Connection and IO failures surface as `StoreError::Unavailable`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hasp_common::{QueueEntry, current_timestamp};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{LeaseStore, StoreError, StoreResult};

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// Counters are sorted sets: member -> expiry in Unix millis. Every script
// drops expired members before it looks at the count.
const INCREMENT_IF_BELOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
local count = redis.call('ZCARD', KEYS[1])
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    if count >= tonumber(ARGV[2]) then
        return -1
    end
    count = count + 1
end
redis.call('ZADD', KEYS[1], now + ttl, ARGV[1])
if redis.call('PTTL', KEYS[1]) < ttl then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return count
"#;

const EXTEND_COUNTER_SCRIPT: &str = r#"
local now = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    return 0
end
redis.call('ZADD', KEYS[1], now + ttl, ARGV[1])
if redis.call('PTTL', KEYS[1]) < ttl then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
"#;

const DECREMENT_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', tonumber(ARGV[2]))
return redis.call('ZREM', KEYS[1], ARGV[1])
"#;

const QUEUE_PUSH_SCRIPT: &str = r#"
local items = redis.call('LRANGE', KEYS[1], 0, -1)
for i, raw in ipairs(items) do
    local ok, entry = pcall(cjson.decode, raw)
    if ok and entry['requester'] == ARGV[1] then
        redis.call('LSET', KEYS[1], i - 1, ARGV[2])
        return 0
    end
end
redis.call('RPUSH', KEYS[1], ARGV[2])
return 1
"#;

const QUEUE_PEEK_SCRIPT: &str = r#"
while true do
    local raw = redis.call('LINDEX', KEYS[1], 0)
    if not raw then
        return false
    end
    local ok, entry = pcall(cjson.decode, raw)
    if ok and tonumber(entry['deadline_ms']) > tonumber(ARGV[1]) then
        return raw
    end
    redis.call('LPOP', KEYS[1])
end
"#;

const QUEUE_REMOVE_SCRIPT: &str = r#"
local items = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(items) do
    local ok, entry = pcall(cjson.decode, raw)
    if ok and entry['requester'] == ARGV[1] then
        return redis.call('LREM', KEYS[1], 1, raw)
    end
end
return 0
"#;

/// Redis-backed `LeaseStore`
pub struct RedisLeaseStore {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    renew: Script,
    release: Script,
    increment_if_below: Script,
    extend_counter: Script,
    decrement: Script,
    queue_push: Script,
    queue_peek: Script,
    queue_remove: Script,
}

impl RedisLeaseStore {
    /// Create a store for the given Redis URL. No connection is opened until
    /// the first operation.
    pub fn new(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(map_redis_error)?;
        info!("Redis lease store created");
        Ok(Self {
            client,
            conn: Mutex::new(None),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            increment_if_below: Script::new(INCREMENT_IF_BELOW_SCRIPT),
            extend_counter: Script::new(EXTEND_COUNTER_SCRIPT),
            decrement: Script::new(DECREMENT_SCRIPT),
            queue_push: Script::new(QUEUE_PUSH_SCRIPT),
            queue_peek: Script::new(QUEUE_PEEK_SCRIPT),
            queue_remove: Script::new(QUEUE_REMOVE_SCRIPT),
        })
    }

    /// Round-trip check
    pub async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        let result: Result<String, RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        self.check(result).await.map(|_| ())
    }

    async fn get_conn(&self) -> StoreResult<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Map a command result, dropping the cached connection when it broke
    async fn check<T>(&self, result: Result<T, RedisError>) -> StoreResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = map_redis_error(e);
                if matches!(err, StoreError::Unavailable(_)) {
                    warn!("Redis connection failed, reconnecting on next call: {}", err);
                    *self.conn.lock().await = None;
                }
                Err(err)
            }
        }
    }
}

fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Protocol(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn encode_entry(entry: &QueueEntry) -> StoreResult<String> {
    serde_json::to_string(entry).map_err(|e| StoreError::Protocol(e.to_string()))
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<Option<String>, RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await;
        Ok(self.check(result).await?.is_some())
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = self
            .renew
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await;
        Ok(self.check(result).await? == 1)
    }

    async fn release(&self, key: &str, token: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await;
        Ok(self.check(result).await? == 1)
    }

    async fn current_token(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.get_conn().await?;
        let result: Result<Option<String>, RedisError> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        self.check(result).await
    }

    async fn force_delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> =
            redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        Ok(self.check(result).await? > 0)
    }

    async fn increment_if_below(
        &self,
        key: &str,
        member: &str,
        max: i64,
        ttl: Duration,
    ) -> StoreResult<Option<i64>> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = self
            .increment_if_below
            .key(key)
            .arg(member)
            .arg(max)
            .arg(current_timestamp())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await;
        let value = self.check(result).await?;
        Ok((value >= 0).then_some(value))
    }

    async fn extend_counter(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = self
            .extend_counter
            .key(key)
            .arg(member)
            .arg(current_timestamp())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await;
        Ok(self.check(result).await? == 1)
    }

    async fn decrement(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = self
            .decrement
            .key(key)
            .arg(member)
            .arg(current_timestamp())
            .invoke_async(&mut conn)
            .await;
        Ok(self.check(result).await? == 1)
    }

    async fn counter_value(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({}", current_timestamp()))
            .arg("+inf")
            .query_async(&mut conn)
            .await;
        self.check(result).await
    }

    async fn counter_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<Option<f64>, RedisError> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await;
        let now = current_timestamp() as f64;
        Ok(self.check(result).await?.is_some_and(|expires_at| expires_at > now))
    }

    async fn queue_push(&self, key: &str, entry: &QueueEntry) -> StoreResult<bool> {
        let raw = encode_entry(entry)?;
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = self
            .queue_push
            .key(key)
            .arg(&entry.requester)
            .arg(raw)
            .invoke_async(&mut conn)
            .await;
        Ok(self.check(result).await? == 1)
    }

    async fn queue_peek_head(&self, key: &str) -> StoreResult<Option<QueueEntry>> {
        let mut conn = self.get_conn().await?;
        let result: Result<Option<String>, RedisError> = self
            .queue_peek
            .key(key)
            .arg(current_timestamp())
            .invoke_async(&mut conn)
            .await;
        match self.check(result).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Protocol(e.to_string())),
            None => Ok(None),
        }
    }

    async fn queue_remove(&self, key: &str, requester: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = self
            .queue_remove
            .key(key)
            .arg(requester)
            .invoke_async(&mut conn)
            .await;
        Ok(self.check(result).await? > 0)
    }

    async fn queue_len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.get_conn().await?;
        let result: Result<usize, RedisError> =
            redis::cmd("LLEN").arg(key).query_async(&mut conn).await;
        self.check(result).await
    }

    async fn hash_put(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await;
        self.check(result).await.map(|_| ())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.get_conn().await?;
        let result: Result<HashMap<String, String>, RedisError> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await;
        self.check(result).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await;
        Ok(self.check(result).await? > 0)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        let result: Result<i64, RedisError> = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await;
        self.check(result).await.map(|_| ())
    }
}
