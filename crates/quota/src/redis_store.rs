//! Redis-backed quota store.
//!
//! Conditional operations run as Lua scripts so each call is one atomic round
//! trip. The connection manager reconnects on its own; a failed call surfaces
//! as [`Error::Store`] and the caller decides (the rate gate fails closed).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enrich_core::{Error, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::time::Duration;
use tracing::info;

use crate::config::StoreConfig;
use crate::store::{epoch_secs, QuotaStore, WindowDecision};

/// INCR, then EXPIREAT when the increment created the key. A key that somehow
/// lost its TTL gets one too, so a counter can never outlive its day.
const INCR_EXPIRE_AT: &str = r#"
local n = redis.call('INCR', KEYS[1])
if n == 1 or redis.call('TTL', KEYS[1]) == -1 then
  redis.call('EXPIREAT', KEYS[1], ARGV[1])
end
return n
"#;

const DELETE_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Prune, count, conditionally insert, refresh TTL. Returns {admitted, count}.
const SLIDING_WINDOW: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], math.floor(window * 2000))
  return {1, count}
end
return {0, count}
"#;

fn store_err(e: RedisError) -> Error {
    Error::store(e.to_string())
}

/// [`QuotaStore`] over a shared Redis instance.
#[derive(Clone)]
pub struct RedisQuotaStore {
    conn: ConnectionManager,
    incr_expire_at: Script,
    delete_if_eq: Script,
    sliding_window: Script,
}

impl RedisQuotaStore {
    /// Connects to Redis. Fails if the first connection cannot be made.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::config(format!("invalid store url: {}", e)))?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;

        info!(url = %config.redacted_url(), "Connected to quota store");

        Ok(Self {
            conn,
            incr_expire_at: Script::new(INCR_EXPIRE_AT),
            delete_if_eq: Script::new(DELETE_IF_EQ),
            sliding_window: Script::new(SLIDING_WINDOW),
        })
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn get_count(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(key).await.map_err(store_err)?;
        Ok(count.unwrap_or(0))
    }

    async fn incr_expire_at(&self, key: &str, expire_at: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut invocation = self.incr_expire_at.key(key);
        invocation.arg(expire_at.timestamp());
        invocation.invoke_async(&mut conn).await.map_err(store_err)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.delete_if_eq.key(key);
        invocation.arg(value);
        let removed: u64 = invocation.invoke_async(&mut conn).await.map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> Result<WindowDecision> {
        let mut conn = self.conn.clone();
        let mut invocation = self.sliding_window.key(key);
        invocation
            .arg(epoch_secs(now))
            .arg(window.as_secs_f64())
            .arg(limit)
            .arg(member);
        let (admitted, count): (u8, u64) =
            invocation.invoke_async(&mut conn).await.map_err(store_err)?;

        Ok(WindowDecision {
            admitted: admitted == 1,
            count,
        })
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
