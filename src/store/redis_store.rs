//! Redis-backed store shared between gateway instances.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{info, trace};

use super::{capped, BlockStatus, Store};
use crate::error::Result;

/// Prefix that keeps block markers apart from counters.
const BLOCK_PREFIX: &str = "blocked:";

/// Increment a counter and, on the first increment of a window, set its expiry.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if tonumber(current) == 1 then
  redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return current
"#;

/// A store that keeps counters and block markers in Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    increment: Script,
}

impl RedisStore {
    /// Connect to Redis at `addr` (`host:port`).
    pub async fn connect(addr: &str, password: Option<&str>, db: i64) -> Result<Self> {
        let url = redis_url(addr, password, db);
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(addr = %addr, db = db, "Connected to Redis store");

        Ok(Self {
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }
}

fn redis_url(addr: &str, password: Option<&str>, db: i64) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => format!("redis://:{}@{}/{}", password, addr, db),
        None => format!("redis://{}/{}", addr, db),
    }
}

fn block_key(key: &str) -> String {
    format!("{}{}", BLOCK_PREFIX, key)
}

fn millis(duration: Duration) -> u64 {
    // Redis rejects a zero expiry.
    (capped(duration).as_millis() as u64).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .increment
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, count = count, "Incremented counter");
        Ok(count)
    }

    async fn set_blocked(&self, key: &str, duration: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.pset_ex(block_key(key), 1, millis(duration)).await?;
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<BlockStatus> {
        let mut conn = self.conn.clone();
        // -2 when the marker is absent, -1 when it has no expiry.
        let ttl_ms: i64 = conn.pttl(block_key(key)).await?;

        if ttl_ms <= 0 {
            return Ok(BlockStatus::unblocked());
        }
        Ok(BlockStatus::blocked_for(Duration::from_millis(ttl_ms as u64)))
    }
}
