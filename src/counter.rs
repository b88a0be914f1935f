/* src/counter.rs */

//! Process-external counters used by the shared fixed-window limiter and by
//! quotas. Keys are strings; a TTL is attached by the caller on the first
//! increment of each key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::{Duration, Instant};

#[async_trait]
pub trait SharedCounter: Send + Sync {
    /// Atomically increments `key` by one and returns the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Sets the time-to-live of `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Short name for logs.
    fn backend(&self) -> &'static str;

    /// Drops expired keys held in process. Stores that expire keys
    /// themselves leave this as a no-op.
    fn purge_expired(&self) {}
}

/// Increments `key` and, when this created it, attaches `ttl`.
pub async fn incr_with_ttl(counter: &dyn SharedCounter, key: &str, ttl: Duration) -> Result<i64> {
    let value = counter.incr(key).await?;
    if value == 1 {
        counter.expire(key, ttl).await?;
    }
    Ok(value)
}

/// Single-process stand-in for the shared store, used when no store address
/// is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryCounter {
    entries: DashMap<String, MemoryEntry>,
}

#[derive(Debug)]
struct MemoryEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired keys. Run periodically from a background task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SharedCounter for MemoryCounter {
    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert(MemoryEntry { value: 0, expires_at: None });
        if entry.expires_at.is_some_and(|at| at <= now) {
            entry.value = 0;
            entry.expires_at = None;
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn purge_expired(&self) {
        self.sweep();
    }
}

/// Redis-backed counter (`INCR` + `EXPIRE`).
#[derive(Clone)]
pub struct RedisCounter {
    conn: ConnectionManager,
}

impl RedisCounter {
    /// Connects to `addr` (`host:port`), optionally authenticating.
    pub async fn connect(addr: &str, password: Option<&str>, db: i64) -> Result<Self> {
        let url = redis_url(addr, password, db);
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("Invalid counter store address '{addr}'"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("Failed to connect to counter store at '{addr}'"))?;
        Ok(Self { conn })
    }
}

fn redis_url(addr: &str, password: Option<&str>, db: i64) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => format!("redis://:{password}@{addr}/{db}"),
        None => format!("redis://{addr}/{db}"),
    }
}

#[async_trait]
impl SharedCounter for RedisCounter {
    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let _: bool = conn.expire(key, secs).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
