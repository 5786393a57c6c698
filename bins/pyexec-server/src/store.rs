// Expiring counters behind the abuse guard.
//
// The guard only needs "increment with expiry", "mark until", "time left"
// and "forget". The in-process map serves a single instance; the Redis store
// lets several instances share throttling state.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("abuse state store error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Increment `key`, creating it with `ttl` if absent. With `refresh_ttl`
    /// every increment restarts the expiry. Returns the new count and the
    /// time left before the key expires.
    async fn incr(&self, key: &str, ttl: Duration, refresh_ttl: bool) -> Result<(u64, Duration), StoreError>;

    /// Set `key` so that it exists for exactly `ttl`
    async fn set_until(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Current count under `key`, or `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Time left on `key`, or `None` if it does not exist
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

struct Entry {
    count: u64,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn incr(&self, key: &str, ttl: Duration, refresh_ttl: bool) -> Result<(u64, Duration), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        if entries.len() > SWEEP_THRESHOLD {
            entries.retain(|_, entry| entry.expires_at > now);
        }

        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expires_at <= now {
                    entry.count = 0;
                    entry.expires_at = now + ttl;
                }
            })
            .or_insert(Entry {
                count: 0,
                expires_at: now + ttl,
            });
        entry.count += 1;
        if refresh_ttl {
            entry.expires_at = now + ttl;
        }
        Ok((entry.count, entry.expires_at - now))
    }

    async fn set_until(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries().insert(
            key.to_string(),
            Entry {
                count: 1,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.count))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.expires_at - now)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl RedisStateStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn pttl_to_duration(ms: i64) -> Option<Duration> {
    // -2: no key, -1: no expiry
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn incr(&self, key: &str, ttl: Duration, refresh_ttl: bool) -> Result<(u64, Duration), StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis() as i64;

        let (count, pttl): (u64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .pttl(key)
            .query_async(&mut conn)
            .await?;

        // A fresh key (or one that lost its expiry) gets one now
        if refresh_ttl || pttl < 0 {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_ms)
                .query_async::<_, ()>(&mut conn)
                .await?;
            return Ok((count, ttl));
        }
        Ok((count, pttl_to_duration(pttl).unwrap_or(ttl)))
    }

    async fn set_until(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(key).await?;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let ms: i64 = conn.pttl(key).await?;
        Ok(pttl_to_duration(ms))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
