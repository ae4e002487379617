//! Route cache client.
//!
//! Lookups return a tagged [`CacheLookup`] so callers never compare against
//! the negative sentinel themselves. Cache failures are never fatal: the read
//! engine falls back to the relational store on any [`CacheError`].

use crate::config::RedisConfig;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Reserved in-band marker for "this route does not exist".
pub const NEGATIVE_SENTINEL: &str = "__NOT_FOUND__";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation failed: {0}")]
    Operation(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            CacheError::Unavailable(err.to_string())
        } else {
            CacheError::Operation(err.to_string())
        }
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// A cached URL.
    Hit(String),
    /// The cached absence marker.
    NegativeHit,
    /// No entry for the key.
    Miss,
}

#[async_trait]
pub trait RouteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<CacheLookup, CacheError>;
    async fn set(&self, key: &str, url: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn set_negative(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Redis-backed cache. The connection manager is created lazily on first use
/// and reconnects on its own afterwards; every operation is bounded by the
/// configured socket timeout.
pub struct RedisCache {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    socket_timeout: Duration,
}

impl RedisCache {
    pub fn new(config: &RedisConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.url().as_str())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            socket_timeout: config.socket_timeout(),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, CacheError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                tracing::debug!("connecting cache client");
                let config = ConnectionManagerConfig::new()
                    .set_connection_timeout(self.socket_timeout)
                    .set_response_timeout(self.socket_timeout);
                ConnectionManager::new_with_config(self.client.clone(), config).await
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl RouteCache for RedisCache {
    async fn get(&self, key: &str) -> Result<CacheLookup, CacheError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(match value {
            Some(v) if v == NEGATIVE_SENTINEL => CacheLookup::NegativeHit,
            Some(v) => CacheLookup::Hit(v),
            None => CacheLookup::Miss,
        })
    }

    async fn set(&self, key: &str, url: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, url, ttl.as_secs()).await?;
        Ok(())
    }

    async fn set_negative(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, NEGATIVE_SENTINEL, ttl.as_secs()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

/// In-memory cache with TTL semantics. Used in tests and anywhere a real
/// cache server is not available.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|(_, expires)| expires.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl RouteCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<CacheLookup, CacheError> {
        Ok(match self.live_value(key) {
            Some(v) if v == NEGATIVE_SENTINEL => CacheLookup::NegativeHit,
            Some(v) => CacheLookup::Hit(v),
            None => CacheLookup::Miss,
        })
    }

    async fn set(&self, key: &str, url: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (url.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn set_negative(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            (NEGATIVE_SENTINEL.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
