//! In-process storage backend.

use super::{validate_key, validate_ttl, Storage};
use crate::error::{RateLimitError, RateLimitResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Configuration for the in-process store.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// TTL applied when `set`/`incr` are called without one.
    pub default_ttl: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// One stored value with its expiry.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-memory realization of [`Storage`] for single-process deployments.
///
/// Expiry is lazy: an expired value is never returned by `get`/`exists`,
/// and expired entries are physically dropped on the write paths or by
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl MemoryStore {
    /// Create a store with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store with a custom configuration.
    #[must_use]
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl: config.default_ttl,
        }
    }

    /// Drop all expired entries.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Number of entries currently held, expired ones included.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    fn parse_counter(key: &str, value: &str) -> RateLimitResult<i64> {
        value
            .trim()
            .parse::<i64>()
            .map_err(|_| RateLimitError::CorruptCounter {
                key: key.to_string(),
            })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get(&self, key: &str) -> RateLimitResult<Option<String>> {
        validate_key(key)?;
        let entries = self.entries.read().unwrap();

        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RateLimitResult<()> {
        validate_key(key)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        validate_ttl(ttl)?;

        let mut entries = self.entries.write().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> RateLimitResult<i64> {
        validate_key(key)?;
        if let Some(ttl) = ttl {
            validate_ttl(ttl)?;
        }

        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();

        let previous = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Self::parse_counter(key, &entry.value)?,
            _ => 0,
        };
        let updated = previous + delta;

        let expires_at = match ttl {
            Some(ttl) => now + ttl,
            None => entries
                .get(key)
                .filter(|entry| !entry.is_expired(now))
                .map_or(now + self.default_ttl, |entry| entry.expires_at),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: updated.to_string(),
                expires_at,
            },
        );

        Ok(updated)
    }

    async fn decr(&self, key: &str, delta: i64) -> RateLimitResult<i64> {
        validate_key(key)?;

        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();

        let Some(entry) = entries.get_mut(key).filter(|entry| !entry.is_expired(now)) else {
            return Ok(0);
        };

        let previous = Self::parse_counter(key, &entry.value)?;
        let updated = (previous - delta).max(0);
        entry.value = updated.to_string();

        Ok(updated)
    }

    async fn remove(&self, key: &str) -> RateLimitResult<()> {
        validate_key(key)?;
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> RateLimitResult<bool> {
        validate_key(key)?;
        let entries = self.entries.read().unwrap();

        Ok(entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RateLimitResult<bool> {
        validate_key(key)?;
        validate_ttl(ttl)?;

        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();

        match entries.get_mut(key).filter(|entry| !entry.is_expired(now)) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                Ok(true)
            },
            None => Ok(false),
        }
    }
}
