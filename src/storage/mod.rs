//! Storage backends for rate-limit state.
//!
//! All algorithms are expressed against the [`Storage`] trait: a flat
//! string-keyed map with per-key TTL and atomic integer counters. Two
//! realizations are provided: [`MemoryStore`] for in-process limiting and
//! [`RedisStore`] for limits shared across a fleet.

mod memory;
mod remote;

pub use memory::{MemoryStore, MemoryStoreConfig};
pub use remote::{RedisStore, RedisStoreConfig};

use crate::error::{RateLimitError, RateLimitResult};
use async_trait::async_trait;
use std::time::Duration;

/// Abstract atomic key/value counter store with TTL.
///
/// Required of every realization: `incr` and `decr` are linearizable with
/// respect to each other on the same key; `get` observes any `set`/`incr`/
/// `decr` that completes-before it; TTL expiry is eventual but never
/// resurrects deleted values.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Return the current value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> RateLimitResult<Option<String>>;

    /// Unconditionally write `value`. An absent `ttl` applies the store
    /// default; no value is stored without an expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RateLimitResult<()>;

    /// Atomically add `delta` to the integer decoding of `key` (absent key
    /// treated as 0) and return the new value. A supplied `ttl` is refreshed
    /// in the same operation.
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> RateLimitResult<i64>;

    /// Atomically subtract `delta` with a floor of 0 and return the new
    /// value. An absent key is treated as 0 and is not created.
    async fn decr(&self, key: &str, delta: i64) -> RateLimitResult<i64>;

    /// Delete `key`. Idempotent.
    async fn remove(&self, key: &str) -> RateLimitResult<()>;

    /// Whether `key` currently holds a live value.
    async fn exists(&self, key: &str) -> RateLimitResult<bool>;

    /// Set the TTL on an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> RateLimitResult<bool>;
}

/// Reject empty or whitespace-only storage keys.
pub(crate) fn validate_key(key: &str) -> RateLimitResult<()> {
    if key.trim().is_empty() {
        return Err(RateLimitError::BlankKey);
    }
    Ok(())
}

/// Reject non-positive TTLs.
pub(crate) fn validate_ttl(ttl: Duration) -> RateLimitResult<()> {
    if ttl.is_zero() {
        return Err(RateLimitError::OutOfRange {
            field: "ttl",
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("user:1").is_ok());
        assert!(matches!(
            validate_key("").unwrap_err(),
            RateLimitError::BlankKey
        ));
        assert!(matches!(
            validate_key("   ").unwrap_err(),
            RateLimitError::BlankKey
        ));
    }

    #[test]
    fn test_validate_ttl() {
        assert!(validate_ttl(Duration::from_millis(1)).is_ok());
        assert!(matches!(
            validate_ttl(Duration::ZERO).unwrap_err(),
            RateLimitError::OutOfRange { field: "ttl", .. }
        ));
    }
}
