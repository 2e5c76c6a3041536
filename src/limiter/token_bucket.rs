//! Token-bucket rate limiter.

use super::records::{self, TokenBucketRecord};
use super::{
    admit_on_storage_failure, bounded, deadline_elapsed, elapsed_secs, instant_after,
    validate_admit, validate_key, AdmitCounters, RateLimiter, LEVEL_EPSILON,
};
use crate::config::{Algorithm, AlgorithmParameters, PolicyConfig};
use crate::error::{RateLimitError, RateLimitResult};
use crate::keylock::KeyLocks;
use crate::state::{LimiterStats, RateLimitState};
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Continuous-refill burst limiter.
///
/// The bucket holds up to `capacity` tokens and regains `refill_rate` tokens
/// per second; each admitted call consumes `permits` tokens. A zero refill
/// rate turns the bucket into a one-shot quota that never replenishes.
pub struct TokenBucketLimiter {
    config: PolicyConfig,
    capacity: f64,
    refill_rate: f64,
    state_ttl: Duration,
    storage: Arc<dyn Storage>,
    locks: KeyLocks,
    counters: AdmitCounters,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("name", &self.config.name)
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish()
    }
}

impl TokenBucketLimiter {
    /// Create a limiter from a validated policy configuration.
    pub fn new(config: PolicyConfig, storage: Arc<dyn Storage>) -> RateLimitResult<Self> {
        config.validate()?;

        Ok(Self {
            capacity: config.capacity(),
            refill_rate: config.refill_rate(),
            state_ttl: config.effective_state_ttl(),
            config,
            storage,
            locks: KeyLocks::new(),
            counters: AdmitCounters::default(),
        })
    }

    /// Evict per-key lock slots idle for at least `max_idle`.
    pub fn sweep_locks(&self, max_idle: Duration) -> usize {
        self.locks.sweep(max_idle)
    }

    fn storage_key(&self, key: &str) -> String {
        format!(
            "{}:{}:{}",
            Algorithm::TokenBucket.key_prefix(),
            self.config.name,
            key
        )
    }

    /// Current level after lazy refill, clamped to capacity.
    fn refilled_level(&self, record: &TokenBucketRecord, now: chrono::DateTime<Utc>) -> f64 {
        let refilled =
            record.tokens + elapsed_secs(record.last_refill, now) * self.refill_rate;
        refilled.min(self.capacity)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn admit(
        &self,
        key: &str,
        permits: u64,
        deadline: Option<Instant>,
    ) -> RateLimitResult<bool> {
        validate_admit(key, permits)?;

        let _section = self.locks.acquire(key, deadline).await?;
        let storage_key = self.storage_key(key);

        let loaded = match bounded(deadline, "storage read", self.storage.get(&storage_key)).await
        {
            Ok(value) => value,
            Err(err) => {
                return admit_on_storage_failure(
                    self.config.fail_open,
                    &self.config.name,
                    &self.counters,
                    err,
                )
            },
        };

        let now = Utc::now();
        let record = loaded
            .and_then(|raw| records::decode::<TokenBucketRecord>(&self.config.name, key, &raw))
            .unwrap_or(TokenBucketRecord {
                tokens: self.capacity,
                last_refill: now,
            });

        let level = self.refilled_level(&record, now);
        let requested = permits as f64;
        let admitted = level + LEVEL_EPSILON >= requested;

        let updated = TokenBucketRecord {
            tokens: if admitted {
                (level - requested).max(0.0)
            } else {
                level
            },
            last_refill: now,
        };

        if deadline_elapsed(deadline) {
            return Err(RateLimitError::Cancelled {
                waiting_on: "state write",
            });
        }

        match self
            .storage
            .set(&storage_key, &records::encode(&updated), Some(self.state_ttl))
            .await
        {
            Ok(()) => {
                self.counters.record(admitted);
                Ok(admitted)
            },
            Err(err) => admit_on_storage_failure(
                self.config.fail_open,
                &self.config.name,
                &self.counters,
                err,
            ),
        }
    }

    async fn state(&self, key: &str) -> RateLimitResult<Option<RateLimitState>> {
        validate_key(key)?;

        let storage_key = self.storage_key(key);
        let Some(raw) = self.storage.get(&storage_key).await? else {
            return Ok(None);
        };
        let Some(record) = records::decode::<TokenBucketRecord>(&self.config.name, key, &raw)
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let level = self.refilled_level(&record, now);
        let deficit = (self.capacity - level).max(0.0);
        let reset_secs = deficit / self.refill_rate.max(LEVEL_EPSILON);

        Ok(Some(RateLimitState {
            key: key.to_string(),
            remaining_permits: (level + LEVEL_EPSILON).floor() as u64,
            reset_time: instant_after(now, reset_secs),
            total_permits: self.capacity as u64,
        }))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn max_requests(&self) -> u64 {
        self.config.max_requests
    }

    fn window(&self) -> Duration {
        self.config.window
    }

    fn parameters(&self) -> &AlgorithmParameters {
        &self.config.parameters
    }

    fn stats(&self) -> LimiterStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn limiter(capacity: f64, refill_rate: f64) -> TokenBucketLimiter {
        let config = PolicyConfig::new(
            "api",
            Algorithm::TokenBucket,
            capacity as u64,
            Duration::from_secs(1),
        )
        .with_parameters(
            AlgorithmParameters::new()
                .with_capacity(capacity)
                .with_refill_rate(refill_rate),
        );
        TokenBucketLimiter::new(config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_burst_up_to_capacity() {
        let limiter = limiter(5.0, 0.0);

        for _ in 0..5 {
            assert!(limiter.admit("k", 1, None).await.unwrap());
        }
        assert!(!limiter.admit("k", 1, None).await.unwrap());

        let stats = limiter.stats();
        assert_eq!(stats.checks, 6);
        assert_eq!(stats.admitted, 5);
        assert_eq!(stats.denied, 1);
    }

    #[tokio::test]
    async fn test_exact_capacity_is_admitted_once() {
        let limiter = limiter(5.0, 0.0);

        assert!(limiter.admit("k", 5, None).await.unwrap());
        assert!(!limiter.admit("k", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_over_capacity_always_denied() {
        let limiter = limiter(5.0, 100.0);

        assert!(!limiter.admit("k", 6, None).await.unwrap());
        assert!(limiter.admit("k", 5, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let limiter = limiter(2.0, 50.0);

        assert!(limiter.admit("k", 2, None).await.unwrap());
        assert!(!limiter.admit("k", 1, None).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;

        // 50 tokens/sec refills one token well within 60 ms.
        assert!(limiter.admit("k", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_refill_never_replenishes() {
        let limiter = limiter(2.0, 0.0);

        assert!(limiter.admit("k", 2, None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!limiter.admit("k", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let limiter = limiter(2.0, 0.0);

        assert!(limiter.admit("k1", 2, None).await.unwrap());
        assert!(!limiter.admit("k1", 1, None).await.unwrap());
        assert!(limiter.admit("k2", 2, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_snapshot() {
        let limiter = limiter(10.0, 1.0);

        assert!(limiter.admit("k", 3, None).await.unwrap());

        let state = limiter.state("k").await.unwrap().unwrap();
        assert_eq!(state.key, "k");
        assert_eq!(state.remaining_permits, 7);
        assert_eq!(state.total_permits, 10);
        assert!(state.reset_time > Utc::now());
    }

    #[tokio::test]
    async fn test_state_cold_key_is_none() {
        let limiter = limiter(10.0, 1.0);
        assert!(limiter.state("never-seen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_treated_as_cold() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let config =
            PolicyConfig::new("api", Algorithm::TokenBucket, 3, Duration::from_secs(1))
                .with_parameters(AlgorithmParameters::new().with_refill_rate(0.0));
        let limiter = TokenBucketLimiter::new(config, Arc::clone(&storage)).unwrap();

        storage
            .set("tokenbucket:api:k", "{broken", None)
            .await
            .unwrap();

        for _ in 0..3 {
            assert!(limiter.admit("k", 1, None).await.unwrap());
        }
        assert!(!limiter.admit("k", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_persisted_layout() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let config = PolicyConfig::new("api", Algorithm::TokenBucket, 5, Duration::from_secs(1));
        let limiter = TokenBucketLimiter::new(config, Arc::clone(&storage)).unwrap();

        assert!(limiter.admit("user:1", 2, None).await.unwrap());

        let raw = storage.get("tokenbucket:api:user:1").await.unwrap().unwrap();
        let record: TokenBucketRecord = serde_json::from_str(&raw).unwrap();
        assert!((record.tokens - 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let limiter = limiter(5.0, 1.0);

        assert!(matches!(
            limiter.admit("", 1, None).await.unwrap_err(),
            RateLimitError::BlankKey
        ));
        assert!(matches!(
            limiter.admit("k", 0, None).await.unwrap_err(),
            RateLimitError::ZeroPermits
        ));
        assert!(matches!(
            limiter.state("  ").await.unwrap_err(),
            RateLimitError::BlankKey
        ));
    }

    #[tokio::test]
    async fn test_accessors() {
        let limiter = limiter(5.0, 1.0);

        assert_eq!(limiter.name(), "api");
        assert_eq!(limiter.algorithm(), Algorithm::TokenBucket);
        assert_eq!(limiter.max_requests(), 5);
        assert_eq!(limiter.window(), Duration::from_secs(1));
        assert_eq!(limiter.parameters().refill_rate, Some(1.0));
    }
}
