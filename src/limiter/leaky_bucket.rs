//! Leaky-bucket rate limiter.

use super::records::{self, LeakyBucketRecord};
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

/// Constant-drain smoothing limiter.
///
/// The bucket level represents pending work: admitting adds `permits` units,
/// and the level drains at `leak_rate` units per second. Drain is computed
/// lazily on access; no background ticker is required.
pub struct LeakyBucketLimiter {
    config: PolicyConfig,
    capacity: f64,
    leak_rate: f64,
    state_ttl: Duration,
    storage: Arc<dyn Storage>,
    locks: KeyLocks,
    counters: AdmitCounters,
}

impl std::fmt::Debug for LeakyBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakyBucketLimiter")
            .field("name", &self.config.name)
            .field("capacity", &self.capacity)
            .field("leak_rate", &self.leak_rate)
            .finish()
    }
}

impl LeakyBucketLimiter {
    /// Create a limiter from a validated policy configuration.
    pub fn new(config: PolicyConfig, storage: Arc<dyn Storage>) -> RateLimitResult<Self> {
        config.validate()?;

        Ok(Self {
            capacity: config.capacity(),
            leak_rate: config.leak_rate(),
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
            Algorithm::LeakyBucket.key_prefix(),
            self.config.name,
            key
        )
    }

    /// Level after lazy drain, clamped to zero.
    fn drained_level(&self, record: &LeakyBucketRecord, now: chrono::DateTime<Utc>) -> f64 {
        let drained =
            record.current_level - elapsed_secs(record.last_leak_time, now) * self.leak_rate;
        drained.max(0.0)
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
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
            .and_then(|raw| records::decode::<LeakyBucketRecord>(&self.config.name, key, &raw))
            .unwrap_or(LeakyBucketRecord {
                current_level: 0.0,
                last_leak_time: now,
                last_request_time: now,
            });

        let level = self.drained_level(&record, now);
        let admitted = level + permits as f64 <= self.capacity + LEVEL_EPSILON;

        let updated = LeakyBucketRecord {
            current_level: if admitted {
                level + permits as f64
            } else {
                level
            },
            last_leak_time: now,
            last_request_time: now,
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
        let Some(record) = records::decode::<LeakyBucketRecord>(&self.config.name, key, &raw)
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let level = self.drained_level(&record, now);
        let headroom = (self.capacity - level).max(0.0);

        Ok(Some(RateLimitState {
            key: key.to_string(),
            remaining_permits: (headroom + LEVEL_EPSILON).floor() as u64,
            reset_time: instant_after(now, level / self.leak_rate),
            total_permits: self.capacity as u64,
        }))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
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

    fn limiter(capacity: f64, leak_rate: f64) -> LeakyBucketLimiter {
        let config = PolicyConfig::new(
            "drain",
            Algorithm::LeakyBucket,
            capacity as u64,
            Duration::from_secs(1),
        )
        .with_parameters(
            AlgorithmParameters::new()
                .with_capacity(capacity)
                .with_leak_rate(leak_rate),
        );
        LeakyBucketLimiter::new(config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_fills_to_capacity_then_denies() {
        let limiter = limiter(3.0, 0.001);

        for _ in 0..3 {
            assert!(limiter.admit("k", 1, None).await.unwrap());
        }
        assert!(!limiter.admit("k", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_drains_over_time() {
        let limiter = limiter(2.0, 50.0);

        assert!(limiter.admit("k", 2, None).await.unwrap());
        assert!(!limiter.admit("k", 1, None).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;

        // 50 units/sec drains one unit of headroom well within 60 ms.
        assert!(limiter.admit("k", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_larger_than_capacity_denied() {
        let limiter = limiter(4.0, 1.0);
        assert!(!limiter.admit("k", 5, None).await.unwrap());
        assert!(limiter.admit("k", 4, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_snapshot() {
        let limiter = limiter(10.0, 0.001);

        assert!(limiter.admit("k", 4, None).await.unwrap());

        let state = limiter.state("k").await.unwrap().unwrap();
        assert_eq!(state.remaining_permits, 6);
        assert_eq!(state.total_permits, 10);
        assert!(state.reset_time > Utc::now());

        assert!(limiter.state("cold").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persisted_layout() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let config = PolicyConfig::new("drain", Algorithm::LeakyBucket, 5, Duration::from_secs(1));
        let limiter = LeakyBucketLimiter::new(config, Arc::clone(&storage)).unwrap();

        assert!(limiter.admit("user:1", 2, None).await.unwrap());

        let raw = storage.get("leakybucket:drain:user:1").await.unwrap().unwrap();
        let record: LeakyBucketRecord = serde_json::from_str(&raw).unwrap();
        assert!((record.current_level - 2.0).abs() < 1e-6);
        assert_eq!(record.last_leak_time, record.last_request_time);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_treated_as_cold() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let config = PolicyConfig::new("drain", Algorithm::LeakyBucket, 2, Duration::from_secs(1))
            .with_parameters(AlgorithmParameters::new().with_leak_rate(0.001));
        let limiter = LeakyBucketLimiter::new(config, Arc::clone(&storage)).unwrap();

        storage
            .set("leakybucket:drain:k", "][", None)
            .await
            .unwrap();

        assert!(limiter.admit("k", 2, None).await.unwrap());
        assert!(!limiter.admit("k", 1, None).await.unwrap());
    }
}
