//! Fixed-window rate limiter.

use super::{
    admit_on_storage_failure, deadline_elapsed, validate_admit, validate_key, AdmitCounters,
    RateLimiter,
};
use crate::config::{Algorithm, AlgorithmParameters, PolicyConfig};
use crate::error::{RateLimitError, RateLimitResult};
use crate::keylock::KeyLocks;
use crate::state::{LimiterStats, RateLimitState};
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Tumbling-window counter limiter.
///
/// The window id is embedded in the storage key, so each window is a fresh
/// counter and old windows expire via TTL. The counter is maintained with the
/// store's atomic increment: an increment that lands over the limit is
/// refunded and the call denied, which keeps the per-window total exact even
/// across processes sharing a remote store. The canonical fixed-window edge
/// (up to 2× the limit observable across a boundary) applies.
pub struct FixedWindowLimiter {
    config: PolicyConfig,
    window_secs: f64,
    state_ttl: Duration,
    storage: Arc<dyn Storage>,
    locks: KeyLocks,
    counters: AdmitCounters,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("name", &self.config.name)
            .field("limit", &self.config.max_requests)
            .field("window_secs", &self.window_secs)
            .finish()
    }
}

impl FixedWindowLimiter {
    /// Create a limiter from a validated policy configuration.
    pub fn new(config: PolicyConfig, storage: Arc<dyn Storage>) -> RateLimitResult<Self> {
        config.validate()?;

        Ok(Self {
            window_secs: config.window.as_secs_f64(),
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

    fn window_id(&self, now: DateTime<Utc>) -> i64 {
        let epoch_secs = now.timestamp_millis() as f64 / 1000.0;
        (epoch_secs / self.window_secs).floor() as i64
    }

    fn window_close(&self, window_id: i64) -> DateTime<Utc> {
        let close_millis = ((window_id + 1) as f64 * self.window_secs * 1000.0).round() as i64;
        DateTime::from_timestamp_millis(close_millis).unwrap_or_else(Utc::now)
    }

    fn storage_key(&self, key: &str, window_id: i64) -> String {
        format!(
            "{}:{}:{}:{}",
            Algorithm::FixedWindow.key_prefix(),
            self.config.name,
            key,
            window_id
        )
    }

    /// Increment the window counter, resetting it first if its stored value
    /// is not an integer.
    async fn bump_counter(&self, storage_key: &str, delta: i64) -> RateLimitResult<i64> {
        match self
            .storage
            .incr(storage_key, delta, Some(self.state_ttl))
            .await
        {
            Ok(updated) => Ok(updated),
            Err(RateLimitError::CorruptCounter { .. }) => {
                warn!(
                    policy = %self.config.name,
                    key = storage_key,
                    "resetting corrupt window counter"
                );
                self.storage.remove(storage_key).await?;
                self.storage
                    .incr(storage_key, delta, Some(self.state_ttl))
                    .await
            },
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn admit(
        &self,
        key: &str,
        permits: u64,
        deadline: Option<Instant>,
    ) -> RateLimitResult<bool> {
        validate_admit(key, permits)?;

        let _section = self.locks.acquire(key, deadline).await?;

        if deadline_elapsed(deadline) {
            return Err(RateLimitError::Cancelled {
                waiting_on: "counter update",
            });
        }

        let storage_key = self.storage_key(key, self.window_id(Utc::now()));
        let updated = match self.bump_counter(&storage_key, permits as i64).await {
            Ok(updated) => updated,
            Err(err) => {
                return admit_on_storage_failure(
                    self.config.fail_open,
                    &self.config.name,
                    &self.counters,
                    err,
                )
            },
        };

        if updated <= self.config.max_requests as i64 {
            self.counters.record(true);
            return Ok(true);
        }

        // Over the limit: refund the increment and deny.
        if let Err(err) = self.storage.decr(&storage_key, permits as i64).await {
            if !self.config.fail_open {
                return Err(err);
            }
            warn!(
                policy = %self.config.name,
                error = %err,
                "failed to refund over-limit window increment"
            );
        }

        self.counters.record(false);
        Ok(false)
    }

    async fn state(&self, key: &str) -> RateLimitResult<Option<RateLimitState>> {
        validate_key(key)?;

        let now = Utc::now();
        let window_id = self.window_id(now);
        let storage_key = self.storage_key(key, window_id);

        let Some(raw) = self.storage.get(&storage_key).await? else {
            return Ok(None);
        };
        let Ok(count) = raw.trim().parse::<i64>() else {
            warn!(
                policy = %self.config.name,
                key = %storage_key,
                "ignoring non-integer window counter"
            );
            return Ok(None);
        };

        let used = count.max(0) as u64;
        Ok(Some(RateLimitState {
            key: key.to_string(),
            remaining_permits: self.config.max_requests.saturating_sub(used),
            reset_time: self.window_close(window_id),
            total_permits: self.config.max_requests,
        }))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
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
