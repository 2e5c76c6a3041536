//! Sliding-window rate limiter.

use super::records::{self, SlidingWindowEntry, SlidingWindowRecord};
use super::{
    admit_on_storage_failure, bounded, deadline_elapsed, validate_admit, validate_key,
    AdmitCounters, RateLimiter,
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

/// Precise rolling-window counter limiter.
///
/// State is an ordered list of `(timestamp, count)` entries. Admission counts
/// the entries inside `(now − window, now]`; the stored list retains up to
/// twice the window so late `state` queries and modest clock drift between
/// writers do not lose history. Retention never affects admission arithmetic.
pub struct SlidingWindowLimiter {
    config: PolicyConfig,
    window: chrono::Duration,
    state_ttl: Duration,
    storage: Arc<dyn Storage>,
    locks: KeyLocks,
    counters: AdmitCounters,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("name", &self.config.name)
            .field("limit", &self.config.max_requests)
            .field("window", &self.window)
            .finish()
    }
}

impl SlidingWindowLimiter {
    /// Create a limiter from a validated policy configuration.
    pub fn new(config: PolicyConfig, storage: Arc<dyn Storage>) -> RateLimitResult<Self> {
        config.validate()?;

        let window = chrono::Duration::from_std(config.window).map_err(|_| {
            RateLimitError::OutOfRange {
                field: "window",
                reason: "too large to represent".to_string(),
            }
        })?;

        Ok(Self {
            window,
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
            Algorithm::SlidingWindow.key_prefix(),
            self.config.name,
            key
        )
    }

    fn counted(entries: &[SlidingWindowEntry], cutoff: DateTime<Utc>) -> u64 {
        entries
            .iter()
            .filter(|entry| entry.timestamp >= cutoff)
            .map(|entry| entry.count)
            .sum()
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
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
        let mut entries = loaded
            .and_then(|raw| {
                records::decode::<SlidingWindowRecord>(&self.config.name, key, &raw)
            })
            .map(|record| record.entries)
            .unwrap_or_default();

        let window_start = now - self.window;
        let current = Self::counted(&entries, window_start);
        let admitted = current + permits <= self.config.max_requests;

        let retention_cutoff = now - self.window * 2;
        entries.retain(|entry| entry.timestamp >= retention_cutoff);
        if admitted {
            entries.push(SlidingWindowEntry {
                timestamp: now,
                count: permits,
            });
        }

        let updated = SlidingWindowRecord {
            current_count: if admitted { current + permits } else { current },
            window_start,
            window_end: now,
            entries,
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
        let Some(record) =
            records::decode::<SlidingWindowRecord>(&self.config.name, key, &raw)
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let window_start = now - self.window;
        let current = Self::counted(&record.entries, window_start);

        let oldest_live = record
            .entries
            .iter()
            .filter(|entry| entry.timestamp >= window_start)
            .map(|entry| entry.timestamp)
            .min();
        let reset_time = oldest_live.map_or(now, |oldest| oldest + self.window);

        Ok(Some(RateLimitState {
            key: key.to_string(),
            remaining_permits: self.config.max_requests.saturating_sub(current),
            reset_time,
            total_permits: self.config.max_requests,
        }))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
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
