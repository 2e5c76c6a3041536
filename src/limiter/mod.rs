//! Rate limiters.
//!
//! Each limiter implements the [`RateLimiter`] contract over a shared
//! [`Storage`](crate::storage::Storage) backend: `admit` accounts permits
//! against the policy under the key's critical section, `state` returns a
//! lock-free snapshot of the current counters.

mod fixed_window;
mod leaky_bucket;
mod records;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use leaky_bucket::LeakyBucketLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use crate::config::{Algorithm, AlgorithmParameters};
use crate::error::{RateLimitError, RateLimitResult};
use crate::state::{LimiterStats, RateLimitState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

/// Comparison slack for fractional token levels.
pub(crate) const LEVEL_EPSILON: f64 = 1e-9;

/// A live rate-limit policy.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether `permits` are admitted for `key`.
    ///
    /// Returns `true` iff the permits were accounted against the limiter;
    /// they are not refunded. `deadline` bounds the wait for the per-key
    /// section and the storage read; once the state write has been issued it
    /// is allowed to complete.
    async fn admit(
        &self,
        key: &str,
        permits: u64,
        deadline: Option<Instant>,
    ) -> RateLimitResult<bool>;

    /// Best-effort snapshot of the current state for `key`, or `None` for a
    /// cold key.
    ///
    /// Never mutates storage and never acquires the per-key section, so the
    /// snapshot may be momentarily stale under concurrent admits.
    async fn state(&self, key: &str) -> RateLimitResult<Option<RateLimitState>>;

    /// Policy name.
    fn name(&self) -> &str;

    /// Algorithm the policy runs.
    fn algorithm(&self) -> Algorithm;

    /// Admits allowed per window.
    fn max_requests(&self) -> u64;

    /// Window length.
    fn window(&self) -> Duration;

    /// Algorithm-specific parameters.
    fn parameters(&self) -> &AlgorithmParameters;

    /// Admission counters since construction.
    fn stats(&self) -> LimiterStats;
}

/// Atomic admission counters shared by all limiters.
#[derive(Debug, Default)]
pub(crate) struct AdmitCounters {
    checks: AtomicU64,
    admitted: AtomicU64,
    denied: AtomicU64,
}

impl AdmitCounters {
    pub(crate) fn record(&self, admitted: bool) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> LimiterStats {
        LimiterStats {
            checks: self.checks.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

/// Reject blank keys at every limiter entry point.
pub(crate) fn validate_key(key: &str) -> RateLimitResult<()> {
    if key.trim().is_empty() {
        return Err(RateLimitError::BlankKey);
    }
    Ok(())
}

/// Reject blank keys and zero permits on `admit`.
pub(crate) fn validate_admit(key: &str, permits: u64) -> RateLimitResult<()> {
    validate_key(key)?;
    if permits == 0 {
        return Err(RateLimitError::ZeroPermits);
    }
    Ok(())
}

/// Run a storage future, failing with `cancelled` if the deadline elapses
/// before it resolves.
pub(crate) async fn bounded<T, F>(
    deadline: Option<Instant>,
    waiting_on: &'static str,
    future: F,
) -> RateLimitResult<T>
where
    F: Future<Output = RateLimitResult<T>>,
{
    match deadline {
        Some(at) => match timeout_at(at, future).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::Cancelled { waiting_on }),
        },
        None => future.await,
    }
}

/// Whether a deadline has already passed.
pub(crate) fn deadline_elapsed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| Instant::now() >= at)
}

/// Map a storage failure during `admit` to the policy's failure mode:
/// admit when fail-open, propagate otherwise.
pub(crate) fn admit_on_storage_failure(
    fail_open: bool,
    policy: &str,
    counters: &AdmitCounters,
    err: RateLimitError,
) -> RateLimitResult<bool> {
    match err {
        RateLimitError::StorageUnavailable { .. } if fail_open => {
            warn!(policy, error = %err, "storage unavailable, admitting fail-open");
            counters.record(true);
            Ok(true)
        },
        other => Err(other),
    }
}

/// Elapsed seconds between two instants, clamped to zero under clock skew.
pub(crate) fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).to_std().map_or(0.0, |d| d.as_secs_f64())
}

// Reset projections are capped so a near-zero refill rate cannot push the
// arithmetic past the chrono range.
const MAX_RESET_SECS: f64 = 86_400.0 * 365.0 * 100.0;

/// The instant `secs` seconds after `now`, clamped to a representable range.
pub(crate) fn instant_after(now: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    let clamped = secs.clamp(0.0, MAX_RESET_SECS);
    now + chrono::Duration::milliseconds((clamped * 1000.0).round() as i64)
}
