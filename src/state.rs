//! Observable rate-limit state returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read-only snapshot of a key's rate-limit state.
///
/// Produced by [`RateLimiter::state`](crate::limiter::RateLimiter::state)
/// without acquiring the per-key section, so it may be momentarily stale
/// under concurrent admits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// The caller key the snapshot describes.
    pub key: String,

    /// Permits still available for admission.
    pub remaining_permits: u64,

    /// Approximate instant at which the limiter is back at full capacity.
    pub reset_time: DateTime<Utc>,

    /// Total permits the policy allows (capacity for bucket algorithms,
    /// limit for window algorithms).
    pub total_permits: u64,
}

impl RateLimitState {
    /// Whether the key has no permits left.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining_permits == 0
    }
}

/// Point-in-time admission counters for one limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    /// Total admission checks performed.
    pub checks: u64,

    /// Checks that returned admit.
    pub admitted: u64,

    /// Checks that returned deny.
    pub denied: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_exhausted() {
        let state = RateLimitState {
            key: "user:42".to_string(),
            remaining_permits: 0,
            reset_time: Utc::now(),
            total_permits: 10,
        };
        assert!(state.is_exhausted());

        let state = RateLimitState {
            remaining_permits: 3,
            ..state
        };
        assert!(!state.is_exhausted());
    }

    #[test]
    fn test_snapshot_serializes_reset_time_as_rfc3339() {
        let state = RateLimitState {
            key: "user:42".to_string(),
            remaining_permits: 5,
            reset_time: DateTime::parse_from_rfc3339("2026-08-02T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            total_permits: 10,
        };

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("2026-08-02T10:00:00Z"));
    }
}
