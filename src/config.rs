//! Policy configuration for rate limiting.

use crate::error::{RateLimitError, RateLimitResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The rate-limiting algorithms supported by the policy factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Continuous-refill burst limiter.
    TokenBucket,

    /// Constant-drain smoothing limiter.
    LeakyBucket,

    /// Tumbling-window counter limiter.
    FixedWindow,

    /// Precise rolling-window counter limiter.
    SlidingWindow,
}

impl Algorithm {
    /// Parse an algorithm name, case-insensitively and ignoring `-`/`_`
    /// separators, so `"token-bucket"`, `"TokenBucket"` and `"token_bucket"`
    /// all resolve to the same kind.
    pub fn parse(name: &str) -> RateLimitResult<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "tokenbucket" => Ok(Self::TokenBucket),
            "leakybucket" => Ok(Self::LeakyBucket),
            "fixedwindow" => Ok(Self::FixedWindow),
            "slidingwindow" => Ok(Self::SlidingWindow),
            _ => Err(RateLimitError::UnknownAlgorithm {
                name: name.to_string(),
            }),
        }
    }

    /// Prefix used for this algorithm's storage keys.
    #[must_use]
    pub fn key_prefix(self) -> &'static str {
        match self {
            Self::TokenBucket => "tokenbucket",
            Self::LeakyBucket => "leakybucket",
            Self::FixedWindow => "fixedwindow",
            Self::SlidingWindow => "slidingwindow",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TokenBucket => "token-bucket",
            Self::LeakyBucket => "leaky-bucket",
            Self::FixedWindow => "fixed-window",
            Self::SlidingWindow => "sliding-window",
        };
        f.write_str(name)
    }
}

impl FromStr for Algorithm {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Algorithm-specific tuning parameters.
///
/// All fields are optional; omitted values are derived from the policy's
/// `max_requests` and `window` (see [`PolicyConfig::capacity`] and friends).
/// Window algorithms ignore these entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmParameters {
    /// Burst capacity for bucket algorithms.
    #[serde(default)]
    pub capacity: Option<f64>,

    /// Token refill rate in tokens per second (token bucket).
    #[serde(default)]
    pub refill_rate: Option<f64>,

    /// Drain rate in requests per second (leaky bucket).
    #[serde(default)]
    pub leak_rate: Option<f64>,
}

impl AlgorithmParameters {
    /// Create an empty parameter set (everything derived).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the burst capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the refill rate.
    #[must_use]
    pub fn with_refill_rate(mut self, refill_rate: f64) -> Self {
        self.refill_rate = Some(refill_rate);
        self
    }

    /// Set the leak rate.
    #[must_use]
    pub fn with_leak_rate(mut self, leak_rate: f64) -> Self {
        self.leak_rate = Some(leak_rate);
        self
    }
}

/// Declarative configuration for a single rate-limit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy name, unique within a factory registry.
    pub name: String,

    /// Which algorithm the policy runs.
    pub algorithm: Algorithm,

    /// Admits allowed per window.
    pub max_requests: u64,

    /// Window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Algorithm-specific parameters; derived from `max_requests`/`window`
    /// when omitted.
    #[serde(default)]
    pub parameters: AlgorithmParameters,

    /// Admit instead of erroring when the store is unreachable.
    #[serde(default)]
    pub fail_open: bool,

    /// Override for the stored-state TTL. Must be at least one window.
    #[serde(default, with = "humantime_serde")]
    pub state_ttl: Option<Duration>,
}

const TOKEN_BUCKET_TTL: Duration = Duration::from_secs(300);
const LEAKY_BUCKET_TTL: Duration = Duration::from_secs(3600);

impl PolicyConfig {
    /// Create a policy configuration with derived parameters.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        algorithm: Algorithm,
        max_requests: u64,
        window: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            algorithm,
            max_requests,
            window,
            parameters: AlgorithmParameters::default(),
            fail_open: false,
            state_ttl: None,
        }
    }

    /// Set the algorithm parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: AlgorithmParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Enable fail-open behavior on storage failure.
    #[must_use]
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Override the stored-state TTL.
    #[must_use]
    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = Some(ttl);
        self
    }

    /// Effective burst capacity for bucket algorithms.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.parameters.capacity.unwrap_or(self.max_requests as f64)
    }

    /// Effective refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.parameters
            .refill_rate
            .unwrap_or_else(|| self.max_requests as f64 / self.window.as_secs_f64())
    }

    /// Effective leak rate in requests per second.
    #[must_use]
    pub fn leak_rate(&self) -> f64 {
        self.parameters
            .leak_rate
            .unwrap_or_else(|| self.max_requests as f64 / self.window.as_secs_f64())
    }

    /// TTL applied to stored state for this policy. Never shorter than one
    /// window, so live state cannot expire mid-window.
    #[must_use]
    pub fn effective_state_ttl(&self) -> Duration {
        self.state_ttl.unwrap_or(match self.algorithm {
            Algorithm::TokenBucket => TOKEN_BUCKET_TTL.max(self.window),
            Algorithm::LeakyBucket => LEAKY_BUCKET_TTL.max(self.window),
            Algorithm::FixedWindow => self.window,
            Algorithm::SlidingWindow => self.window * 2,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RateLimitResult<()> {
        if self.name.trim().is_empty() {
            return Err(RateLimitError::BlankName);
        }

        if self.max_requests == 0 {
            return Err(RateLimitError::OutOfRange {
                field: "max_requests",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.window.is_zero() {
            return Err(RateLimitError::OutOfRange {
                field: "window",
                reason: "must be greater than 0".to_string(),
            });
        }

        if let Some(capacity) = self.parameters.capacity {
            if !capacity.is_finite() || capacity <= 0.0 {
                return Err(RateLimitError::OutOfRange {
                    field: "capacity",
                    reason: format!("{capacity} must be a finite value greater than 0"),
                });
            }

            // A leaky bucket counts whole units of pending work.
            if self.algorithm == Algorithm::LeakyBucket && capacity.fract() != 0.0 {
                return Err(RateLimitError::OutOfRange {
                    field: "capacity",
                    reason: format!("{capacity} must be a whole number for a leaky bucket"),
                });
            }
        }

        if let Some(refill_rate) = self.parameters.refill_rate {
            if !refill_rate.is_finite() || refill_rate < 0.0 {
                return Err(RateLimitError::OutOfRange {
                    field: "refill_rate",
                    reason: format!("{refill_rate} must be a finite value of at least 0"),
                });
            }
        }

        if let Some(leak_rate) = self.parameters.leak_rate {
            if !leak_rate.is_finite() || leak_rate <= 0.0 {
                return Err(RateLimitError::OutOfRange {
                    field: "leak_rate",
                    reason: format!("{leak_rate} must be a finite value greater than 0"),
                });
            }
        }

        if let Some(ttl) = self.state_ttl {
            if ttl < self.window {
                return Err(RateLimitError::OutOfRange {
                    field: "state_ttl",
                    reason: "must be at least one window".to_string(),
                });
            }
        }

        Ok(())
    }
}
