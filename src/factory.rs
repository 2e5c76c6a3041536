//! Policy factory: declarative configuration in, live limiter out.

use crate::config::{Algorithm, AlgorithmParameters, PolicyConfig};
use crate::error::{RateLimitError, RateLimitResult};
use crate::limiter::{
    FixedWindowLimiter, LeakyBucketLimiter, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter,
};
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Builds limiters against a shared storage backend and keeps a registry of
/// the policies it has created. Policy names are unique within one factory.
pub struct PolicyFactory {
    storage: Arc<dyn Storage>,
    registry: Mutex<HashMap<String, Arc<dyn RateLimiter>>>,
}

impl std::fmt::Debug for PolicyFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyFactory")
            .field("policies", &self.registry.lock().unwrap().len())
            .finish()
    }
}

impl PolicyFactory {
    /// Create a factory over the given storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Build a limiter from a full policy configuration and register it.
    pub fn create(&self, config: PolicyConfig) -> RateLimitResult<Arc<dyn RateLimiter>> {
        config.validate()?;

        let mut registry = self.registry.lock().unwrap();
        if registry.contains_key(&config.name) {
            return Err(RateLimitError::DuplicatePolicy {
                name: config.name.clone(),
            });
        }

        let name = config.name.clone();
        let storage = Arc::clone(&self.storage);
        let limiter: Arc<dyn RateLimiter> = match config.algorithm {
            Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(config, storage)?),
            Algorithm::LeakyBucket => Arc::new(LeakyBucketLimiter::new(config, storage)?),
            Algorithm::FixedWindow => Arc::new(FixedWindowLimiter::new(config, storage)?),
            Algorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(config, storage)?),
        };

        debug!(policy = %name, algorithm = %limiter.algorithm(), "registered rate-limit policy");
        registry.insert(name, Arc::clone(&limiter));
        Ok(limiter)
    }

    /// Build a limiter from individual fields; the algorithm name is parsed
    /// case-insensitively.
    pub fn create_by_name(
        &self,
        name: &str,
        algorithm: &str,
        max_requests: u64,
        window: Duration,
        parameters: Option<AlgorithmParameters>,
    ) -> RateLimitResult<Arc<dyn RateLimiter>> {
        let algorithm = Algorithm::parse(algorithm)?;
        let mut config = PolicyConfig::new(name, algorithm, max_requests, window);
        if let Some(parameters) = parameters {
            config = config.with_parameters(parameters);
        }
        self.create(config)
    }

    /// Build a limiter from an untyped string map, e.g. configuration loaded
    /// from the environment. Recognized keys: `algorithm`, `max_requests`,
    /// `window`, `capacity`, `refill_rate`, `leak_rate`, `fail_open`,
    /// `state_ttl`. Durations accept humantime forms (`"30s"`, `"2m"`) or
    /// bare seconds.
    pub fn create_from_map(
        &self,
        name: &str,
        fields: &HashMap<String, String>,
    ) -> RateLimitResult<Arc<dyn RateLimiter>> {
        let algorithm = Algorithm::parse(require(fields, "algorithm")?)?;
        let max_requests = parse_integer(require(fields, "max_requests")?, "max_requests")?;
        let window = parse_duration(require(fields, "window")?, "window")?;

        let mut parameters = AlgorithmParameters::new();
        if let Some(raw) = fields.get("capacity") {
            parameters.capacity = Some(parse_real(raw, "capacity")?);
        }
        if let Some(raw) = fields.get("refill_rate") {
            parameters.refill_rate = Some(parse_real(raw, "refill_rate")?);
        }
        if let Some(raw) = fields.get("leak_rate") {
            parameters.leak_rate = Some(parse_real(raw, "leak_rate")?);
        }

        let mut config =
            PolicyConfig::new(name, algorithm, max_requests, window).with_parameters(parameters);
        if let Some(raw) = fields.get("fail_open") {
            config.fail_open = parse_flag(raw, "fail_open")?;
        }
        if let Some(raw) = fields.get("state_ttl") {
            config.state_ttl = Some(parse_duration(raw, "state_ttl")?);
        }

        self.create(config)
    }

    /// Look up a previously created limiter by policy name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn RateLimiter>> {
        self.registry.lock().unwrap().get(name).cloned()
    }

    /// Drop a policy from the registry, returning it if present. Callers
    /// still holding the limiter keep it alive; the name becomes reusable.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn RateLimiter>> {
        self.registry.lock().unwrap().remove(name)
    }

    /// Number of registered policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn require<'a>(
    fields: &'a HashMap<String, String>,
    field: &'static str,
) -> RateLimitResult<&'a str> {
    fields
        .get(field)
        .map(String::as_str)
        .ok_or(RateLimitError::MissingField { field })
}

fn parse_integer(raw: &str, field: &'static str) -> RateLimitResult<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| RateLimitError::InvalidField {
            field,
            value: raw.to_string(),
        })
}

fn parse_real(raw: &str, field: &'static str) -> RateLimitResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| RateLimitError::InvalidField {
            field,
            value: raw.to_string(),
        })
}

fn parse_flag(raw: &str, field: &'static str) -> RateLimitResult<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|_| RateLimitError::InvalidField {
            field,
            value: raw.to_string(),
        })
}

fn parse_duration(raw: &str, field: &'static str) -> RateLimitResult<Duration> {
    let trimmed = raw.trim();
    if let Ok(duration) = humantime::parse_duration(trimmed) {
        return Ok(duration);
    }
    // Bare numbers are taken as seconds.
    trimmed
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| RateLimitError::InvalidField {
            field,
            value: raw.to_string(),
        })
}
