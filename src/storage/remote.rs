//! Redis-backed storage for fleet-wide rate limiting.

use super::{validate_key, validate_ttl, Storage};
use crate::error::{RateLimitError, RateLimitResult};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use std::time::Duration;

/// Configuration for the Redis store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL.
    pub url: String,

    /// Namespace prefixed to every key so tenants can share a server.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// TTL applied when `set`/`incr` are called without one.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Timeout for establishing connections.
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Timeout for individual commands.
    #[serde(default = "default_response_timeout", with = "humantime_serde")]
    pub response_timeout: Duration,
}

fn default_namespace() -> String {
    "flowgate".to_string()
}

fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(1)
}

impl RedisStoreConfig {
    /// Create a configuration for the given URL with defaults elsewhere.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: default_namespace(),
            default_ttl: default_ttl(),
            connection_timeout: default_connection_timeout(),
            response_timeout: default_response_timeout(),
        }
    }

    /// Set the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RateLimitResult<()> {
        if self.url.is_empty() {
            return Err(RateLimitError::MissingField { field: "url" });
        }

        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(RateLimitError::InvalidField {
                field: "url",
                value: self.url.clone(),
            });
        }

        if self.namespace.trim().is_empty() {
            return Err(RateLimitError::MissingField { field: "namespace" });
        }

        validate_ttl(self.default_ttl)?;

        Ok(())
    }
}

// DECRBY with a floor of 0. The EXISTS guard keeps the absent-key behavior
// aligned with the in-process store: return 0, do not create the key.
const DECR_FLOOR_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
local value = redis.call('DECRBY', KEYS[1], ARGV[1])
if value < 0 then
    redis.call('SET', KEYS[1], '0', 'KEEPTTL')
    value = 0
end
return value
";

/// Redis realization of [`Storage`].
///
/// `incr` uses the server's native `INCRBY` inside a `MULTI`/`EXEC` pipeline
/// with `EXPIRE`, so same-key increments are atomic across every process
/// sharing the server. The multiplexed connection manager reconnects on
/// failure and is shared by all concurrent callers.
pub struct RedisStore {
    connection: ConnectionManager,
    namespace: String,
    default_ttl: Duration,
    decr_floor: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the configured Redis server.
    pub async fn connect(config: RedisStoreConfig) -> RateLimitResult<Self> {
        config.validate()?;

        let client = redis::Client::open(config.url.as_str()).map_err(storage_error)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connection_timeout)
            .set_response_timeout(config.response_timeout);
        let connection = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(storage_error)?;

        Ok(Self {
            connection,
            namespace: config.namespace,
            default_ttl: config.default_ttl,
            decr_floor: redis::Script::new(DECR_FLOOR_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String {
        namespaced(&self.namespace, key)
    }
}

fn namespaced(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

fn storage_error(err: redis::RedisError) -> RateLimitError {
    RateLimitError::StorageUnavailable {
        message: err.to_string(),
    }
}

// Redis TTLs are whole seconds; round up so a stored key never expires
// before the requested duration.
fn ttl_secs(ttl: Duration) -> u64 {
    ((ttl.as_nanos() + 999_999_999) / 1_000_000_000).max(1) as u64
}

#[async_trait]
impl Storage for RedisStore {
    async fn get(&self, key: &str) -> RateLimitResult<Option<String>> {
        validate_key(key)?;
        let mut connection = self.connection.clone();

        let value: Option<String> = connection
            .get(self.full_key(key))
            .await
            .map_err(storage_error)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RateLimitResult<()> {
        validate_key(key)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        validate_ttl(ttl)?;
        let mut connection = self.connection.clone();

        let () = connection
            .set_ex(self.full_key(key), value, ttl_secs(ttl))
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> RateLimitResult<i64> {
        validate_key(key)?;
        let full_key = self.full_key(key);
        let mut connection = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("INCRBY").arg(&full_key).arg(delta);
        if let Some(ttl) = ttl {
            validate_ttl(ttl)?;
            pipe.cmd("EXPIRE").arg(&full_key).arg(ttl_secs(ttl)).ignore();
        }

        let (updated,): (i64,) = pipe
            .query_async(&mut connection)
            .await
            .map_err(|err| counter_error(err, &full_key))?;
        Ok(updated)
    }

    async fn decr(&self, key: &str, delta: i64) -> RateLimitResult<i64> {
        validate_key(key)?;
        let full_key = self.full_key(key);
        let mut connection = self.connection.clone();

        let updated: i64 = self
            .decr_floor
            .key(&full_key)
            .arg(delta)
            .invoke_async(&mut connection)
            .await
            .map_err(|err| counter_error(err, &full_key))?;
        Ok(updated)
    }

    async fn remove(&self, key: &str) -> RateLimitResult<()> {
        validate_key(key)?;
        let mut connection = self.connection.clone();

        let () = connection
            .del(self.full_key(key))
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> RateLimitResult<bool> {
        validate_key(key)?;
        let mut connection = self.connection.clone();

        let found: bool = connection
            .exists(self.full_key(key))
            .await
            .map_err(storage_error)?;
        Ok(found)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RateLimitResult<bool> {
        validate_key(key)?;
        validate_ttl(ttl)?;
        let mut connection = self.connection.clone();

        let applied: bool = connection
            .expire(self.full_key(key), ttl_secs(ttl) as i64)
            .await
            .map_err(storage_error)?;
        Ok(applied)
    }
}

/// Redis reports `INCRBY`/`DECRBY` on a non-numeric value as a type error;
/// surface that as a corrupt counter rather than an outage.
fn counter_error(err: redis::RedisError, key: &str) -> RateLimitError {
    if err.kind() == redis::ErrorKind::TypeError
        || err.code() == Some("ERR") && err.to_string().contains("not an integer")
    {
        RateLimitError::CorruptCounter {
            key: key.to_string(),
        }
    } else {
        storage_error(err)
    }
}
