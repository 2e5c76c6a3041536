//! # flowgate
//!
//! A rate-limiting library: given a caller-supplied key (a user id, IP,
//! tenant, route), decide whether a request consuming some number of permits
//! is admitted or rejected, and expose the current state.
//!
//! ## Features
//!
//! - Four algorithms with different burst/smoothing properties: token
//!   bucket, leaky bucket, fixed window, sliding window
//! - Pluggable storage: in-process for a single node, Redis-backed for
//!   limits shared across a fleet
//! - Per-key serialization so concurrent admits on the same key are exact
//! - Deadline-based cancellation at every suspension point
//!
//! ## Usage
//!
//! ```no_run
//! use flowgate::{Algorithm, MemoryStore, PolicyConfig, PolicyFactory, RateLimiter};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> flowgate::RateLimitResult<()> {
//! let factory = PolicyFactory::new(Arc::new(MemoryStore::new()));
//! let limiter = factory.create(PolicyConfig::new(
//!     "api-writes",
//!     Algorithm::TokenBucket,
//!     100,
//!     Duration::from_secs(60),
//! ))?;
//!
//! if limiter.admit("user:42", 1, None).await? {
//!     // handle the request
//! } else {
//!     // reject with a retry hint from limiter.state("user:42")
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Every algorithm is expressed against the [`Storage`] contract, a flat
//! string-keyed map with per-key TTL and atomic counters, so the same
//! policy runs unchanged over the in-process store or a shared Redis
//! deployment. The [`PolicyFactory`] turns declarative configuration into
//! live limiters and keeps them in a named registry.

pub mod config;
pub mod error;
pub mod factory;
pub mod keylock;
pub mod limiter;
pub mod state;
pub mod storage;

pub use config::{Algorithm, AlgorithmParameters, PolicyConfig};
pub use error::{RateLimitError, RateLimitResult};
pub use factory::PolicyFactory;
pub use keylock::KeyLocks;
pub use limiter::{
    FixedWindowLimiter, LeakyBucketLimiter, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter,
};
pub use state::{LimiterStats, RateLimitState};
pub use storage::{MemoryStore, MemoryStoreConfig, RedisStore, RedisStoreConfig, Storage};
