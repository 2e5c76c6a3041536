//! Error types for the rate-limiting core.

use thiserror::Error;

/// Result type for rate-limiting operations.
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Errors that can occur during rate limiting.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Empty or whitespace-only caller key.
    #[error("key must not be empty or blank")]
    BlankKey,

    /// Empty or whitespace-only policy name.
    #[error("policy name must not be empty or blank")]
    BlankName,

    /// Admission requested for fewer than one permit.
    #[error("permits must be at least 1")]
    ZeroPermits,

    /// Algorithm name did not match any supported kind.
    #[error("unknown algorithm '{name}'")]
    UnknownAlgorithm {
        /// The name as supplied by the caller.
        name: String,
    },

    /// A required configuration field was absent.
    #[error("missing configuration field '{field}'")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A configuration value could not be converted to its expected type.
    #[error("invalid value '{value}' for configuration field '{field}'")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// The raw value as supplied.
        value: String,
    },

    /// A policy with this name already exists in the factory registry.
    #[error("policy '{name}' already registered")]
    DuplicatePolicy {
        /// The conflicting policy name.
        name: String,
    },

    /// A numeric configuration value was outside its allowed range.
    #[error("{field} out of range: {reason}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The caller-supplied deadline elapsed at a suspension point.
    #[error("cancelled: deadline elapsed while waiting on {waiting_on}")]
    Cancelled {
        /// Which suspension point was active when the deadline elapsed.
        waiting_on: &'static str,
    },

    /// The underlying store could not satisfy the operation.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Backend-specific description of the failure.
        message: String,
    },

    /// A stored value could not be interpreted as an integer counter.
    #[error("stored value for '{key}' is not an integer counter")]
    CorruptCounter {
        /// The storage key holding the undecodable value.
        key: String,
    },
}

impl RateLimitError {
    /// Check whether the error is an invalid-argument programming error.
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::BlankKey
                | Self::BlankName
                | Self::ZeroPermits
                | Self::UnknownAlgorithm { .. }
                | Self::MissingField { .. }
                | Self::InvalidField { .. }
                | Self::DuplicatePolicy { .. }
        )
    }

    /// Check whether the error may succeed on retry.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::StorageUnavailable { .. }
        )
    }
}
