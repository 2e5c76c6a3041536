//! Persisted state records shared across storage backends.
//!
//! The serialized forms are part of the storage contract: every process
//! sharing a store must read and write identical layouts. Instants are
//! RFC 3339 UTC; fractional levels are string-encoded so no precision is
//! lost to the number formatting of whatever wrote the record.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Token-bucket state: current level and when it was last recalculated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TokenBucketRecord {
    #[serde(with = "real_string")]
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
}

/// Leaky-bucket state: pending work level and drain bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct LeakyBucketRecord {
    #[serde(with = "real_string")]
    pub current_level: f64,
    pub last_leak_time: DateTime<Utc>,
    pub last_request_time: DateTime<Utc>,
}

/// One admitted batch inside a sliding window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SlidingWindowEntry {
    pub timestamp: DateTime<Utc>,
    pub count: u64,
}

/// Sliding-window state: retained entries plus derived window fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SlidingWindowRecord {
    pub entries: Vec<SlidingWindowEntry>,
    pub current_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Decode a stored record, treating undecodable state as a cold key.
pub(crate) fn decode<T: DeserializeOwned>(policy: &str, key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(policy, key, error = %err, "discarding undecodable limiter state");
            None
        },
    }
}

/// Encode a record for storage.
pub(crate) fn encode<T: Serialize>(record: &T) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

/// Serialize an `f64` as its shortest round-trippable decimal string,
/// always with a `.` separator regardless of locale.
pub(crate) mod real_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.trim().parse::<f64>().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_record_round_trip() {
        let record = TokenBucketRecord {
            tokens: 4.999999999999999,
            last_refill: Utc::now(),
        };

        let json = encode(&record);
        let back: TokenBucketRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_tokens_are_string_encoded() {
        let record = TokenBucketRecord {
            tokens: 2.5,
            last_refill: DateTime::parse_from_rfc3339("2026-08-02T09:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let json = encode(&record);
        assert!(json.contains(r#""tokens":"2.5""#));
        assert!(json.contains("2026-08-02T09:30:00Z"));
    }

    #[test]
    fn test_leaky_bucket_record_round_trip() {
        let now = Utc::now();
        let record = LeakyBucketRecord {
            current_level: 0.1 + 0.2,
            last_leak_time: now,
            last_request_time: now,
        };

        let back: LeakyBucketRecord = serde_json::from_str(&encode(&record)).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_sliding_window_record_round_trip() {
        let now = Utc::now();
        let record = SlidingWindowRecord {
            entries: vec![
                SlidingWindowEntry {
                    timestamp: now,
                    count: 1,
                },
                SlidingWindowEntry {
                    timestamp: now,
                    count: 3,
                },
            ],
            current_count: 4,
            window_start: now - chrono::Duration::seconds(1),
            window_end: now,
        };

        let back: SlidingWindowRecord = serde_json::from_str(&encode(&record)).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let record: Option<TokenBucketRecord> = decode("api", "k", "{not json");
        assert!(record.is_none());

        let record: Option<TokenBucketRecord> = decode("api", "k", r#"{"tokens":"abc"}"#);
        assert!(record.is_none());
    }
}
