//! Record types stored in SurrealDB.
//!
//! Timestamps are kept as unix milliseconds so expiry comparisons can be
//! pushed into queries without datetime conversions.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One shared-cache row.
///
/// `value_json` holds the serialized payload; the persistence layer does not
/// interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub value_json: String,
    pub inserted_at_ms: i64,
    pub expires_at_ms: i64,
}

impl CacheRecord {
    /// Create a record that expires `ttl_ms` milliseconds from now.
    pub fn new(key: impl Into<String>, value_json: impl Into<String>, ttl_ms: i64) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            key: key.into(),
            value_json: value_json.into(),
            inserted_at_ms: now,
            expires_at_ms: now.saturating_add(ttl_ms),
        }
    }

    /// Whether the record is past its expiry at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Whether the record is past its expiry right now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }
}

/// One persisted audit event.
///
/// Hash chaining is computed by the caller; this layer only stores the
/// fields verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: i64,
    pub event_type: String,
    pub actor: String,
    pub action: String,
    pub result: String,
    pub timestamp: String,
    pub details_json: String,
    pub prev_hash: String,
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_record_expiry_window() {
        let record = CacheRecord::new("k", "{}", 60_000);
        assert_eq!(record.expires_at_ms - record.inserted_at_ms, 60_000);
        assert!(!record.is_expired());
        assert!(record.is_expired_at(record.expires_at_ms));
    }

    #[test]
    fn test_cache_record_zero_ttl_is_expired() {
        let record = CacheRecord::new("k", "{}", 0);
        assert!(record.is_expired());
    }
}
