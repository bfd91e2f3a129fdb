//! Tamper-evident audit trail.
//!
//! Each [`AuditLogEntry`] carries the hash of its predecessor, and its own
//! hash is `sha256(prev_hash || body)`, so rewriting or dropping an entry
//! breaks every later link. The logger keeps a bounded ring in memory and
//! forwards every entry to its [`AuditSink`]s. Sink failures are logged and
//! swallowed: auditing never blocks execution.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codebox_state::{AuditRecord, SurrealHandle};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{SandboxError, SandboxResult};

/// `prev_hash` of the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub const DEFAULT_RING_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExecutionStart,
    ExecutionEnd,
    SecurityViolation,
    SecurityBlocked,
    RateLimitExceeded,
    ExecutionError,
    CircuitTransition,
    HealthCheckFailed,
    CacheInvalidated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ExecutionStart => "execution_start",
            AuditEventType::ExecutionEnd => "execution_end",
            AuditEventType::SecurityViolation => "security_violation",
            AuditEventType::SecurityBlocked => "security_blocked",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::ExecutionError => "execution_error",
            AuditEventType::CircuitTransition => "circuit_transition",
            AuditEventType::HealthCheckFailed => "health_check_failed",
            AuditEventType::CacheInvalidated => "cache_invalidated",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// One immutable audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sequence: u64,
    pub event_type: AuditEventType,
    pub actor: String,
    pub action: String,
    pub result: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct HashedBody<'a> {
    sequence: u64,
    event_type: AuditEventType,
    actor: &'a str,
    action: &'a str,
    result: &'a str,
    timestamp: String,
    details: &'a serde_json::Value,
}

impl AuditLogEntry {
    /// Recompute the hash from `prev_hash` and the entry body.
    pub fn compute_hash(&self) -> String {
        let body = HashedBody {
            sequence: self.sequence,
            event_type: self.event_type,
            actor: &self.actor,
            action: &self.action,
            result: &self.result,
            timestamp: self.timestamp.to_rfc3339(),
            details: &self.details,
        };
        // Serializing a borrowed struct of strings and a Value cannot fail.
        let body_json = serde_json::to_string(&body).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(body_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn to_record(&self) -> AuditRecord {
        AuditRecord {
            sequence: self.sequence as i64,
            event_type: self.event_type.as_str().to_string(),
            actor: self.actor.clone(),
            action: self.action.clone(),
            result: self.result.clone(),
            timestamp: self.timestamp.to_rfc3339(),
            details_json: self.details.to_string(),
            prev_hash: self.prev_hash.clone(),
            hash: self.hash.clone(),
        }
    }

    pub fn from_record(record: &AuditRecord) -> SandboxResult<Self> {
        let event_type = AuditEventType::parse(&record.event_type).ok_or_else(|| {
            SandboxError::Infrastructure(format!("unknown audit event type {}", record.event_type))
        })?;
        let timestamp = DateTime::parse_from_rfc3339(&record.timestamp)
            .map_err(|e| SandboxError::Infrastructure(format!("audit timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            sequence: record.sequence.max(0) as u64,
            event_type,
            actor: record.actor.clone(),
            action: record.action.clone(),
            result: record.result.clone(),
            timestamp,
            details: serde_json::from_str(&record.details_json)?,
            prev_hash: record.prev_hash.clone(),
            hash: record.hash.clone(),
        })
    }
}

/// First broken link found by [`verify_entries`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainBreak {
    #[error("entry {sequence}: stored hash does not match its contents")]
    HashMismatch { sequence: u64 },
    #[error("entry {sequence}: prev_hash does not match entry {previous}")]
    BrokenLink { sequence: u64, previous: u64 },
}

/// Verify that every entry hashes correctly and links to its predecessor.
/// Entries must be in sequence order; the first entry's link is trusted.
pub fn verify_entries(entries: &[AuditLogEntry]) -> Result<(), ChainBreak> {
    for (idx, entry) in entries.iter().enumerate() {
        if entry.compute_hash() != entry.hash {
            return Err(ChainBreak::HashMismatch {
                sequence: entry.sequence,
            });
        }
        if idx > 0 {
            let previous = &entries[idx - 1];
            if entry.prev_hash != previous.hash {
                return Err(ChainBreak::BrokenLink {
                    sequence: entry.sequence,
                    previous: previous.sequence,
                });
            }
        }
    }
    Ok(())
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, entry: &AuditLogEntry) -> SandboxResult<()>;
}

/// Appends one JSON document per line.
pub struct JsonlFileSink {
    path: PathBuf,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every entry, ordered by sequence.
    pub async fn read_all(path: impl AsRef<Path>) -> SandboxResult<Vec<AuditLogEntry>> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let mut entries = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str::<AuditLogEntry>)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}

#[async_trait]
impl AuditSink for JsonlFileSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write(&self, entry: &AuditLogEntry) -> SandboxResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Persists entries into the `audit_events` table.
pub struct SurrealAuditSink {
    handle: Arc<SurrealHandle>,
}

impl SurrealAuditSink {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self { handle }
    }

    pub async fn load_all(&self) -> SandboxResult<Vec<AuditLogEntry>> {
        self.handle
            .list_audit_events()
            .await?
            .iter()
            .map(AuditLogEntry::from_record)
            .collect()
    }
}

#[async_trait]
impl AuditSink for SurrealAuditSink {
    fn name(&self) -> &str {
        "surreal"
    }

    async fn write(&self, entry: &AuditLogEntry) -> SandboxResult<()> {
        self.handle.append_audit_event(&entry.to_record()).await?;
        Ok(())
    }
}

struct ChainState {
    next_sequence: u64,
    last_hash: String,
    ring: VecDeque<AuditLogEntry>,
}

/// Append-only, hash-chained audit logger.
pub struct AuditLogger {
    state: Mutex<ChainState>,
    capacity: usize,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl AuditLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ChainState {
                next_sequence: 1,
                last_hash: GENESIS_HASH.to_string(),
                ring: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event and forward it to every sink.
    pub async fn log(
        &self,
        event_type: AuditEventType,
        actor: &str,
        action: &str,
        result: &str,
        details: serde_json::Value,
    ) -> AuditLogEntry {
        let entry = {
            let mut state = self.lock();
            let mut entry = AuditLogEntry {
                sequence: state.next_sequence,
                event_type,
                actor: actor.to_string(),
                action: action.to_string(),
                result: result.to_string(),
                timestamp: Utc::now(),
                details,
                prev_hash: state.last_hash.clone(),
                hash: String::new(),
            };
            entry.hash = entry.compute_hash();

            state.next_sequence += 1;
            state.last_hash = entry.hash.clone();
            if state.ring.len() == self.capacity {
                state.ring.pop_front();
            }
            state.ring.push_back(entry.clone());
            entry
        };

        for sink in &self.sinks {
            if let Err(e) = sink.write(&entry).await {
                warn!(
                    sink = sink.name(),
                    sequence = entry.sequence,
                    error = %e,
                    "audit sink write failed"
                );
            }
        }
        entry
    }

    /// Entries still held in memory, oldest first.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.lock().ring.iter().cloned().collect()
    }

    pub fn recent(&self, n: usize) -> Vec<AuditLogEntry> {
        let state = self.lock();
        let skip = state.ring.len().saturating_sub(n);
        state.ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify the in-memory portion of the chain.
    pub fn verify_chain(&self) -> Result<(), ChainBreak> {
        let state = self.lock();
        let entries: Vec<AuditLogEntry> = state.ring.iter().cloned().collect();
        drop(state);
        verify_entries(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn write(&self, _entry: &AuditLogEntry) -> SandboxResult<()> {
            Err(SandboxError::Infrastructure("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_entries_are_chained() {
        let logger = AuditLogger::default();
        let a = logger
            .log(AuditEventType::ExecutionStart, "alice", "execute", "started", json!({"lang": "python"}))
            .await;
        let b = logger
            .log(AuditEventType::ExecutionEnd, "alice", "execute", "success", json!({}))
            .await;

        assert_eq!(a.sequence, 1);
        assert_eq!(a.prev_hash, GENESIS_HASH);
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(a.hash.len(), 64);
        assert!(logger.verify_chain().is_ok());
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let logger = AuditLogger::default();
        for i in 0..3 {
            logger
                .log(AuditEventType::ExecutionEnd, "bob", "execute", "success", json!({"i": i}))
                .await;
        }
        let mut entries = logger.entries();
        entries[1].result = "failure".into();
        assert_eq!(
            verify_entries(&entries),
            Err(ChainBreak::HashMismatch { sequence: 2 })
        );

        let mut entries = logger.entries();
        entries.remove(1);
        assert_eq!(
            verify_entries(&entries),
            Err(ChainBreak::BrokenLink {
                sequence: 3,
                previous: 1
            })
        );
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let logger = AuditLogger::new(2);
        for _ in 0..5 {
            logger
                .log(AuditEventType::ExecutionStart, "c", "execute", "started", json!(null))
                .await;
        }
        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 4);
        assert!(logger.verify_chain().is_ok());
        assert_eq!(logger.recent(1)[0].sequence, 5);
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let logger = AuditLogger::default().with_sink(Arc::new(FailingSink));
        let entry = logger
            .log(AuditEventType::ExecutionError, "d", "execute", "failure", json!({}))
            .await;
        assert_eq!(entry.sequence, 1);
        assert_eq!(logger.len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_sink_roundtrip_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");
        let logger = AuditLogger::default().with_sink(Arc::new(JsonlFileSink::new(&path)));
        for result in ["started", "success"] {
            logger
                .log(AuditEventType::ExecutionEnd, "e", "execute", result, json!({"k": [1, 2]}))
                .await;
        }
        let persisted = JsonlFileSink::read_all(&path).await.unwrap();
        assert_eq!(persisted.len(), 2);
        assert!(verify_entries(&persisted).is_ok());
    }

    #[tokio::test]
    async fn test_surreal_sink_persists_chain() {
        let handle = Arc::new(SurrealHandle::setup_db().await.unwrap());
        let sink = Arc::new(SurrealAuditSink::new(handle));
        let logger = AuditLogger::default().with_sink(sink.clone());
        logger
            .log(AuditEventType::SecurityBlocked, "f", "scan", "blocked", json!({"risk": 10.0}))
            .await;
        logger
            .log(AuditEventType::RateLimitExceeded, "f", "execute", "rejected", json!({}))
            .await;

        let stored = sink.load_all().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].event_type, AuditEventType::SecurityBlocked);
        assert!(verify_entries(&stored).is_ok());
    }
}
