//! Multi-level cache of execution responses.
//!
//! Tiers are consulted fastest first. A hit in a slower tier is copied into
//! every faster tier; writes and invalidations go to all tiers. A failing
//! tier is logged and treated as a miss, so the cache never fails a request.

pub mod fs;
pub mod memory;
pub mod surreal;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use codebox_state::SurrealHandle;

use crate::config::CacheConfig;
use crate::error::SandboxResult;
use crate::glob;
use crate::language::Language;
use crate::obs;
use crate::request::{ExecutionRequest, ExecutionType};
use crate::response::ExecutionResponse;

pub use fs::FsTier;
pub use memory::MemoryTier;
pub use surreal::SurrealTier;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state error: {0}")]
    State(#[from] codebox_state::StateError),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// A memoized response with its expiry, in unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: ExecutionResponse,
    pub inserted_at_ms: i64,
    pub expires_at_ms: i64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: ExecutionResponse, ttl: Duration) -> Self {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            key: key.into(),
            value,
            inserted_at_ms: now,
            expires_at_ms: now.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }
}

/// One storage level.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &str;

    /// Entry for `key`, expired or not.
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    async fn put(&self, entry: &CacheEntry) -> CacheResult<()>;

    /// Returns whether the key was present.
    async fn remove(&self, key: &str) -> CacheResult<bool>;

    async fn keys(&self) -> CacheResult<Vec<String>>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> CacheResult<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierHits {
    pub tier: String,
    pub hits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub tiers: Vec<TierHits>,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub tier_errors: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn total_hits(&self) -> u64 {
        self.tiers.iter().map(|t| t.hits).sum()
    }
}

pub struct MultiLevelCache {
    tiers: Vec<Arc<dyn CacheTier>>,
    default_ttl: Duration,
    hits: Vec<AtomicU64>,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    tier_errors: AtomicU64,
}

impl MultiLevelCache {
    /// Cache over `tiers`, fastest first.
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>, default_ttl: Duration) -> Self {
        let hits = tiers.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            tiers,
            default_ttl,
            hits,
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            tier_errors: AtomicU64::new(0),
        }
    }

    /// L1 only.
    pub fn in_memory(capacity: usize, default_ttl: Duration) -> Self {
        Self::new(vec![Arc::new(MemoryTier::new(capacity))], default_ttl)
    }

    /// Build the tiers enabled in `config`. The shared tier is added only
    /// when a SurrealDB handle is supplied.
    pub fn from_config(
        config: &CacheConfig,
        shared: Option<Arc<SurrealHandle>>,
    ) -> SandboxResult<Self> {
        let mut tiers: Vec<Arc<dyn CacheTier>> =
            vec![Arc::new(MemoryTier::new(config.l1_capacity))];
        if config.l2_enabled {
            match shared {
                Some(handle) => tiers.push(Arc::new(SurrealTier::new(handle))),
                None => warn!("cache: l2 enabled but no SurrealDB handle supplied; skipping"),
            }
        }
        if let Some(dir) = &config.l3_dir {
            tiers.push(Arc::new(FsTier::new(dir)?));
        }
        Ok(Self::new(tiers, config.default_ttl()))
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.name().to_string()).collect()
    }

    fn tier_failed(&self, tier: &dyn CacheTier, op: &str, err: &CacheError) {
        self.tier_errors.fetch_add(1, Ordering::Relaxed);
        warn!(tier = tier.name(), op, error = %err, "cache: tier error");
    }

    /// First live entry for `key`, backfilling faster tiers.
    pub async fn get(&self, key: &str) -> Option<ExecutionResponse> {
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(entry)) if entry.is_expired() => {
                    debug!(tier = tier.name(), key, "cache: expired entry purged");
                    if let Err(e) = tier.remove(key).await {
                        self.tier_failed(tier.as_ref(), "remove", &e);
                    }
                }
                Ok(Some(entry)) => {
                    for faster in &self.tiers[..idx] {
                        if let Err(e) = faster.put(&entry).await {
                            self.tier_failed(faster.as_ref(), "backfill", &e);
                        }
                    }
                    self.hits[idx].fetch_add(1, Ordering::Relaxed);
                    obs::emit_cache_hit(key, tier.name());
                    return Some(entry.value);
                }
                Ok(None) => {}
                Err(e) => self.tier_failed(tier.as_ref(), "get", &e),
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write to every tier. `ttl` defaults to the configured TTL.
    pub async fn set(&self, key: &str, value: ExecutionResponse, ttl: Option<Duration>) {
        let entry = CacheEntry::new(key, value, ttl.unwrap_or(self.default_ttl));
        for tier in &self.tiers {
            if let Err(e) = tier.put(&entry).await {
                self.tier_failed(tier.as_ref(), "put", &e);
            }
        }
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a key, or every key matching a `*`/`?` pattern, from all
    /// tiers. Returns the number of distinct keys removed.
    pub async fn invalidate(&self, key_or_pattern: &str) -> SandboxResult<usize> {
        let mut removed = std::collections::BTreeSet::new();
        if glob::is_pattern(key_or_pattern) {
            let pattern = glob::compile(key_or_pattern)?;
            for tier in &self.tiers {
                let keys = match tier.keys().await {
                    Ok(keys) => keys,
                    Err(e) => {
                        self.tier_failed(tier.as_ref(), "keys", &e);
                        continue;
                    }
                };
                for key in keys.into_iter().filter(|k| pattern.is_match(k)) {
                    match tier.remove(&key).await {
                        Ok(true) => {
                            removed.insert(key);
                        }
                        Ok(false) => {}
                        Err(e) => self.tier_failed(tier.as_ref(), "remove", &e),
                    }
                }
            }
        } else {
            for tier in &self.tiers {
                match tier.remove(key_or_pattern).await {
                    Ok(true) => {
                        removed.insert(key_or_pattern.to_string());
                    }
                    Ok(false) => {}
                    Err(e) => self.tier_failed(tier.as_ref(), "remove", &e),
                }
            }
        }
        let count = removed.len();
        self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
        debug!(pattern = key_or_pattern, count, "cache: invalidated");
        Ok(count)
    }

    /// Purge expired entries from every tier.
    pub async fn purge_expired(&self) -> usize {
        let mut total = 0;
        for tier in &self.tiers {
            match tier.purge_expired().await {
                Ok(n) => total += n,
                Err(e) => self.tier_failed(tier.as_ref(), "purge", &e),
            }
        }
        total
    }

    pub fn stats(&self) -> CacheStats {
        let tiers: Vec<TierHits> = self
            .tiers
            .iter()
            .zip(&self.hits)
            .map(|(tier, hits)| TierHits {
                tier: tier.name().to_string(),
                hits: hits.load(Ordering::Relaxed),
            })
            .collect();
        let total_hits: u64 = tiers.iter().map(|t| t.hits).sum();
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = total_hits + misses;
        CacheStats {
            tiers,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            tier_errors: self.tier_errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                total_hits as f64 / lookups as f64
            },
        }
    }
}

/// Collapse formatting-only differences: line endings, trailing whitespace,
/// trailing blank lines.
pub fn normalize_code(code: &str) -> String {
    let unified = code.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    let end = lines
        .iter()
        .rposition(|l| !l.is_empty())
        .map_or(0, |i| i + 1);
    lines[..end].join("\n")
}

/// Cache key: hex SHA-256 of language, execution type and normalized code.
pub fn fingerprint(language: Language, code: &str, execution_type: ExecutionType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(language.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(execution_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_code(code).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn request_fingerprint(request: &ExecutionRequest) -> String {
    fingerprint(request.language, &request.code, request.execution_type)
}

static NONDETERMINISTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \brandom\b | \brand\s*\( | \brand::  | Math\.random | crypto\.random
        | \btime\.(time|perf_counter|monotonic|now|Now|Since)\b
        | \bdatetime\b | Date\.now | new\s+Date\b | performance\.now
        | \buuid | Guid\.NewGuid | DateTime\.(Now|UtcNow)
        | System\.(currentTimeMillis|nanoTime) | LocalDateTime | Instant::now | SystemTime
        | std::chrono | \bclock\s*\( | \bsrand\b | os\.urandom | \bsecrets\b
        ",
    )
    .expect("static regex")
});

/// Whether `response` to `request` may be memoized: successful, no
/// caller-specific input, and no clock or randomness in the code.
pub fn is_cacheable(request: &ExecutionRequest, response: &ExecutionResponse) -> bool {
    response.success
        && !response.timeout_occurred
        && !response.memory_limit_exceeded
        && !response.security_violation_detected
        && request.input_data.is_none()
        && request.environment_variables.is_empty()
        && request.execution_type != ExecutionType::PerformanceTest
        && !NONDETERMINISTIC.is_match(&request.code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(stdout: &str) -> ExecutionResponse {
        let mut r = ExecutionResponse::new();
        r.success = true;
        r.stdout = stdout.to_string();
        r
    }

    #[test]
    fn test_fingerprint_ignores_formatting_only() {
        let a = fingerprint(Language::Python, "print('hi')\r\n\n\n", ExecutionType::Run);
        let b = fingerprint(Language::Python, "print('hi')   ", ExecutionType::Run);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint(Language::Python, "print('hi')", ExecutionType::Test));
        assert_ne!(a, fingerprint(Language::Javascript, "print('hi')", ExecutionType::Run));
    }

    #[test]
    fn test_cacheability() {
        let req = ExecutionRequest::new("print(1)", Language::Python);
        assert!(is_cacheable(&req, &response("1\n")));

        let mut failed = response("");
        failed.success = false;
        assert!(!is_cacheable(&req, &failed));

        let with_input = req.clone().with_input("x");
        assert!(!is_cacheable(&with_input, &response("1\n")));

        let clock = ExecutionRequest::new("import time\nprint(time.time())", Language::Python);
        assert!(!is_cacheable(&clock, &response("1\n")));

        let rng = ExecutionRequest::new("console.log(Math.random())", Language::Javascript);
        assert!(!is_cacheable(&rng, &response("0.3\n")));
    }

    #[tokio::test]
    async fn test_miss_then_hit_and_stats() {
        let cache = MultiLevelCache::in_memory(10, Duration::from_secs(60));
        assert!(cache.get("k").await.is_none());
        cache.set("k", response("hi\n"), None).await;
        assert_eq!(cache.get("k").await.unwrap().stdout, "hi\n");

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_hits(), 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = MultiLevelCache::in_memory(10, Duration::from_secs(60));
        cache.set("k", response("x"), Some(Duration::ZERO)).await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_slow_tier_hit_backfills_fast_tier() {
        let l1 = Arc::new(MemoryTier::new(10));
        let l2 = Arc::new(MemoryTier::named("l2", 10));
        l2.put(&CacheEntry::new("k", response("deep"), Duration::from_secs(60)))
            .await
            .unwrap();
        let cache = MultiLevelCache::new(
            vec![l1.clone() as Arc<dyn CacheTier>, l2 as Arc<dyn CacheTier>],
            Duration::from_secs(60),
        );

        assert_eq!(cache.get("k").await.unwrap().stdout, "deep");
        assert!(l1.get("k").await.unwrap().is_some());
        assert_eq!(cache.stats().tiers[1].hits, 1);

        cache.get("k").await.unwrap();
        assert_eq!(cache.stats().tiers[0].hits, 1);
    }

    #[tokio::test]
    async fn test_invalidate_key_and_pattern() {
        let cache = MultiLevelCache::in_memory(10, Duration::from_secs(60));
        for key in ["py-1", "py-2", "js-1"] {
            cache.set(key, response(key), None).await;
        }
        assert_eq!(cache.invalidate("js-1").await.unwrap(), 1);
        assert_eq!(cache.invalidate("js-1").await.unwrap(), 0);
        assert_eq!(cache.invalidate("py-*").await.unwrap(), 2);
        assert!(cache.get("py-1").await.is_none());
        assert_eq!(cache.stats().invalidations, 3);
    }

    struct BrokenTier;

    #[async_trait]
    impl CacheTier for BrokenTier {
        fn name(&self) -> &str {
            "broken"
        }
        async fn get(&self, _key: &str) -> CacheResult<Option<CacheEntry>> {
            Err(CacheError::Task("down".into()))
        }
        async fn put(&self, _entry: &CacheEntry) -> CacheResult<()> {
            Err(CacheError::Task("down".into()))
        }
        async fn remove(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Task("down".into()))
        }
        async fn keys(&self) -> CacheResult<Vec<String>> {
            Err(CacheError::Task("down".into()))
        }
        async fn purge_expired(&self) -> CacheResult<usize> {
            Err(CacheError::Task("down".into()))
        }
    }

    #[tokio::test]
    async fn test_failing_tier_degrades_to_miss() {
        let cache = MultiLevelCache::new(
            vec![
                Arc::new(BrokenTier) as Arc<dyn CacheTier>,
                Arc::new(MemoryTier::new(4)) as Arc<dyn CacheTier>,
            ],
            Duration::from_secs(60),
        );
        cache.set("k", response("ok"), None).await;
        assert_eq!(cache.get("k").await.unwrap().stdout, "ok");
        assert!(cache.stats().tier_errors >= 2);
    }
}
