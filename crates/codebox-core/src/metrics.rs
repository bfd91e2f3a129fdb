//! Aggregate execution counters.
//!
//! Owned by the orchestrator (no process-wide singleton), updated with
//! relaxed atomics. [`PlatformMetrics::flush`] emits all values as one
//! `tracing::info!` event; [`PlatformMetrics::snapshot`] returns them for
//! callers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::balancer::LoadBalancerStats;
use crate::cache::CacheStats;
use crate::pool::PoolStats;
use crate::resilience::circuit::CircuitState;

/// Lock-free counters.
#[derive(Debug, Default)]
pub struct PlatformMetrics {
    total_executions: AtomicU64,
    successful_executions: AtomicU64,
    failed_executions: AtomicU64,
    cache_hits: AtomicU64,
    security_blocks: AtomicU64,
    rate_limited: AtomicU64,
    timeouts: AtomicU64,
    /// Sum of engine wall time, microseconds.
    total_execution_us: AtomicU64,
    /// Kilobytes.
    peak_memory_kb: AtomicU64,
    /// Hundredths of a percent.
    peak_cpu_centi: AtomicU64,
    active: AtomicU64,
    max_concurrency: AtomicU64,
}

/// Decrements the active count when dropped.
pub struct ConcurrencyGuard<'a> {
    metrics: &'a PlatformMetrics,
}

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl PlatformMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one in-flight request and raise the high-water mark.
    pub fn enter(&self) -> ConcurrencyGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_concurrency.fetch_max(now, Ordering::Relaxed);
        ConcurrencyGuard { metrics: self }
    }

    /// Record one finished request.
    pub fn record_execution(
        &self,
        success: bool,
        execution_secs: f64,
        memory_mb: f64,
        cpu_percent: f64,
        timed_out: bool,
    ) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_executions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_executions.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.total_execution_us
            .fetch_add((execution_secs.max(0.0) * 1e6) as u64, Ordering::Relaxed);
        self.peak_memory_kb
            .fetch_max((memory_mb.max(0.0) * 1024.0) as u64, Ordering::Relaxed);
        self.peak_cpu_centi
            .fetch_max((cpu_percent.max(0.0) * 100.0) as u64, Ordering::Relaxed);
        tracing::trace!(metric = "executions", success, "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_security_blocks(&self) {
        self.security_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_executions(&self) -> u64 {
        self.total_executions.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Counter values. Component sections are left empty.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_executions.load(Ordering::Relaxed);
        let successful = self.successful_executions.load(Ordering::Relaxed);
        let total_us = self.total_execution_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_executions: total,
            successful_executions: successful,
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            average_execution_time: if total == 0 {
                0.0
            } else {
                total_us as f64 / 1e6 / total as f64
            },
            peak_memory_mb: self.peak_memory_kb.load(Ordering::Relaxed) as f64 / 1024.0,
            peak_cpu_percent: self.peak_cpu_centi.load(Ordering::Relaxed) as f64 / 100.0,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            security_blocks: self.security_blocks.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            active_executions: self.active.load(Ordering::Relaxed),
            max_concurrency: self.max_concurrency.load(Ordering::Relaxed),
            cache: None,
            pool: None,
            balancer: None,
            circuit_state: None,
            blocked_identities: Vec::new(),
        }
    }

    /// Emit current values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            total_executions = s.total_executions,
            success_rate = s.success_rate,
            average_execution_time = s.average_execution_time,
            peak_memory_mb = s.peak_memory_mb,
            cache_hits = s.cache_hits,
            security_blocks = s.security_blocks,
            rate_limited = s.rate_limited,
            max_concurrency = s.max_concurrency,
        );
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.total_executions,
            &self.successful_executions,
            &self.failed_executions,
            &self.cache_hits,
            &self.security_blocks,
            &self.rate_limited,
            &self.timeouts,
            &self.total_execution_us,
            &self.peak_memory_kb,
            &self.peak_cpu_centi,
            &self.max_concurrency,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of platform health and throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub success_rate: f64,
    /// Seconds.
    pub average_execution_time: f64,
    pub peak_memory_mb: f64,
    pub peak_cpu_percent: f64,
    pub cache_hits: u64,
    pub security_blocks: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
    pub active_executions: u64,
    pub max_concurrency: u64,
    pub cache: Option<CacheStats>,
    pub pool: Option<PoolStats>,
    pub balancer: Option<LoadBalancerStats>,
    pub circuit_state: Option<CircuitState>,
    #[serde(default)]
    pub blocked_identities: Vec<String>,
}
