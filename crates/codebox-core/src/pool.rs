//! Bounded pool of execution workers.
//!
//! `acquire` never waits: when every worker is busy and the pool is at
//! `max_workers` it fails with an execution error, leaving queuing to the
//! async processor. Scaling decisions come from [`ResourcePool::autoscale`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::obs;

/// Rolling per-worker statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    /// Mean wall time per execution, milliseconds.
    pub avg_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl WorkerMetrics {
    pub fn success_ratio(&self) -> f64 {
        if self.executions == 0 {
            1.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }

    fn record(&mut self, duration: Duration, success: bool) {
        self.executions += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let ms = duration.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (ms - self.avg_latency_ms) / self.executions as f64;
        self.last_used = Some(Utc::now());
    }
}

/// One pooled execution slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: String,
    pub available: bool,
    pub active_connections: u32,
    pub metrics: WorkerMetrics,
}

impl WorkerInstance {
    fn new(id: String) -> Self {
        Self {
            id,
            available: true,
            active_connections: 0,
            metrics: WorkerMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
    pub utilization: f64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub total_acquired: u64,
    pub exhausted: u64,
    pub workers: Vec<WorkerInstance>,
}

#[derive(Debug)]
struct PoolState {
    workers: Vec<WorkerInstance>,
    next_id: usize,
    total_acquired: u64,
    exhausted: u64,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.workers.iter().filter(|w| !w.available).count()
    }

    fn utilization(&self) -> f64 {
        if self.workers.is_empty() {
            0.0
        } else {
            self.in_use() as f64 / self.workers.len() as f64
        }
    }

    fn spawn(&mut self) {
        self.next_id += 1;
        self.workers
            .push(WorkerInstance::new(format!("worker-{}", self.next_id)));
    }
}

#[derive(Debug)]
pub struct ResourcePool {
    state: Mutex<PoolState>,
    min_workers: usize,
    max_workers: usize,
    scale_up_threshold: f64,
    scale_down_threshold: f64,
}

impl ResourcePool {
    pub fn new(config: &PoolConfig) -> Self {
        let min_workers = config.min_workers.max(1);
        let max_workers = config.max_workers.max(min_workers);
        let initial = config.initial_workers.clamp(min_workers, max_workers);
        let mut state = PoolState {
            workers: Vec::with_capacity(initial),
            next_id: 0,
            total_acquired: 0,
            exhausted: 0,
        };
        for _ in 0..initial {
            state.spawn();
        }
        Self {
            state: Mutex::new(state),
            min_workers,
            max_workers,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
        }
    }

    /// Fixed-size pool of `size` workers.
    pub fn fixed(size: usize) -> Self {
        Self::new(&PoolConfig {
            initial_workers: size,
            min_workers: size,
            max_workers: size,
            scale_up_threshold: 1.0,
            scale_down_threshold: 0.0,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim an available worker, growing the pool first if it is saturated
    /// and below `max_workers`.
    pub fn acquire(&self) -> SandboxResult<String> {
        let mut state = self.lock();
        if !state.workers.iter().any(|w| w.available) {
            self.autoscale_locked(&mut state);
        }
        let Some(worker) = state.workers.iter_mut().find(|w| w.available) else {
            state.exhausted += 1;
            return Err(SandboxError::Execution(format!(
                "no execution worker available ({} of {} busy)",
                state.workers.len(),
                self.max_workers
            )));
        };
        worker.available = false;
        worker.active_connections += 1;
        let id = worker.id.clone();
        state.total_acquired += 1;
        debug!(worker = %id, "pool: worker acquired");
        Ok(id)
    }

    /// Claim a worker that is returned as a failure if the lease is dropped
    /// without [`WorkerLease::finish`].
    pub fn lease(&self) -> SandboxResult<WorkerLease<'_>> {
        let id = self.acquire()?;
        Ok(WorkerLease {
            pool: self,
            id,
            started: Instant::now(),
            done: false,
        })
    }

    /// Return `id` to the available set and fold the run into its metrics.
    /// Unknown or already-released ids are ignored.
    pub fn release(&self, id: &str, duration: Duration, success: bool) {
        let mut state = self.lock();
        if let Some(worker) = state
            .workers
            .iter_mut()
            .find(|w| w.id == id && !w.available)
        {
            worker.available = true;
            worker.active_connections = worker.active_connections.saturating_sub(1);
            worker.metrics.record(duration, success);
            debug!(worker = %id, success, "pool: worker released");
        }
        self.autoscale_locked(&mut state);
    }

    /// Grow when utilization is above the scale-up threshold, shrink when
    /// below the scale-down threshold. Returns the new size.
    pub fn autoscale(&self) -> usize {
        let mut state = self.lock();
        self.autoscale_locked(&mut state)
    }

    fn autoscale_locked(&self, state: &mut PoolState) -> usize {
        let size = state.workers.len();
        let utilization = state.utilization();
        let target = if utilization >= self.scale_up_threshold && size < self.max_workers {
            size + (size / 2).max(1)
        } else if utilization < self.scale_down_threshold && size > self.min_workers {
            size - 1
        } else {
            return size;
        };
        self.resize_locked(state, target)
    }

    /// Resize toward `target`, clamped to `[min_workers, max_workers]`.
    /// Busy workers are never removed, so a shrink may stop short.
    pub fn resize(&self, target: usize) -> usize {
        let mut state = self.lock();
        self.resize_locked(&mut state, target)
    }

    fn resize_locked(&self, state: &mut PoolState, target: usize) -> usize {
        let target = target.clamp(self.min_workers, self.max_workers);
        let from = state.workers.len();
        let utilization = state.utilization();
        while state.workers.len() < target {
            state.spawn();
        }
        while state.workers.len() > target {
            match state.workers.iter().rposition(|w| w.available) {
                Some(idx) => {
                    state.workers.remove(idx);
                }
                None => break,
            }
        }
        let to = state.workers.len();
        if to != from {
            obs::emit_pool_resized(from, to, utilization);
        }
        to
    }

    pub fn size(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn available(&self) -> usize {
        self.lock().workers.iter().filter(|w| w.available).count()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let in_use = state.in_use();
        PoolStats {
            size: state.workers.len(),
            available: state.workers.len() - in_use,
            in_use,
            utilization: state.utilization(),
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            total_acquired: state.total_acquired,
            exhausted: state.exhausted,
            workers: state.workers.clone(),
        }
    }
}

/// A claimed worker. Released as a failure on drop unless finished.
pub struct WorkerLease<'a> {
    pool: &'a ResourcePool,
    id: String,
    started: Instant,
    done: bool,
}

impl WorkerLease<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn finish(mut self, success: bool) {
        self.done = true;
        self.pool.release(&self.id, self.started.elapsed(), success);
    }
}

impl Drop for WorkerLease<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.pool.release(&self.id, self.started.elapsed(), false);
        }
    }
}
