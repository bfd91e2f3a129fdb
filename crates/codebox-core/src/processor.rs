//! Bounded admission queue with an elastic worker set.
//!
//! Tasks enter a bounded FIFO channel. Workers share the receiving end and
//! each run one task at a time under `processing_timeout`; a task that
//! overruns fails alone with `Processing timeout`. The worker count grows
//! with queue depth up to `max_workers` and shrinks back to one as workers
//! sit idle.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::{SandboxError, SandboxResult};

/// What `submit_task` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Wait up to `timeout_ms` for space.
    Block { timeout_ms: u64 },
    /// Reject immediately.
    FailFast,
}

/// Processes one payload.
#[async_trait]
pub trait TaskHandler<P, R>: Send + Sync {
    async fn handle(&self, task_id: &str, payload: P) -> SandboxResult<R>;
}

struct Job<P, R> {
    task_id: String,
    payload: P,
    reply: oneshot::Sender<SandboxResult<R>>,
}

/// Resolves to the task's result.
pub struct TaskHandle<R> {
    task_id: String,
    rx: oneshot::Receiver<SandboxResult<R>>,
}

impl<R> TaskHandle<R> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn result(self) -> SandboxResult<R> {
        self.rx.await.unwrap_or_else(|_| {
            Err(SandboxError::Execution(format!(
                "task {} was dropped before completing",
                self.task_id
            )))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub queued: usize,
    pub queue_capacity: usize,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    active_workers: AtomicUsize,
    busy_workers: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

struct Shared<P, R> {
    rx: tokio::sync::Mutex<mpsc::Receiver<Job<P, R>>>,
    handler: Arc<dyn TaskHandler<P, R>>,
    counters: Counters,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
    processing_timeout: Duration,
    idle_timeout: Duration,
}

pub struct AsyncProcessor<P, R> {
    tx: Mutex<Option<mpsc::Sender<Job<P, R>>>>,
    shared: Arc<Shared<P, R>>,
    policy: QueuePolicy,
    capacity: usize,
}

impl<P, R> AsyncProcessor<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Start the processor with one worker. Must be called inside a Tokio
    /// runtime.
    pub fn new(config: &ProcessorConfig, handler: Arc<dyn TaskHandler<P, R>>) -> Self {
        let capacity = config.queue_size.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            rx: tokio::sync::Mutex::new(rx),
            handler,
            counters: Counters::default(),
            workers: Mutex::new(Vec::new()),
            max_workers: config.max_workers.max(1),
            processing_timeout: config.processing_timeout(),
            idle_timeout: Duration::from_millis(config.worker_idle_ms.max(1)),
        });
        spawn_worker(&shared);
        Self {
            tx: Mutex::new(Some(tx)),
            shared,
            policy: config.queue_policy,
            capacity,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Job<P, R>>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Enqueue `payload`. Blocks or fails fast on a full queue according
    /// to the queue policy.
    pub async fn submit_task(&self, payload: P) -> SandboxResult<TaskHandle<R>> {
        self.submit_with_id(Uuid::new_v4().to_string(), payload).await
    }

    pub async fn submit_with_id(
        &self,
        task_id: impl Into<String>,
        payload: P,
    ) -> SandboxResult<TaskHandle<R>> {
        let task_id = task_id.into();
        let Some(tx) = self.sender() else {
            return Err(SandboxError::Execution("processor is shut down".into()));
        };
        let (reply, rx) = oneshot::channel();
        let job = Job {
            task_id: task_id.clone(),
            payload,
            reply,
        };

        let counters = &self.shared.counters;
        counters.queued.fetch_add(1, Ordering::SeqCst);
        let sent = match self.policy {
            QueuePolicy::FailFast => tx.try_send(job).map_err(|e| match e {
                TrySendError::Full(_) => "queue is full",
                TrySendError::Closed(_) => "processor is shut down",
            }),
            QueuePolicy::Block { timeout_ms } => tx
                .send_timeout(job, Duration::from_millis(timeout_ms))
                .await
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => "queue is full",
                    SendTimeoutError::Closed(_) => "processor is shut down",
                }),
        };
        if let Err(reason) = sent {
            counters.queued.fetch_sub(1, Ordering::SeqCst);
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(task_id = %task_id, reason, "processor: task rejected");
            return Err(SandboxError::Execution(format!("task rejected: {reason}")));
        }
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        self.scale_up();
        Ok(TaskHandle { task_id, rx })
    }

    /// Add workers until there is one per pending or running task, capped
    /// at `max_workers`.
    fn scale_up(&self) {
        let counters = &self.shared.counters;
        let demand = counters.queued.load(Ordering::SeqCst)
            + counters.busy_workers.load(Ordering::SeqCst);
        let desired = demand.clamp(1, self.shared.max_workers);
        while counters.active_workers.load(Ordering::SeqCst) < desired {
            spawn_worker(&self.shared);
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        let c = &self.shared.counters;
        ProcessorStats {
            queued: c.queued.load(Ordering::SeqCst),
            queue_capacity: self.capacity,
            active_workers: c.active_workers.load(Ordering::SeqCst),
            busy_workers: c.busy_workers.load(Ordering::SeqCst),
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting tasks, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);
        let workers: Vec<JoinHandle<()>> = lock_workers(&self.shared).drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        debug!("processor: shut down");
    }
}

fn lock_workers<P, R>(shared: &Shared<P, R>) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    shared.workers.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_worker<P, R>(shared: &Arc<Shared<P, R>>)
where
    P: Send + 'static,
    R: Send + 'static,
{
    let id = shared.counters.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
    let worker_shared = shared.clone();
    let handle = tokio::spawn(async move { worker_loop(worker_shared, id).await });
    let mut workers = lock_workers(shared);
    workers.retain(|h| !h.is_finished());
    workers.push(handle);
    debug!(worker = id, "processor: worker started");
}

/// Retire if another worker remains. Returns whether this worker retired.
fn try_retire(counters: &Counters) -> bool {
    let mut current = counters.active_workers.load(Ordering::SeqCst);
    while current > 1 && counters.queued.load(Ordering::SeqCst) == 0 {
        match counters.active_workers.compare_exchange(
            current,
            current - 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
    false
}

async fn worker_loop<P, R>(shared: Arc<Shared<P, R>>, id: usize)
where
    P: Send + 'static,
    R: Send + 'static,
{
    let counters = &shared.counters;
    loop {
        let next = tokio::time::timeout(shared.idle_timeout, async {
            let mut rx = shared.rx.lock().await;
            rx.recv().await
        })
        .await;

        let job = match next {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                if try_retire(counters) {
                    debug!(worker = id, "processor: idle worker retired");
                    return;
                }
                continue;
            }
        };

        counters.queued.fetch_sub(1, Ordering::SeqCst);
        counters.busy_workers.fetch_add(1, Ordering::SeqCst);

        let result = match tokio::time::timeout(
            shared.processing_timeout,
            shared.handler.handle(&job.task_id, job.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %job.task_id, "processor: task exceeded processing timeout");
                Err(SandboxError::Execution("Processing timeout".into()))
            }
        };
        if result.is_ok() {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        let _ = job.reply.send(result);
        counters.busy_workers.fetch_sub(1, Ordering::SeqCst);
    }
    counters.active_workers.fetch_sub(1, Ordering::SeqCst);
}
