//! Circuit breaker guarding the execution backend.
//!
//! `closed` passes calls through and counts consecutive failures. At
//! `failure_threshold` it trips to `open` and rejects everything until
//! `recovery_timeout` has elapsed since the last failure. It then admits up
//! to `half_open_max_calls` trial calls: a successful trial closes the
//! breaker and resets the count, a failed trial re-opens it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trials_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            half_open_max_calls: config.half_open_max_calls.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trials_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state != to {
            obs::emit_circuit_transition(&self.name, inner.state.as_str(), to.as_str());
            inner.state = to;
        }
    }

    fn recovery_elapsed(&self, inner: &Inner) -> bool {
        inner
            .last_failure
            .map_or(true, |t| t.elapsed() >= self.recovery_timeout)
    }

    /// Current state. An open breaker whose recovery timeout has elapsed
    /// reports `half_open`.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.recovery_elapsed(&inner) => CircuitState::HalfOpen,
            s => s,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Ask permission for one call.
    pub fn try_acquire(&self) -> SandboxResult<()> {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open && self.recovery_elapsed(&inner) {
            self.transition(&mut inner, CircuitState::HalfOpen);
            inner.trials_in_flight = 0;
        }
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if inner.trials_in_flight < self.half_open_max_calls => {
                inner.trials_in_flight += 1;
                Ok(())
            }
            _ => Err(SandboxError::CircuitOpen {
                consecutive_failures: inner.consecutive_failures,
                threshold: self.failure_threshold,
            }),
        }
    }

    /// Only a half-open trial closes the breaker. A success reported while
    /// open belongs to a call admitted before the trip and is ignored.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Open => {}
            CircuitState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.trials_in_flight = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
        }
    }

    /// Returns the consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.trials_in_flight = 0;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
        inner.consecutive_failures
    }

    /// Release a trial slot whose call never reported an outcome.
    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    /// Run `fut` under the breaker.
    ///
    /// Only infrastructure errors count as failures; errors caused by the
    /// submitted code (timeouts, validation) say nothing about backend
    /// health and count as successes.
    pub async fn call<T, F>(&self, fut: F) -> SandboxResult<T>
    where
        F: Future<Output = SandboxResult<T>>,
    {
        self.try_acquire()?;
        let mut guard = TrialGuard {
            breaker: self,
            settled: false,
        };
        let result = fut.await;
        guard.settled = true;
        match &result {
            Err(e) if e.is_infrastructure() => {
                self.record_failure();
            }
            _ => self.record_success(),
        }
        result
    }
}

/// Returns a half-open trial slot if the call is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: recovery_ms,
                half_open_max_calls: 1,
            },
        )
    }

    fn infra() -> SandboxResult<()> {
        Err(SandboxError::Infrastructure("spawn failed".into()))
    }

    #[test]
    fn test_starts_closed() {
        let cb = breaker(3, 1000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_exactly_threshold() {
        let cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.try_acquire(),
            Err(SandboxError::CircuitOpen {
                consecutive_failures: 3,
                threshold: 3
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_until_recovery_then_closes_on_success() {
        let cb = breaker(2, 30_000);
        for _ in 0..2 {
            let _ = cb.call(async { infra() }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(29_999)).await;
        let rejected = cb.call(async { Ok(()) }).await;
        assert!(matches!(rejected, Err(SandboxError::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.call(async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(1, 100);
        let _ = cb.call(async { infra() }).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        let _ = cb.call(async { infra() }).await;
        assert_eq!(cb.state(), CircuitState::Open);
        // The recovery clock restarts from the failed trial.
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trials() {
        let cb = breaker(1, 10);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());
        cb.record_success();
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_breaker() {
        let cb = breaker(2, 30_000);
        for _ in 0..3 {
            cb.try_acquire().unwrap();
        }
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // The third call was admitted while closed and finishes after the trip.
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 2);
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(30_000)).await;
        cb.try_acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_count_while_closed() {
        let cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_code_errors_do_not_trip() {
        let cb = breaker(1, 1000);
        let res: SandboxResult<()> = cb
            .call(async {
                Err(SandboxError::Timeout {
                    elapsed_ms: 10,
                    limit_ms: 5,
                })
            })
            .await;
        assert!(res.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let cb = breaker(1, 10);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(10)).await;
        {
            let pending = cb.call(std::future::pending::<SandboxResult<()>>());
            let _ = tokio::time::timeout(Duration::from_millis(1), pending).await;
        }
        assert!(cb.try_acquire().is_ok());
    }
}
