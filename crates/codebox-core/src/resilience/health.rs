//! Periodic health checking with alerting and recovery.
//!
//! A failed check notifies every alert handler, then runs the check's
//! recovery action (if one is registered) and re-checks. Without a recovery
//! action a check stays unhealthy until it passes on its own.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::LoadBalancer;
use crate::error::{SandboxError, SandboxResult};
use crate::obs;

/// A named health check. `Ok(true)` means healthy.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> SandboxResult<bool>;
}

type CheckFn = Arc<dyn Fn() -> BoxFuture<'static, SandboxResult<bool>> + Send + Sync>;

/// Adapts an async closure into a [`HealthCheck`].
pub struct FnHealthCheck {
    name: String,
    f: CheckFn,
}

impl FnHealthCheck {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SandboxResult<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(move || f().boxed()),
        }
    }
}

#[async_trait]
impl HealthCheck for FnHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> SandboxResult<bool> {
        (self.f)().await
    }
}

/// GET `url`; healthy on any 2xx.
pub struct HttpHealthCheck {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpHealthCheck {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> SandboxResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("codebox-health/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| SandboxError::Infrastructure(format!("http client: {e}")))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> SandboxResult<bool> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SandboxError::Infrastructure(format!("GET {}: {e}", self.url)))?;
        Ok(response.status().is_success())
    }
}

/// Runs an inner check and reports the result to the load balancer, so
/// failing instances leave rotation and passing ones rejoin it.
pub struct InstanceHealthCheck {
    instance_id: String,
    inner: Arc<dyn HealthCheck>,
    balancer: Arc<LoadBalancer>,
}

impl InstanceHealthCheck {
    pub fn new(
        instance_id: impl Into<String>,
        inner: Arc<dyn HealthCheck>,
        balancer: Arc<LoadBalancer>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            inner,
            balancer,
        }
    }
}

#[async_trait]
impl HealthCheck for InstanceHealthCheck {
    fn name(&self) -> &str {
        &self.instance_id
    }

    async fn check(&self) -> SandboxResult<bool> {
        let healthy = self.inner.check().await.unwrap_or(false);
        self.balancer.mark_healthy(&self.instance_id, healthy);
        Ok(healthy)
    }
}

/// Passed to alert handlers when a check fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub check: String,
    pub error: String,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

pub type AlertHandler = Arc<dyn Fn(&HealthAlert) + Send + Sync>;
pub type RecoveryAction = Arc<dyn Fn() -> BoxFuture<'static, SandboxResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`RecoveryAction`].
pub fn recovery_action<F, Fut>(f: F) -> RecoveryAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SandboxResult<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set when the last failure was cleared by the recovery action.
    pub recovered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: OverallHealth,
    pub checks: Vec<CheckStatus>,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == OverallHealth::Healthy
    }
}

struct Registered {
    check: Arc<dyn HealthCheck>,
    recovery: Option<RecoveryAction>,
    status: CheckStatus,
}

/// Registry of named checks plus their last known status.
pub struct HealthMonitor {
    checks: Mutex<BTreeMap<String, Registered>>,
    alert_handlers: Mutex<Vec<AlertHandler>>,
    check_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            checks: Mutex::new(BTreeMap::new()),
            alert_handlers: Mutex::new(Vec::new()),
            check_timeout,
        }
    }

    fn lock_checks(&self) -> MutexGuard<'_, BTreeMap<String, Registered>> {
        self.checks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a check.
    pub fn register(&self, check: Arc<dyn HealthCheck>) {
        self.register_inner(check, None);
    }

    pub fn register_with_recovery(&self, check: Arc<dyn HealthCheck>, recovery: RecoveryAction) {
        self.register_inner(check, Some(recovery));
    }

    fn register_inner(&self, check: Arc<dyn HealthCheck>, recovery: Option<RecoveryAction>) {
        let name = check.name().to_string();
        let status = CheckStatus {
            name: name.clone(),
            healthy: true,
            consecutive_failures: 0,
            last_checked: None,
            last_error: None,
            recovered: false,
        };
        self.lock_checks().insert(
            name,
            Registered {
                check,
                recovery,
                status,
            },
        );
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.lock_checks().remove(name).is_some()
    }

    pub fn add_alert_handler(&self, handler: AlertHandler) {
        self.alert_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    async fn run_check(&self, check: &dyn HealthCheck) -> Result<(), String> {
        match tokio::time::timeout(self.check_timeout, check.check()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("check reported unhealthy".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "check timed out after {}ms",
                self.check_timeout.as_millis()
            )),
        }
    }

    /// Run every check once and return the resulting report.
    pub async fn run_checks(&self) -> HealthReport {
        let snapshot: Vec<(String, Arc<dyn HealthCheck>, Option<RecoveryAction>, u32)> = self
            .lock_checks()
            .iter()
            .map(|(name, r)| {
                (
                    name.clone(),
                    r.check.clone(),
                    r.recovery.clone(),
                    r.status.consecutive_failures,
                )
            })
            .collect();

        for (name, check, recovery, prior_failures) in snapshot {
            let mut outcome = self.run_check(check.as_ref()).await;
            let mut recovered = false;

            if let Err(error) = &outcome {
                obs::emit_health_check_failed(&name, error);
                let alert = HealthAlert {
                    check: name.clone(),
                    error: error.clone(),
                    consecutive_failures: prior_failures + 1,
                    at: Utc::now(),
                };
                let handlers = self
                    .alert_handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for handler in handlers {
                    handler(&alert);
                }

                if let Some(recover) = recovery {
                    match recover().await {
                        Ok(()) => {
                            outcome = self.run_check(check.as_ref()).await;
                            recovered = outcome.is_ok();
                            if recovered {
                                info!(check = %name, "health check recovered");
                            }
                        }
                        Err(e) => warn!(check = %name, error = %e, "recovery action failed"),
                    }
                }
            } else {
                debug!(check = %name, "health check passed");
            }

            if let Some(entry) = self.lock_checks().get_mut(&name) {
                let status = &mut entry.status;
                status.last_checked = Some(Utc::now());
                status.recovered = recovered;
                match outcome {
                    Ok(()) => {
                        status.healthy = true;
                        status.consecutive_failures = 0;
                        status.last_error = None;
                    }
                    Err(error) => {
                        status.healthy = false;
                        status.consecutive_failures += 1;
                        status.last_error = Some(error);
                    }
                }
            }
        }

        self.report()
    }

    /// Last known status without running anything.
    pub fn report(&self) -> HealthReport {
        let checks: Vec<CheckStatus> = self
            .lock_checks()
            .values()
            .map(|r| r.status.clone())
            .collect();
        let status = if checks.iter().all(|c| c.healthy) {
            OverallHealth::Healthy
        } else {
            OverallHealth::Unhealthy
        };
        HealthReport {
            status,
            checks,
            generated_at: Utc::now(),
        }
    }

    /// Run checks every `interval` on a background task until stopped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> HealthMonitorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_checks().await;
                        if !report.is_healthy() {
                            warn!(
                                unhealthy = report.checks.iter().filter(|c| !c.healthy).count(),
                                "health monitor: degraded"
                            );
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health monitor stopped");
        });
        HealthMonitorHandle { stop_tx, join }
    }
}

/// Stops the background loop started by [`HealthMonitor::spawn`].
pub struct HealthMonitorHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HealthMonitorHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn always(name: &str, healthy: bool) -> Arc<dyn HealthCheck> {
        Arc::new(FnHealthCheck::new(name, move || async move { Ok(healthy) }))
    }

    #[tokio::test]
    async fn test_aggregates_status() {
        let monitor = HealthMonitor::new(Duration::from_secs(1));
        monitor.register(always("db", true));
        assert!(monitor.run_checks().await.is_healthy());

        monitor.register(always("engine", false));
        let report = monitor.run_checks().await;
        assert_eq!(report.status, OverallHealth::Unhealthy);
        let engine = report.checks.iter().find(|c| c.name == "engine").unwrap();
        assert!(!engine.healthy);
        assert_eq!(engine.consecutive_failures, 1);
        assert!(engine.last_checked.is_some());
    }

    #[tokio::test]
    async fn test_alert_then_recovery() {
        let monitor = HealthMonitor::new(Duration::from_secs(1));
        let up = Arc::new(AtomicBool::new(false));
        let flag = up.clone();
        let check: Arc<dyn HealthCheck> = Arc::new(FnHealthCheck::new("svc", move || {
            let flag = flag.clone();
            async move { Ok(flag.load(Ordering::SeqCst)) }
        }));
        let fixer = up.clone();
        monitor.register_with_recovery(
            check,
            recovery_action(move || {
                let fixer = fixer.clone();
                async move {
                    fixer.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let alerts = Arc::new(AtomicU32::new(0));
        let counter = alerts.clone();
        monitor.add_alert_handler(Arc::new(move |_alert: &HealthAlert| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let report = monitor.run_checks().await;
        assert!(report.is_healthy());
        assert!(report.checks[0].recovered);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_automatic_recovery_without_action() {
        let monitor = HealthMonitor::new(Duration::from_secs(1));
        let up = Arc::new(AtomicBool::new(false));
        let flag = up.clone();
        monitor.register(Arc::new(FnHealthCheck::new("svc", move || {
            let flag = flag.clone();
            async move { Ok(flag.load(Ordering::SeqCst)) }
        })));
        assert!(!monitor.run_checks().await.is_healthy());
        assert!(!monitor.run_checks().await.is_healthy());
        assert_eq!(monitor.report().checks[0].consecutive_failures, 2);

        up.store(true, Ordering::SeqCst);
        assert!(monitor.run_checks().await.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_times_out() {
        let monitor = HealthMonitor::new(Duration::from_millis(50));
        monitor.register(Arc::new(FnHealthCheck::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(true)
        })));
        let report = monitor.run_checks().await;
        assert!(!report.is_healthy());
        assert!(report.checks[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_runs_and_stops() {
        let monitor = Arc::new(HealthMonitor::new(Duration::from_secs(1)));
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        monitor.register(Arc::new(FnHealthCheck::new("tick", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        })));

        let handle = monitor.clone().spawn(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(61)).await;
        handle.stop().await;
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 runs, got {seen}");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
