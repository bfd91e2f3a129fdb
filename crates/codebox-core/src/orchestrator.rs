//! The sandbox pipeline.
//!
//! [`SandboxOrchestrator::execute_code`] runs one request through rate
//! limiting, the result cache, worker and instance selection, sanitizing,
//! scanning, the engine (behind the circuit breaker) and the optional
//! performance and quality stages. Every failure is folded into the
//! returned [`ExecutionResponse`]; nothing is raised to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, warn, Instrument};

use crate::analysis;
use crate::balancer::{LoadBalancer, RoutingHint};
use crate::cache::{self, MultiLevelCache};
use crate::config::PlatformConfig;
use crate::engine::{CodeExecutor, ExecutionEngine, ExecutionJob, ExecutionResult};
use crate::error::{SandboxError, SandboxResult};
use crate::metrics::{MetricsSnapshot, PlatformMetrics};
use crate::obs;
use crate::pool::ResourcePool;
use crate::processor::TaskHandler;
use crate::request::{ExecutionRequest, ExecutionType};
use crate::resilience::{
    CircuitBreaker, CircuitState, FnHealthCheck, HealthAlert, HealthMonitor, HealthReport,
};
use crate::response::{ExecutionResponse, TestResults};
use crate::security::{
    AuditEventType, AuditLogger, InputSanitizer, RateLimiter, ScanReport, SecurityScanner,
};

const BREAKER_NAME: &str = "execution-engine";

/// Assembles a [`SandboxOrchestrator`]. Components not supplied are built
/// from the configuration.
pub struct OrchestratorBuilder {
    config: PlatformConfig,
    executor: Option<Arc<dyn CodeExecutor>>,
    cache: Option<Option<Arc<MultiLevelCache>>>,
    balancer: Option<Arc<LoadBalancer>>,
    audit: Option<Arc<AuditLogger>>,
    limiter: Option<Arc<RateLimiter>>,
    health: Option<Arc<HealthMonitor>>,
}

impl OrchestratorBuilder {
    pub fn executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn cache(mut self, cache: Arc<MultiLevelCache>) -> Self {
        self.cache = Some(Some(cache));
        self
    }

    /// Run without a result cache regardless of configuration.
    pub fn without_cache(mut self) -> Self {
        self.cache = Some(None);
        self
    }

    pub fn balancer(mut self, balancer: Arc<LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn audit_logger(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn health_monitor(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> SandboxResult<SandboxOrchestrator> {
        let config = self.config;
        config.validate()?;

        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(ExecutionEngine::from_config(&config)),
        };
        let cache = match self.cache {
            Some(cache) => cache,
            None if config.cache.enabled => {
                Some(Arc::new(MultiLevelCache::from_config(&config.cache, None)?))
            }
            None => None,
        };
        let limiter = match self.limiter {
            Some(limiter) => limiter,
            None => Arc::new(RateLimiter::new(config.rate_limits.clone())?),
        };
        let balancer = self
            .balancer
            .unwrap_or_else(|| Arc::new(LoadBalancer::from_config(&config.balancer)));
        let audit = self.audit.unwrap_or_else(|| Arc::new(AuditLogger::default()));
        let health = self.health.unwrap_or_else(|| {
            Arc::new(HealthMonitor::new(Duration::from_secs(
                config.health.check_timeout_secs,
            )))
        });

        let breaker = Arc::new(CircuitBreaker::new(BREAKER_NAME, &config.breaker));
        let watched = breaker.clone();
        health.register(Arc::new(FnHealthCheck::new(BREAKER_NAME, move || {
            let open = watched.state() == CircuitState::Open;
            async move { Ok(!open) }
        })));

        let audit_for_alerts = audit.clone();
        health.add_alert_handler(Arc::new(move |alert: &HealthAlert| {
            let audit = audit_for_alerts.clone();
            let alert = alert.clone();
            // Alert handlers are synchronous; the audit write is not.
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    audit
                        .log(
                            AuditEventType::HealthCheckFailed,
                            "health-monitor",
                            &alert.check,
                            "unhealthy",
                            json!({
                                "error": alert.error,
                                "consecutive_failures": alert.consecutive_failures,
                            }),
                        )
                        .await;
                });
            }
        }));

        debug!(
            executor = executor.name(),
            cache_tiers = ?cache.as_ref().map(|c| c.tier_names()),
            instances = balancer.stats().instances.len(),
            "orchestrator: built"
        );

        Ok(SandboxOrchestrator {
            sanitizer: InputSanitizer::new(),
            scanner: SecurityScanner::new((&config.sandbox).into()),
            pool: ResourcePool::new(&config.pool),
            metrics: PlatformMetrics::new(),
            executor,
            cache,
            balancer,
            audit,
            limiter,
            breaker,
            health,
            config,
        })
    }
}

/// Composes the security layer, execution engine and scaling components
/// behind a single request/response contract.
pub struct SandboxOrchestrator {
    config: PlatformConfig,
    sanitizer: InputSanitizer,
    scanner: SecurityScanner,
    executor: Arc<dyn CodeExecutor>,
    cache: Option<Arc<MultiLevelCache>>,
    pool: ResourcePool,
    balancer: Arc<LoadBalancer>,
    audit: Arc<AuditLogger>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    metrics: PlatformMetrics,
}

/// Decrements the instance's connection count when dropped.
struct InstanceSlot<'a> {
    balancer: &'a LoadBalancer,
    id: String,
}

impl Drop for InstanceSlot<'_> {
    fn drop(&mut self) {
        self.balancer.release(&self.id);
    }
}

impl SandboxOrchestrator {
    pub fn builder(config: PlatformConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            executor: None,
            cache: None,
            balancer: None,
            audit: None,
            limiter: None,
            health: None,
        }
    }

    /// Orchestrator with every component built from `config`.
    pub fn from_config(config: PlatformConfig) -> SandboxResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn audit_logger(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Run one request end to end.
    pub async fn execute_code(&self, request: ExecutionRequest) -> ExecutionResponse {
        let mut response = ExecutionResponse::new();
        let span = obs::execution_span(&response.execution_id, request.language.as_str());
        async {
            let _active = self.metrics.enter();
            let started = Instant::now();
            let id = response.execution_id.clone();
            let identity = request.identity().to_string();

            obs::emit_execution_started(&id, &identity, request.execution_type.as_str());
            self.audit
                .log(
                    AuditEventType::ExecutionStart,
                    &identity,
                    "execute_code",
                    "started",
                    json!({
                        "execution_id": id,
                        "language": request.language.as_str(),
                        "execution_type": request.execution_type.as_str(),
                        "code_bytes": request.code.len(),
                    }),
                )
                .await;

            if let Err(err) = self.pipeline(&request, &mut response).await {
                response.apply_error(&err);
                self.audit
                    .log(
                        AuditEventType::ExecutionError,
                        &identity,
                        "execute_code",
                        err.kind().to_string().as_str(),
                        json!({ "execution_id": id, "error": err.to_string() }),
                    )
                    .await;
            }
            response.timestamp = Utc::now();

            let engine_secs = if response.cache_hit {
                0.0
            } else {
                response.execution_time
            };
            self.metrics.record_execution(
                response.success,
                engine_secs,
                response.memory_usage_mb,
                response.cpu_usage_percent,
                response.timeout_occurred,
            );
            obs::emit_execution_finished(
                &id,
                started.elapsed().as_millis() as u64,
                response.success,
                response.cache_hit,
            );
            self.audit
                .log(
                    AuditEventType::ExecutionEnd,
                    &identity,
                    "execute_code",
                    if response.success { "success" } else { "failure" },
                    json!({
                        "execution_id": id,
                        "exit_code": response.exit_code,
                        "execution_time": response.execution_time,
                        "cache_hit": response.cache_hit,
                        "worker_id": response.worker_id,
                        "instance_id": response.instance_id,
                    }),
                )
                .await;
        }
        .instrument(span)
        .await;
        response
    }

    async fn pipeline(
        &self,
        request: &ExecutionRequest,
        response: &mut ExecutionResponse,
    ) -> SandboxResult<()> {
        let identity = request.identity();

        let decision = self.limiter.check_all(identity);
        if !decision.allowed {
            self.metrics.inc_rate_limited();
            self.audit
                .log(
                    AuditEventType::RateLimitExceeded,
                    identity,
                    "execute_code",
                    "rejected",
                    json!({
                        "execution_id": response.execution_id,
                        "rule_id": decision.rule_id,
                        "reason": decision.reason,
                    }),
                )
                .await;
            return decision.into_result(identity);
        }

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| cache::request_fingerprint(request));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(cached) = cache.get(key).await {
                let id = std::mem::take(&mut response.execution_id);
                *response = cached;
                response.execution_id = id;
                response.cache_hit = true;
                self.metrics.inc_cache_hits();
                return Ok(());
            }
        }

        let lease = self.pool.lease()?;
        response.worker_id = Some(lease.id().to_string());

        let _slot = if self.balancer.is_empty() {
            None
        } else {
            let instance = self.balancer.select(&RoutingHint {
                session_id: request.session_id.as_deref(),
                region: request.region.as_deref(),
            })?;
            response.instance_id = Some(instance.id.clone());
            Some(InstanceSlot {
                balancer: &self.balancer,
                id: instance.id,
            })
        };

        let outcome = self.run_on_worker(request, response).await;
        lease.finish(outcome.is_ok() && response.success);
        outcome?;

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            if cache::is_cacheable(request, response) {
                cache.set(&key, response.clone(), None).await;
            }
        }
        Ok(())
    }

    async fn run_on_worker(
        &self,
        request: &ExecutionRequest,
        response: &mut ExecutionResponse,
    ) -> SandboxResult<()> {
        let sanitized = self.sanitizer.sanitize_request(request)?;
        response.warnings.extend(sanitized.warnings);

        let scan_only = request.execution_type == ExecutionType::SecurityScan;
        if self.config.sandbox.security_scan_enabled || scan_only {
            let report = self.scanner.report_with(
                &sanitized.code,
                request.language,
                Some(&request.security_requirements),
            );
            self.apply_scan(request, response, report).await?;
        } else {
            response.security_scan_passed = true;
            response
                .warnings
                .push("security scan disabled by configuration".to_string());
        }
        if scan_only {
            response.success = true;
            return Ok(());
        }

        if request.execution_type == ExecutionType::QualityAnalysis {
            if self.config.sandbox.code_quality_analysis_enabled {
                let quality = analysis::analyze(&sanitized.code, request.language);
                response.code_quality_score = Some(analysis::score(&quality));
                response.code_quality_results = Some(quality);
            } else {
                response
                    .warnings
                    .push("code quality analysis disabled by configuration".to_string());
            }
        }

        let job = ExecutionJob::from_request(response.execution_id.clone(), request, sanitized.code);
        let result = self.execute_guarded(&job).await?;
        let first_success = result.success();
        apply_result(response, &result);

        let limit_secs = request.timeout.min(self.config.sandbox.max_execution_time) as f64;
        if response.execution_time > limit_secs {
            response.timeout_occurred = true;
        }
        if response.timeout_occurred {
            return Err(SandboxError::Timeout {
                elapsed_ms: (response.execution_time * 1000.0) as u64,
                limit_ms: (limit_secs * 1000.0) as u64,
            });
        }
        if !first_success {
            let reason = match (&result.termination_reason, result.exit_code) {
                (Some(reason), _) => reason.clone(),
                (None, Some(code)) => format!("process exited with code {code}"),
                (None, None) => "process terminated by signal".to_string(),
            };
            return Err(SandboxError::Execution(reason));
        }

        if let Some(expected) = &request.expected_output {
            if response.stdout.trim() != expected.trim() {
                response.failed_tests.push("expected_output".to_string());
                return Err(SandboxError::Execution(
                    "output does not match expected output".into(),
                ));
            }
            response.passed_tests.push("expected_output".to_string());
        }

        if request.execution_type == ExecutionType::Test {
            let passed = response.passed_tests.len();
            let failed = response.failed_tests.len();
            response.test_results = Some(TestResults {
                total: passed + failed,
                passed,
                failed,
            });
            if failed > 0 {
                return Err(SandboxError::Execution(format!("{failed} test(s) failed")));
            }
        }

        if request.execution_type == ExecutionType::PerformanceTest {
            if self.config.sandbox.performance_testing_enabled {
                self.performance_test(request, &job, result, response).await?;
            } else {
                response
                    .warnings
                    .push("performance testing disabled by configuration".to_string());
            }
        }

        response.success = true;
        Ok(())
    }

    /// Record the scan on `response`, feed violations to the limiter and
    /// refuse blocked code.
    async fn apply_scan(
        &self,
        request: &ExecutionRequest,
        response: &mut ExecutionResponse,
        report: ScanReport,
    ) -> SandboxResult<()> {
        let identity = request.identity();
        response.security_scan_passed = report.passed();
        response.risk_score = report.risk_score;
        response.security_violations = report.violations.clone();

        for _ in &report.violations {
            if !self.limiter.record_violation(identity).allowed {
                break;
            }
        }

        let Some(reason) = report.reason else {
            if !report.violations.is_empty() {
                self.audit
                    .log(
                        AuditEventType::SecurityViolation,
                        identity,
                        "security_scan",
                        "allowed",
                        json!({
                            "execution_id": response.execution_id,
                            "risk_score": report.risk_score,
                            "violations": report.violations.iter().map(|v| v.id.as_str()).collect::<Vec<_>>(),
                        }),
                    )
                    .await;
            }
            return Ok(());
        };

        response.security_violation_detected = true;
        self.metrics.inc_security_blocks();
        obs::emit_security_blocked(
            &response.execution_id,
            &reason,
            report.risk_score,
            report.violations.len(),
        );
        self.audit
            .log(
                AuditEventType::SecurityBlocked,
                identity,
                "security_scan",
                "blocked",
                json!({
                    "execution_id": response.execution_id,
                    "reason": reason,
                    "risk_score": report.risk_score,
                    "violations": report.violations.len(),
                }),
            )
            .await;
        Err(SandboxError::Security {
            reason,
            violations: report.violations,
        })
    }

    /// One engine run through the circuit breaker, auditing state changes.
    async fn execute_guarded(&self, job: &ExecutionJob) -> SandboxResult<ExecutionResult> {
        let before = self.breaker.state();
        let result = self.breaker.call(self.executor.execute(job)).await;
        let after = self.breaker.state();
        if before != after {
            self.audit
                .log(
                    AuditEventType::CircuitTransition,
                    BREAKER_NAME,
                    "transition",
                    after.as_str(),
                    json!({
                        "from": before.as_str(),
                        "to": after.as_str(),
                        "failures": self.breaker.failure_count(),
                    }),
                )
                .await;
        }
        result
    }

    /// Repeat the job until `performance_iterations` runs exist, then
    /// aggregate and check thresholds.
    async fn performance_test(
        &self,
        request: &ExecutionRequest,
        job: &ExecutionJob,
        first: ExecutionResult,
        response: &mut ExecutionResponse,
    ) -> SandboxResult<()> {
        let iterations = self.config.sandbox.performance_iterations.max(1) as usize;
        let mut runs = Vec::with_capacity(iterations);
        runs.push(first);
        while runs.len() < iterations {
            runs.push(self.execute_guarded(job).await?);
        }

        let mut results = analysis::aggregate(&runs);
        let passed = analysis::check_thresholds(
            &mut results,
            &request.performance_thresholds,
            self.config.sandbox.max_cpu_percent,
        );
        response.memory_usage_mb = results.peak_memory_mb;
        response.cpu_usage_percent = results.peak_cpu_percent;
        response.performance_test_passed = Some(passed);
        let violations = results.threshold_violations.clone();
        response.performance_results = Some(results);
        if passed {
            Ok(())
        } else {
            Err(SandboxError::Execution(format!(
                "performance thresholds not met: {}",
                violations
                    .iter()
                    .map(|(name, detail)| format!("{name} ({detail})"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }

    /// Run every request, at most `processor.max_workers` at a time.
    /// Responses are in request order.
    pub async fn execute_batch(&self, requests: Vec<ExecutionRequest>) -> Vec<ExecutionResponse> {
        let permits = Semaphore::new(self.config.processor.max_workers.max(1));
        let permits = &permits;
        let runs = requests.into_iter().map(|request| async move {
            let _permit = permits.acquire().await.ok();
            self.execute_code(request).await
        });
        join_all(runs).await
    }

    /// Remove cached results by key or `*`/`?` pattern.
    pub async fn invalidate_cache(&self, actor: &str, key_or_pattern: &str) -> SandboxResult<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let removed = cache.invalidate(key_or_pattern).await?;
        self.audit
            .log(
                AuditEventType::CacheInvalidated,
                actor,
                "invalidate_cache",
                "ok",
                json!({ "pattern": key_or_pattern, "removed": removed }),
            )
            .await;
        Ok(removed)
    }

    /// Counters plus a view of every stateful component.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.cache = self.cache.as_ref().map(|c| c.stats());
        snapshot.pool = Some(self.pool.stats());
        snapshot.balancer = (!self.balancer.is_empty()).then(|| self.balancer.stats());
        snapshot.circuit_state = Some(self.breaker.state());
        snapshot.blocked_identities = self.limiter.blocked_identities();
        snapshot
    }

    /// Emit the current counters as one log event.
    pub fn flush_metrics(&self) {
        self.metrics.flush();
    }

    /// Run every registered health check now.
    pub async fn health(&self) -> HealthReport {
        let report = self.health.run_checks().await;
        if !report.is_healthy() {
            warn!(
                failing = ?report.checks.iter().filter(|c| !c.healthy).map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "orchestrator: unhealthy"
            );
        }
        report
    }
}

fn apply_result(response: &mut ExecutionResponse, result: &ExecutionResult) {
    response.exit_code = result.exit_code;
    response.stdout = result.stdout.clone();
    response.stderr = result.stderr.clone();
    response.execution_time = result.execution_time;
    response.memory_usage_mb = result.memory_usage_mb;
    response.cpu_usage_percent = result.cpu_usage_percent;
    response.timeout_occurred = result.timeout_occurred;
    response.memory_limit_exceeded = result.memory_limit_exceeded;
    response.security_violation_detected |= result.security_violation_detected;
    response.passed_tests = result.passed_tests.clone();
    response.failed_tests = result.failed_tests.clone();
    response.warnings.extend(result.warnings.iter().cloned());
    if result.output_truncated {
        response.warnings.push("output truncated".to_string());
    }
}

#[async_trait]
impl TaskHandler<ExecutionRequest, ExecutionResponse> for SandboxOrchestrator {
    async fn handle(&self, task_id: &str, payload: ExecutionRequest) -> SandboxResult<ExecutionResponse> {
        debug!(task_id, "orchestrator: processing queued request");
        Ok(self.execute_code(payload).await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::balancer::InstanceConfig;
    use crate::language::Language;
    use crate::security::{RateLimitAction, RateLimitRule};

    /// Echoes a fixed result and counts invocations.
    struct Scripted {
        result: ExecutionResult,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(stdout: &str) -> Arc<Self> {
            Arc::new(Self {
                result: ExecutionResult {
                    exit_code: Some(0),
                    stdout: stdout.to_string(),
                    execution_time: 0.05,
                    memory_usage_mb: 12.0,
                    cpu_usage_percent: 20.0,
                    ..Default::default()
                },
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CodeExecutor for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _job: &ExecutionJob) -> SandboxResult<ExecutionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    fn orchestrator(executor: Arc<Scripted>) -> SandboxOrchestrator {
        SandboxOrchestrator::builder(PlatformConfig::default())
            .executor(executor)
            .build()
            .expect("default config is valid")
    }

    fn python(code: &str) -> ExecutionRequest {
        ExecutionRequest::new(code, Language::Python)
    }

    #[tokio::test]
    async fn test_successful_run_fills_response() {
        let exec = Scripted::ok("hi\n");
        let orch = orchestrator(exec.clone());
        let r = orch.execute_code(python("print('hi')")).await;
        assert!(r.success, "{:?}", r.error_message);
        assert_eq!(r.stdout, "hi\n");
        assert!(r.security_scan_passed);
        assert!(r.worker_id.is_some());
        assert!(r.instance_id.is_none());
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn test_second_identical_request_is_served_from_cache() {
        let exec = Scripted::ok("4\n");
        let orch = orchestrator(exec.clone());
        let first = orch.execute_code(python("print(2 + 2)")).await;
        let second = orch.execute_code(python("print(2 + 2)")).await;
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(second.stdout, "4\n");
        assert_ne!(first.execution_id, second.execution_id);
        assert_eq!(exec.calls(), 1);
        assert_eq!(orch.metrics().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_blocked_code_never_reaches_the_engine() {
        let exec = Scripted::ok("");
        let orch = orchestrator(exec.clone());
        let r = orch
            .execute_code(python("import os\nos.system('rm -rf /')"))
            .await;
        assert!(!r.success);
        assert!(!r.security_scan_passed);
        assert!(r.security_violation_detected);
        assert_eq!(r.error_kind, Some(crate::error::ErrorKind::SecurityError));
        assert_eq!(exec.calls(), 0);
        assert_eq!(orch.metrics().security_blocks, 1);
        assert!(orch
            .audit_logger()
            .entries()
            .iter()
            .any(|e| e.event_type == AuditEventType::SecurityBlocked));
    }

    #[tokio::test]
    async fn test_security_scan_type_skips_execution() {
        let exec = Scripted::ok("");
        let orch = orchestrator(exec.clone());
        let r = orch
            .execute_code(python("print('x')").with_type(ExecutionType::SecurityScan))
            .await;
        assert!(r.success);
        assert!(r.security_scan_passed);
        assert_eq!(exec.calls(), 0);
    }

    #[tokio::test]
    async fn test_expected_output_mismatch_fails() {
        let orch = orchestrator(Scripted::ok("5\n"));
        let r = orch
            .execute_code(python("print(2 + 2)").with_expected_output("4"))
            .await;
        assert!(!r.success);
        assert_eq!(r.failed_tests, vec!["expected_output".to_string()]);
    }

    #[tokio::test]
    async fn test_performance_test_repeats_runs() {
        let exec = Scripted::ok("done\n");
        let orch = orchestrator(exec.clone());
        let r = orch
            .execute_code(python("print('done')").with_type(ExecutionType::PerformanceTest))
            .await;
        assert!(r.success, "{:?}", r.error_message);
        assert_eq!(r.performance_test_passed, Some(true));
        let perf = r.performance_results.expect("performance results");
        assert_eq!(perf.iterations, 3);
        assert_eq!(exec.calls(), 3);
    }

    #[tokio::test]
    async fn test_quality_analysis_scores_code() {
        let orch = orchestrator(Scripted::ok(""));
        let r = orch
            .execute_code(
                python("# add\ndef add(a, b):\n    return a + b\n")
                    .with_type(ExecutionType::QualityAnalysis),
            )
            .await;
        assert!(r.success);
        let score = r.code_quality_score.expect("score");
        assert!((0.0..=10.0).contains(&score));
        assert_eq!(r.code_quality_results.map(|q| q.function_count), Some(1));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_cache() {
        let rules = vec![RateLimitRule::new("tight", 1, 60, RateLimitAction::Throttle)];
        let config = PlatformConfig {
            rate_limits: rules,
            ..PlatformConfig::default()
        };
        let orch = SandboxOrchestrator::builder(config)
            .executor(Scripted::ok("1\n"))
            .build()
            .expect("valid");
        let ok = orch.execute_code(python("print(1)").with_client("alice")).await;
        let limited = orch.execute_code(python("print(1)").with_client("alice")).await;
        assert!(ok.success);
        assert!(!limited.success);
        assert!(!limited.cache_hit);
        assert_eq!(limited.error_kind, Some(crate::error::ErrorKind::SecurityError));
        assert_eq!(orch.metrics().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_balancer_instance_is_recorded_and_released() {
        let balancer = Arc::new(LoadBalancer::new(Default::default(), 16));
        balancer.add_instance(InstanceConfig::new("i-1", "10.0.0.1:9000"));
        let orch = SandboxOrchestrator::builder(PlatformConfig::default())
            .executor(Scripted::ok("x\n"))
            .balancer(balancer.clone())
            .without_cache()
            .build()
            .expect("valid");
        let r = orch.execute_code(python("print('x')")).await;
        assert_eq!(r.instance_id.as_deref(), Some("i-1"));
        assert_eq!(balancer.instances()[0].active_connections, 0);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let orch = orchestrator(Scripted::ok("ok\n"));
        let responses = orch
            .execute_batch(vec![
                python("print('a')"),
                python("import os\nos.system('ls')"),
                python("print('c')"),
            ])
            .await;
        assert_eq!(responses.len(), 3);
        assert!(responses[0].success);
        assert!(!responses[1].success);
        assert!(responses[2].success);
    }

    #[tokio::test]
    async fn test_metrics_and_health_include_components() {
        let orch = orchestrator(Scripted::ok("1\n"));
        orch.execute_code(python("print(1)")).await;
        let m = orch.metrics();
        assert_eq!(m.total_executions, 1);
        assert_eq!(m.circuit_state, Some(CircuitState::Closed));
        assert!(m.pool.is_some());
        assert!(m.cache.is_some());
        assert!(orch.health().await.is_healthy());
    }
}
