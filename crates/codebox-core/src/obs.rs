//! Structured lifecycle events for the sandbox pipeline.
//!
//! Events are `info!` unless they signal trouble. Every event carries an
//! `event` field so log pipelines can filter on it, e.g.
//! `event=security.blocked`.

use tracing::{info, warn};

use crate::security::rate_limit::RateLimitAction;

/// RAII guard that enters an execution-scoped span.
///
/// Not `Send`: for async code use [`execution_span`] with
/// `tracing::Instrument` instead.
pub struct ExecutionSpan {
    _span: tracing::span::EnteredSpan,
}

impl ExecutionSpan {
    pub fn enter(execution_id: &str, language: &str) -> Self {
        Self {
            _span: execution_span(execution_id, language).entered(),
        }
    }
}

/// Span tagged with the execution id and language.
pub fn execution_span(execution_id: &str, language: &str) -> tracing::Span {
    tracing::info_span!("codebox.execution", execution_id = %execution_id, language = %language)
}

pub fn emit_execution_started(execution_id: &str, identity: &str, execution_type: &str) {
    info!(
        event = "execution.started",
        execution_id = %execution_id,
        identity = %identity,
        execution_type = %execution_type,
    );
}

pub fn emit_execution_finished(
    execution_id: &str,
    duration_ms: u64,
    success: bool,
    cache_hit: bool,
) {
    info!(
        event = "execution.finished",
        execution_id = %execution_id,
        duration_ms = duration_ms,
        success = success,
        cache_hit = cache_hit,
    );
}

/// Code was refused before reaching the engine.
pub fn emit_security_blocked(execution_id: &str, reason: &str, risk_score: f64, violations: usize) {
    warn!(
        event = "security.blocked",
        execution_id = %execution_id,
        reason = %reason,
        risk_score = risk_score,
        violations = violations,
    );
}

pub fn emit_cache_hit(key: &str, tier: &str) {
    info!(event = "cache.hit", key = %key, tier = %tier);
}

pub fn emit_circuit_transition(breaker: &str, from: &str, to: &str) {
    warn!(event = "circuit.transition", breaker = %breaker, from = %from, to = %to);
}

pub fn emit_rate_limit_rejected(identity: &str, rule_id: &str, action: RateLimitAction) {
    warn!(
        event = "rate_limit.rejected",
        identity = %identity,
        rule = %rule_id,
        action = %action,
    );
}

pub fn emit_pool_resized(from: usize, to: usize, utilization: f64) {
    info!(event = "pool.resized", from = from, to = to, utilization = utilization);
}

pub fn emit_health_check_failed(check: &str, error: &dyn std::fmt::Display) {
    warn!(event = "health.check_failed", check = %check, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_span_create() {
        let _span = ExecutionSpan::enter("exec-1", "python");
        emit_execution_started("exec-1", "anonymous", "run");
        emit_execution_finished("exec-1", 12, true, false);
    }
}
