//! Sliding-window rate limiting per request identity.
//!
//! Every `(identity, rule)` pair owns a window of admission instants. A rule
//! admits a request while its window holds fewer than `max_requests`
//! entries younger than `window_secs`. When a rule trips:
//!
//! - `block` marks the identity blocked until [`RateLimiter::unblock`];
//! - `throttle` and `log` reject this request only.
//!
//! Rules with [`RuleScope::Violations`] count security violations instead of
//! requests and are fed through [`RateLimiter::record_violation`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::glob;
use crate::obs;

/// Windows tracked before idle ones are swept.
const MAX_TRACKED_WINDOWS: usize = 10_000;

/// What happens when a rule trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitAction {
    Block,
    Throttle,
    Log,
}

impl std::fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RateLimitAction::Block => "block",
            RateLimitAction::Throttle => "throttle",
            RateLimitAction::Log => "log",
        })
    }
}

/// What a rule counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    #[default]
    Requests,
    Violations,
}

/// One throttling policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub id: String,
    /// Glob over identities; `*` applies to everyone.
    #[serde(default = "default_pattern")]
    pub pattern: String,
    pub max_requests: u32,
    pub window_secs: u64,
    pub action: RateLimitAction,
    #[serde(default)]
    pub scope: RuleScope,
}

fn default_pattern() -> String {
    "*".to_string()
}

impl RateLimitRule {
    pub fn new(
        id: impl Into<String>,
        max_requests: u32,
        window_secs: u64,
        action: RateLimitAction,
    ) -> Self {
        Self {
            id: id.into(),
            pattern: default_pattern(),
            max_requests,
            window_secs,
            action,
            scope: RuleScope::Requests,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Sustained, burst and violation-rate rules.
    pub fn default_rules() -> Vec<RateLimitRule> {
        vec![
            RateLimitRule::new("sustained", 100, 60, RateLimitAction::Throttle),
            RateLimitRule::new("burst", 20, 1, RateLimitAction::Throttle),
            RateLimitRule::new("violation_rate", 5, 300, RateLimitAction::Block)
                .with_scope(RuleScope::Violations),
        ]
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.id.trim().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "rate limit rule id must not be empty".into(),
            ));
        }
        if self.max_requests == 0 || self.window_secs == 0 {
            return Err(SandboxError::InvalidConfig(format!(
                "rate limit rule {}: max_requests and window_secs must be positive",
                self.id
            )));
        }
        glob::compile(&self.pattern)?;
        Ok(())
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Rule that rejected the request.
    pub rule_id: Option<String>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            rule_id: None,
        }
    }

    fn reject(rule_id: &str, reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            rule_id: Some(rule_id.to_string()),
        }
    }

    /// Convert a rejection into the error surfaced to callers.
    pub fn into_result(self, identity: &str) -> SandboxResult<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(SandboxError::RateLimited {
                identity: identity.to_string(),
                reason: self.reason.unwrap_or_else(|| "rate limited".into()),
            })
        }
    }
}

struct CompiledRule {
    rule: RateLimitRule,
    matcher: Regex,
}

#[derive(Default)]
struct LimiterState {
    windows: HashMap<(String, String), VecDeque<Instant>>,
    /// Blocked identity -> rule that blocked it.
    blocked: HashMap<String, String>,
}

/// Sliding-window limiter over a fixed rule set.
pub struct RateLimiter {
    rules: Vec<CompiledRule>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(rules: Vec<RateLimitRule>) -> SandboxResult<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            rule.validate()?;
            let matcher = glob::compile(&rule.pattern)?;
            compiled.push(CompiledRule { rule, matcher });
        }
        Ok(Self {
            rules: compiled,
            state: Mutex::new(LimiterState::default()),
        })
    }

    pub fn with_default_rules() -> Self {
        Self {
            rules: RateLimitRule::default_rules()
                .into_iter()
                .filter_map(|rule| {
                    glob::compile(&rule.pattern)
                        .ok()
                        .map(|matcher| CompiledRule { rule, matcher })
                })
                .collect(),
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check one rule for `identity`, recording the hit when admitted.
    /// An unknown rule id is rejected.
    pub fn check(&self, identity: &str, rule_id: &str) -> RateDecision {
        let Some(compiled) = self.rules.iter().find(|c| c.rule.id == rule_id) else {
            warn!(identity, rule = rule_id, "rate limiter: unknown rule");
            return RateDecision::reject(rule_id, format!("unknown rate-limit rule {rule_id}"));
        };
        let mut state = self.lock();
        if let Some(decision) = blocked_decision(&state, identity) {
            return decision;
        }
        if !compiled.matcher.is_match(identity) {
            return RateDecision::allow();
        }
        admit(&mut state, &[&compiled.rule], identity, Instant::now())
    }

    /// Check every request-scope rule matching `identity`. The hit is
    /// recorded only when every rule admits it; the first rejection is
    /// returned.
    pub fn check_all(&self, identity: &str) -> RateDecision {
        self.check_scope(identity, RuleScope::Requests)
    }

    /// Count one security violation against `identity`.
    pub fn record_violation(&self, identity: &str) -> RateDecision {
        self.check_scope(identity, RuleScope::Violations)
    }

    fn check_scope(&self, identity: &str, scope: RuleScope) -> RateDecision {
        let now = Instant::now();
        let mut state = self.lock();
        if let Some(decision) = blocked_decision(&state, identity) {
            return decision;
        }

        let matching: Vec<&RateLimitRule> = self
            .rules
            .iter()
            .filter(|c| c.rule.scope == scope && c.matcher.is_match(identity))
            .map(|c| &c.rule)
            .collect();
        let outcome = admit(&mut state, &matching, identity, now);

        if state.windows.len() > MAX_TRACKED_WINDOWS {
            sweep(&mut state, &self.rules, now);
        }
        outcome
    }

    /// Hits currently inside `rule_id`'s window for `identity`.
    pub fn window_hits(&self, identity: &str, rule_id: &str) -> usize {
        let Some(rule) = self.rules().find(|r| r.id == rule_id) else {
            return 0;
        };
        let now = Instant::now();
        let window = rule.window();
        self.lock()
            .windows
            .get(&(identity.to_string(), rule_id.to_string()))
            .map_or(0, |hits| {
                hits.iter()
                    .filter(|t| now.saturating_duration_since(**t) < window)
                    .count()
            })
    }

    pub fn is_blocked(&self, identity: &str) -> bool {
        self.lock().blocked.contains_key(identity)
    }

    /// Lift a block. Returns whether the identity was blocked.
    pub fn unblock(&self, identity: &str) -> bool {
        let mut state = self.lock();
        let was_blocked = state.blocked.remove(identity).is_some();
        if was_blocked {
            // A fresh start: stale hits would re-trip the rule immediately.
            state.windows.retain(|(id, _), _| id != identity);
            info!(identity, "rate limiter: identity unblocked");
        }
        was_blocked
    }

    pub fn blocked_identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().blocked.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn blocked_decision(state: &LimiterState, identity: &str) -> Option<RateDecision> {
    state.blocked.get(identity).map(|rule_id| {
        RateDecision::reject(rule_id, format!("identity {identity} is blocked by rule {rule_id}"))
    })
}

/// Admit a hit against every rule in `rules`, or reject without consuming
/// any budget. Every full rule applies its action.
fn admit(
    state: &mut LimiterState,
    rules: &[&RateLimitRule],
    identity: &str,
    now: Instant,
) -> RateDecision {
    let tripped: Vec<&RateLimitRule> = rules
        .iter()
        .copied()
        .filter(|rule| window_full(state, rule, identity, now))
        .collect();

    let Some(first) = tripped.first() else {
        for rule in rules {
            state
                .windows
                .entry((identity.to_string(), rule.id.clone()))
                .or_default()
                .push_back(now);
        }
        return RateDecision::allow();
    };

    for rule in &tripped {
        trip(state, rule, identity);
    }
    RateDecision::reject(
        &first.id,
        format!(
            "rule {} allows {} per {}s",
            first.id, first.max_requests, first.window_secs
        ),
    )
}

/// Drop expired hits, then report whether the window is at capacity.
fn window_full(
    state: &mut LimiterState,
    rule: &RateLimitRule,
    identity: &str,
    now: Instant,
) -> bool {
    let window = rule.window();
    let hits = state
        .windows
        .entry((identity.to_string(), rule.id.clone()))
        .or_default();
    while hits
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= window)
    {
        hits.pop_front();
    }
    hits.len() >= rule.max_requests as usize
}

fn trip(state: &mut LimiterState, rule: &RateLimitRule, identity: &str) {
    obs::emit_rate_limit_rejected(identity, &rule.id, rule.action);
    match rule.action {
        RateLimitAction::Block => {
            warn!(identity, rule = %rule.id, "rate limiter: identity blocked");
            state.blocked.insert(identity.to_string(), rule.id.clone());
        }
        RateLimitAction::Log => {
            warn!(identity, rule = %rule.id, "rate limiter: limit exceeded");
        }
        RateLimitAction::Throttle => {}
    }
}

fn sweep(state: &mut LimiterState, rules: &[CompiledRule], now: Instant) {
    state.windows.retain(|(_, rule_id), hits| {
        let window = rules
            .iter()
            .find(|c| &c.rule.id == rule_id)
            .map(|c| c.rule.window())
            .unwrap_or_default();
        hits.back()
            .is_some_and(|t| now.saturating_duration_since(*t) < window)
    });
}
