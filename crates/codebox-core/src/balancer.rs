//! Request distribution across execution service instances.
//!
//! Unhealthy instances never receive traffic under any strategy. Session
//! affinity uses a consistent-hash ring with virtual nodes so that adding
//! or removing one instance only remaps the sessions that hashed to it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::BalancerConfig;
use crate::error::{SandboxError, SandboxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    HealthAware,
    Geographic,
    SessionAffinity,
}

/// Static description of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_weight() -> u32 {
    1
}

impl InstanceConfig {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: 1,
            region: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Live view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub region: Option<String>,
    pub active_connections: u32,
    pub healthy: bool,
    pub total_requests: u64,
}

impl From<InstanceConfig> for ServiceInstance {
    fn from(cfg: InstanceConfig) -> Self {
        Self {
            id: cfg.id,
            address: cfg.address,
            weight: cfg.weight,
            region: cfg.region,
            active_connections: 0,
            healthy: true,
            total_requests: 0,
        }
    }
}

/// Caller attributes some strategies route on.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingHint<'a> {
    pub session_id: Option<&'a str>,
    pub region: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerStats {
    pub strategy: BalancingStrategy,
    pub total_requests: u64,
    pub healthy_instances: usize,
    pub instances: Vec<ServiceInstance>,
    pub active_sessions: usize,
}

struct BalancerState {
    instances: Vec<ServiceInstance>,
    cursor: usize,
    rng: StdRng,
    /// Ring point -> instance id.
    ring: BTreeMap<u64, String>,
    affinity: HashMap<String, String>,
    total_requests: u64,
}

pub struct LoadBalancer {
    strategy: BalancingStrategy,
    virtual_nodes: usize,
    state: Mutex<BalancerState>,
}

fn ring_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl LoadBalancer {
    pub fn new(strategy: BalancingStrategy, virtual_nodes: usize) -> Self {
        Self::with_rng(strategy, virtual_nodes, StdRng::from_entropy())
    }

    /// Deterministic weighted selection, for tests and simulations.
    pub fn with_seed(strategy: BalancingStrategy, virtual_nodes: usize, seed: u64) -> Self {
        Self::with_rng(strategy, virtual_nodes, StdRng::seed_from_u64(seed))
    }

    fn with_rng(strategy: BalancingStrategy, virtual_nodes: usize, rng: StdRng) -> Self {
        Self {
            strategy,
            virtual_nodes: virtual_nodes.max(1),
            state: Mutex::new(BalancerState {
                instances: Vec::new(),
                cursor: 0,
                rng,
                ring: BTreeMap::new(),
                affinity: HashMap::new(),
                total_requests: 0,
            }),
        }
    }

    pub fn from_config(config: &BalancerConfig) -> Self {
        let lb = Self::new(config.strategy, config.virtual_nodes);
        for instance in &config.instances {
            lb.add_instance(instance.clone());
        }
        lb
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    fn lock(&self) -> MutexGuard<'_, BalancerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an instance. Returns `false` if the id already exists, in
    /// which case nothing changes.
    pub fn add_instance(&self, config: InstanceConfig) -> bool {
        let mut state = self.lock();
        if state.instances.iter().any(|i| i.id == config.id) {
            return false;
        }
        for v in 0..self.virtual_nodes {
            let point = ring_hash(&format!("{}#{v}", config.id));
            state.ring.insert(point, config.id.clone());
        }
        info!(instance = %config.id, address = %config.address, "balancer: instance added");
        state.instances.push(config.into());
        true
    }

    /// Deregister an instance and end every session pinned to it. Returns
    /// `false` if the id was unknown.
    pub fn remove_instance(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.instances.len();
        state.instances.retain(|i| i.id != id);
        if state.instances.len() == before {
            return false;
        }
        state.ring.retain(|_, owner| owner != id);
        state.affinity.retain(|_, owner| owner != id);
        info!(instance = %id, "balancer: instance removed");
        true
    }

    /// Set health. Returns `false` if the id is unknown.
    pub fn mark_healthy(&self, id: &str, healthy: bool) -> bool {
        let mut state = self.lock();
        match state.instances.iter_mut().find(|i| i.id == id) {
            Some(instance) => {
                if instance.healthy != healthy {
                    info!(instance = %id, healthy, "balancer: health changed");
                }
                instance.healthy = healthy;
                true
            }
            None => false,
        }
    }

    /// Pick an instance and count a connection against it.
    pub fn select(&self, hint: &RoutingHint<'_>) -> SandboxResult<ServiceInstance> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let healthy: Vec<usize> = state
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.healthy)
            .map(|(idx, _)| idx)
            .collect();
        if healthy.is_empty() {
            return Err(SandboxError::Infrastructure(
                "no healthy service instance available".into(),
            ));
        }

        let idx = match self.strategy {
            BalancingStrategy::RoundRobin => round_robin(state, &healthy),
            BalancingStrategy::Weighted => weighted(state, &healthy),
            BalancingStrategy::LeastConnections => least_connections(&state.instances, &healthy),
            BalancingStrategy::HealthAware => least_loaded(&state.instances, &healthy),
            BalancingStrategy::Geographic => {
                let local: Vec<usize> = match hint.region {
                    Some(region) => healthy
                        .iter()
                        .copied()
                        .filter(|&i| state.instances[i].region.as_deref() == Some(region))
                        .collect(),
                    None => Vec::new(),
                };
                if local.is_empty() {
                    least_connections(&state.instances, &healthy)
                } else {
                    least_connections(&state.instances, &local)
                }
            }
            BalancingStrategy::SessionAffinity => match hint.session_id {
                Some(session) => affine(state, session),
                None => round_robin(state, &healthy),
            },
        };

        state.total_requests += 1;
        let chosen = &mut state.instances[idx];
        chosen.active_connections += 1;
        chosen.total_requests += 1;
        debug!(instance = %chosen.id, strategy = ?self.strategy, "balancer: selected");
        Ok(chosen.clone())
    }

    /// Return a connection taken by [`select`](Self::select).
    pub fn release(&self, id: &str) {
        let mut state = self.lock();
        if let Some(instance) = state.instances.iter_mut().find(|i| i.id == id) {
            instance.active_connections = instance.active_connections.saturating_sub(1);
        }
    }

    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.lock().instances.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().instances.is_empty()
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let state = self.lock();
        LoadBalancerStats {
            strategy: self.strategy,
            total_requests: state.total_requests,
            healthy_instances: state.instances.iter().filter(|i| i.healthy).count(),
            instances: state.instances.clone(),
            active_sessions: state.affinity.len(),
        }
    }
}

fn round_robin(state: &mut BalancerState, healthy: &[usize]) -> usize {
    let idx = healthy[state.cursor % healthy.len()];
    state.cursor = state.cursor.wrapping_add(1);
    idx
}

fn weighted(state: &mut BalancerState, healthy: &[usize]) -> usize {
    let total: u64 = healthy
        .iter()
        .map(|&i| u64::from(state.instances[i].weight))
        .sum();
    if total == 0 {
        return round_robin(state, healthy);
    }
    let mut draw = state.rng.gen_range(0..total);
    for &i in healthy {
        let w = u64::from(state.instances[i].weight);
        if draw < w {
            return i;
        }
        draw -= w;
    }
    healthy[healthy.len() - 1]
}

fn least_connections(instances: &[ServiceInstance], candidates: &[usize]) -> usize {
    candidates
        .iter()
        .copied()
        .min_by_key(|&i| instances[i].active_connections)
        .unwrap_or(candidates[0])
}

/// Lowest connections per unit of weight.
fn least_loaded(instances: &[ServiceInstance], candidates: &[usize]) -> usize {
    candidates
        .iter()
        .copied()
        .min_by(|&a, &b| {
            let load = |i: usize| {
                f64::from(instances[i].active_connections) / f64::from(instances[i].weight.max(1))
            };
            load(a).total_cmp(&load(b))
        })
        .unwrap_or(candidates[0])
}

fn affine(state: &mut BalancerState, session: &str) -> usize {
    if let Some(owner) = state.affinity.get(session) {
        if let Some(idx) = state
            .instances
            .iter()
            .position(|i| &i.id == owner && i.healthy)
        {
            return idx;
        }
    }

    // Walk the ring clockwise from the session's point to the first
    // healthy owner.
    let point = ring_hash(session);
    let owner = state
        .ring
        .range(point..)
        .chain(state.ring.range(..point))
        .map(|(_, id)| id)
        .find(|id| state.instances.iter().any(|i| &i.id == *id && i.healthy))
        .cloned();

    // Callers guarantee at least one healthy instance, which owns ring
    // points, so the walk always finds an owner.
    let idx = owner
        .as_ref()
        .and_then(|id| state.instances.iter().position(|i| &i.id == id))
        .unwrap_or(0);
    if let Some(id) = owner {
        state.affinity.insert(session.to_string(), id);
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lb(strategy: BalancingStrategy, ids: &[&str]) -> LoadBalancer {
        let lb = LoadBalancer::with_seed(strategy, 32, 7);
        for id in ids {
            lb.add_instance(InstanceConfig::new(*id, format!("http://{id}:8080")));
        }
        lb
    }

    fn pick(lb: &LoadBalancer) -> String {
        lb.select(&RoutingHint::default()).unwrap().id
    }

    #[test]
    fn test_round_robin_cycles_healthy() {
        let lb = lb(BalancingStrategy::RoundRobin, &["a", "b", "c"]);
        let seq: Vec<String> = (0..6).map(|_| pick(&lb)).collect();
        assert_eq!(seq, ["a", "b", "c", "a", "b", "c"]);

        lb.mark_healthy("b", false);
        for _ in 0..10 {
            assert_ne!(pick(&lb), "b");
        }
    }

    #[test]
    fn test_weighted_distribution() {
        let lb = LoadBalancer::with_seed(BalancingStrategy::Weighted, 8, 42);
        lb.add_instance(InstanceConfig::new("A", "a").with_weight(1));
        lb.add_instance(InstanceConfig::new("B", "b").with_weight(3));
        let mut a = 0u32;
        let mut b = 0u32;
        for _ in 0..1000 {
            match pick(&lb).as_str() {
                "A" => a += 1,
                _ => b += 1,
            }
        }
        let ratio = f64::from(b) / f64::from(a);
        assert!((2.4..=3.8).contains(&ratio), "ratio {ratio} (A={a}, B={b})");
    }

    #[test]
    fn test_least_connections_and_release() {
        let lb = lb(BalancingStrategy::LeastConnections, &["a", "b"]);
        assert_eq!(pick(&lb), "a");
        assert_eq!(pick(&lb), "b");
        lb.release("a");
        assert_eq!(pick(&lb), "a");
    }

    #[test]
    fn test_health_aware_respects_weight() {
        let lb = LoadBalancer::with_seed(BalancingStrategy::HealthAware, 8, 1);
        lb.add_instance(InstanceConfig::new("small", "s").with_weight(1));
        lb.add_instance(InstanceConfig::new("big", "b").with_weight(4));
        let picks: Vec<String> = (0..5).map(|_| pick(&lb)).collect();
        assert_eq!(picks.iter().filter(|p| *p == "big").count(), 4);
    }

    #[test]
    fn test_geographic_prefers_region_then_falls_back() {
        let lb = LoadBalancer::with_seed(BalancingStrategy::Geographic, 8, 1);
        lb.add_instance(InstanceConfig::new("us", "u").with_region("us-east"));
        lb.add_instance(InstanceConfig::new("eu", "e").with_region("eu-west"));
        let hint = RoutingHint {
            region: Some("eu-west"),
            ..RoutingHint::default()
        };
        for _ in 0..3 {
            assert_eq!(lb.select(&hint).unwrap().id, "eu");
        }
        lb.mark_healthy("eu", false);
        assert_eq!(lb.select(&hint).unwrap().id, "us");
    }

    #[test]
    fn test_session_affinity_sticks_and_ends_on_removal() {
        let lb = lb(BalancingStrategy::SessionAffinity, &["a", "b", "c"]);
        let hint = RoutingHint {
            session_id: Some("session-123"),
            ..RoutingHint::default()
        };
        let first = lb.select(&hint).unwrap().id;
        for _ in 0..10 {
            assert_eq!(lb.select(&hint).unwrap().id, first);
        }
        assert_eq!(lb.stats().active_sessions, 1);

        assert!(lb.remove_instance(&first));
        assert_eq!(lb.stats().active_sessions, 0);
        let second = lb.select(&hint).unwrap().id;
        assert_ne!(second, first);
        assert_eq!(lb.select(&hint).unwrap().id, second);
    }

    #[test]
    fn test_add_remove_idempotent() {
        let lb = lb(BalancingStrategy::RoundRobin, &["a"]);
        assert!(!lb.add_instance(InstanceConfig::new("a", "elsewhere")));
        assert_eq!(lb.instances()[0].address, "http://a:8080");
        assert!(lb.remove_instance("a"));
        assert!(!lb.remove_instance("a"));
        assert!(lb.is_empty());
    }

    #[test]
    fn test_no_healthy_instance_is_error() {
        let lb = lb(BalancingStrategy::LeastConnections, &["a"]);
        lb.mark_healthy("a", false);
        assert!(lb.select(&RoutingHint::default()).is_err());
        assert!(lb.mark_healthy("a", true));
        assert!(!lb.mark_healthy("zzz", true));
        assert!(lb.select(&RoutingHint::default()).is_ok());
    }
}
