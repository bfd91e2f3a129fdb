//! Platform configuration.
//!
//! Every section has serde defaults so a partial TOML file (or none at all)
//! yields a usable configuration. [`PlatformConfig::validate`] enforces the
//! documented ranges.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::{BalancingStrategy, InstanceConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::processor::QueuePolicy;
use crate::security::rate_limit::RateLimitRule;

/// How strongly the executed process is separated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Container,
    #[default]
    Process,
    Thread,
}

/// Execution limits and feature switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Seconds, 1..=300.
    pub max_execution_time: u64,
    /// 64..=8192.
    pub max_memory_mb: u64,
    /// 10..=100. Default CPU ceiling for performance tests.
    pub max_cpu_percent: f64,
    pub enable_network_access: bool,
    pub enable_file_system_access: bool,
    /// Extensions the program may leave behind in its working directory.
    pub allowed_file_extensions: Vec<String>,
    /// 1..=100. Ceiling on bytes written into the working directory.
    pub max_file_size_mb: u64,
    pub security_scan_enabled: bool,
    pub performance_testing_enabled: bool,
    pub code_quality_analysis_enabled: bool,
    pub isolation_level: IsolationLevel,
    pub cleanup_after_execution: bool,
    /// Parent directory for per-execution working directories.
    pub sandbox_root: Option<PathBuf>,
    /// Execution is blocked when the violation count exceeds this.
    pub max_violations: usize,
    /// Repetitions for `performance_test` requests.
    pub performance_iterations: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_execution_time: 60,
            max_memory_mb: 1024,
            max_cpu_percent: 80.0,
            enable_network_access: false,
            enable_file_system_access: true,
            allowed_file_extensions: [
                ".py", ".js", ".ts", ".java", ".class", ".cpp", ".cs", ".exe", ".go", ".rs",
                ".txt", ".json", ".csv", ".md",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            max_file_size_mb: 10,
            security_scan_enabled: true,
            performance_testing_enabled: true,
            code_quality_analysis_enabled: true,
            isolation_level: IsolationLevel::Process,
            cleanup_after_execution: true,
            sandbox_root: None,
            max_violations: 5,
            performance_iterations: 3,
        }
    }
}

/// Runtime monitoring of the child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    /// Detect suspicious behaviour in addition to hard limits.
    pub behavior_monitoring: bool,
    pub cpu_spike_percent: f64,
    /// Consecutive samples above `cpu_spike_percent` before terminating.
    pub cpu_spike_samples: u32,
    /// RSS growth between two samples treated as a memory bomb.
    pub memory_growth_mb: f64,
    /// Open descriptors under these prefixes terminate the process.
    pub restricted_paths: Vec<String>,
    pub max_output_bytes: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            behavior_monitoring: true,
            cpu_spike_percent: 90.0,
            cpu_spike_samples: 50,
            memory_growth_mb: 512.0,
            restricted_paths: [
                "/etc/shadow",
                "/etc/sudoers",
                "/root",
                "/proc/kcore",
                "/dev/mem",
                "/dev/kmem",
                "/sys/kernel",
                "/var/run/docker.sock",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

/// Multi-level cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub l1_capacity: usize,
    pub default_ttl_secs: u64,
    /// Connect the SurrealDB-backed shared tier.
    pub l2_enabled: bool,
    /// Directory of the durable tier; disabled when unset.
    pub l3_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_capacity: 1000,
            default_ttl_secs: 3600,
            l2_enabled: false,
            l3_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub initial_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_workers: 4,
            min_workers: 2,
            max_workers: 16,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
        }
    }
}

/// Async admission queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub queue_size: usize,
    pub max_workers: usize,
    pub processing_timeout_secs: u64,
    pub queue_policy: QueuePolicy,
    /// Idle time after which a surplus worker retires.
    pub worker_idle_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue_size: 100,
            max_workers: 8,
            processing_timeout_secs: 330,
            queue_policy: QueuePolicy::Block { timeout_ms: 5_000 },
            worker_idle_ms: 2_000,
        }
    }
}

impl ProcessorConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Health monitor cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub check_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            check_timeout_secs: 5,
        }
    }
}

/// Load-balancer deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: BalancingStrategy,
    pub instances: Vec<InstanceConfig>,
    /// Points per instance on the affinity hash ring.
    pub virtual_nodes: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::RoundRobin,
            instances: Vec::new(),
            virtual_nodes: 64,
        }
    }
}

/// Complete platform configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub sandbox: SandboxConfig,
    pub monitor: MonitorConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub processor: ProcessorConfig,
    pub breaker: BreakerConfig,
    pub health: HealthConfig,
    pub balancer: BalancerConfig,
    pub rate_limits: Vec<RateLimitRule>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            monitor: MonitorConfig::default(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            processor: ProcessorConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
            balancer: BalancerConfig::default(),
            rate_limits: RateLimitRule::default_rules(),
        }
    }
}

impl PlatformConfig {
    /// Parse TOML, apply environment overrides, validate.
    pub fn from_toml_str(input: &str) -> SandboxResult<Self> {
        let mut config: PlatformConfig = toml::from_str(input)
            .map_err(|e| SandboxError::InvalidConfig(format!("toml: {e}")))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> SandboxResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> SandboxResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CODEBOX_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> SandboxResult<()> {
        if let Some(v) = env_parse::<u64>("CODEBOX_MAX_EXECUTION_TIME")? {
            self.sandbox.max_execution_time = v;
        }
        if let Some(v) = env_parse::<u64>("CODEBOX_MAX_MEMORY_MB")? {
            self.sandbox.max_memory_mb = v;
        }
        if let Some(v) = env_parse::<bool>("CODEBOX_ENABLE_NETWORK")? {
            self.sandbox.enable_network_access = v;
        }
        if let Ok(root) = std::env::var("CODEBOX_SANDBOX_ROOT") {
            self.sandbox.sandbox_root = Some(PathBuf::from(root));
        }
        if let Ok(dir) = std::env::var("CODEBOX_CACHE_DIR") {
            self.cache.l3_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Enforce documented ranges.
    pub fn validate(&self) -> SandboxResult<()> {
        let s = &self.sandbox;
        check_range("sandbox.max_execution_time", s.max_execution_time, 1, 300)?;
        check_range("sandbox.max_memory_mb", s.max_memory_mb, 64, 8192)?;
        check_range("sandbox.max_file_size_mb", s.max_file_size_mb, 1, 100)?;
        if !(10.0..=100.0).contains(&s.max_cpu_percent) {
            return Err(SandboxError::InvalidConfig(format!(
                "sandbox.max_cpu_percent must be within 10..=100, got {}",
                s.max_cpu_percent
            )));
        }
        if s.performance_iterations == 0 {
            return Err(SandboxError::InvalidConfig(
                "sandbox.performance_iterations must be at least 1".into(),
            ));
        }

        let p = &self.pool;
        if p.min_workers == 0 || p.min_workers > p.max_workers {
            return Err(SandboxError::InvalidConfig(format!(
                "pool bounds invalid: min_workers={} max_workers={}",
                p.min_workers, p.max_workers
            )));
        }
        if p.initial_workers < p.min_workers || p.initial_workers > p.max_workers {
            return Err(SandboxError::InvalidConfig(format!(
                "pool.initial_workers={} outside [{}, {}]",
                p.initial_workers, p.min_workers, p.max_workers
            )));
        }
        if p.scale_down_threshold >= p.scale_up_threshold {
            return Err(SandboxError::InvalidConfig(
                "pool.scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }

        if self.processor.queue_size == 0 || self.processor.max_workers == 0 {
            return Err(SandboxError::InvalidConfig(
                "processor.queue_size and processor.max_workers must be positive".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_max_calls == 0 {
            return Err(SandboxError::InvalidConfig(
                "breaker.failure_threshold and breaker.half_open_max_calls must be positive"
                    .into(),
            ));
        }
        if self.cache.l1_capacity == 0 {
            return Err(SandboxError::InvalidConfig(
                "cache.l1_capacity must be positive".into(),
            ));
        }
        for rule in &self.rate_limits {
            rule.validate()?;
        }
        Ok(())
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> SandboxResult<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SandboxError::InvalidConfig(format!(
            "{name} must be within {min}..={max}, got {value}"
        )))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> SandboxResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SandboxError::InvalidConfig(format!("{key} has invalid value {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PlatformConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.sandbox.max_execution_time, 60);
        assert_eq!(cfg.sandbox.max_memory_mb, 1024);
        assert_eq!(cfg.sandbox.max_cpu_percent, 80.0);
        assert!(!cfg.sandbox.enable_network_access);
        assert!(cfg.sandbox.enable_file_system_access);
        assert_eq!(cfg.sandbox.isolation_level, IsolationLevel::Process);
    }

    #[test]
    fn test_partial_toml() {
        let cfg: PlatformConfig = toml::from_str(
            r#"
            [sandbox]
            max_execution_time = 10
            isolation_level = "thread"

            [breaker]
            failure_threshold = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sandbox.max_execution_time, 10);
        assert_eq!(cfg.sandbox.isolation_level, IsolationLevel::Thread);
        assert_eq!(cfg.sandbox.max_memory_mb, 1024);
        assert_eq!(cfg.breaker.failure_threshold, 2);
        assert_eq!(cfg.breaker.recovery_timeout_ms, 30_000);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut cfg = PlatformConfig::default();
        cfg.sandbox.max_execution_time = 301;
        assert!(matches!(cfg.validate(), Err(SandboxError::InvalidConfig(_))));

        let mut cfg = PlatformConfig::default();
        cfg.sandbox.max_memory_mb = 32;
        assert!(cfg.validate().is_err());

        let mut cfg = PlatformConfig::default();
        cfg.sandbox.max_cpu_percent = 5.0;
        assert!(cfg.validate().is_err());

        let mut cfg = PlatformConfig::default();
        cfg.pool.min_workers = 8;
        cfg.pool.max_workers = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_toml_is_invalid_config() {
        let err = PlatformConfig::from_toml_str("[sandbox\nmax = ").unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
    }
}
