//! codebox core library
//!
//! Sandboxed execution of untrusted code: input sanitizing, static security
//! scanning, rate limiting and audit, policed subprocess execution, and the
//! cache / pool / balancer / resilience layer the orchestrator composes
//! around them.

pub mod analysis;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod glob;
pub mod language;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod pool;
pub mod processor;
pub mod request;
pub mod resilience;
pub mod response;
pub mod security;
pub mod telemetry;

pub use balancer::{
    BalancingStrategy, InstanceConfig, LoadBalancer, LoadBalancerStats, RoutingHint,
    ServiceInstance,
};
pub use cache::{CacheEntry, CacheStats, CacheTier, MultiLevelCache};
pub use config::{
    BalancerConfig, BreakerConfig, CacheConfig, HealthConfig, IsolationLevel, MonitorConfig,
    PlatformConfig, PoolConfig, ProcessorConfig, SandboxConfig,
};
pub use engine::{CodeExecutor, ExecutionEngine, ExecutionJob, ExecutionResult};
pub use error::{ErrorKind, SandboxError, SandboxResult};
pub use language::Language;
pub use metrics::{MetricsSnapshot, PlatformMetrics};
pub use orchestrator::{OrchestratorBuilder, SandboxOrchestrator};
pub use pool::{PoolStats, ResourcePool, WorkerInstance};
pub use processor::{AsyncProcessor, ProcessorStats, QueuePolicy, TaskHandle, TaskHandler};
pub use request::{ExecutionRequest, ExecutionType, SecurityRequirements};
pub use resilience::{CircuitBreaker, CircuitState, HealthMonitor, HealthReport};
pub use response::{ExecutionResponse, PerformanceResults, QualityResults, TestResults};
pub use security::{
    AuditEventType, AuditLogEntry, AuditLogger, InputSanitizer, RateLimitRule, RateLimiter,
    ScanReport, SecurityScanner, SecurityViolation, ThreatLevel, ViolationType,
};
pub use telemetry::init_tracing;

pub use codebox_state::SurrealHandle;

/// codebox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
