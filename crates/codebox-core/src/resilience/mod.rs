//! Fault isolation and recovery.
//!
//! - [`circuit`]: `CircuitBreaker` (closed / open / half_open)
//! - [`health`] : `HealthMonitor` with alerting and recovery actions

pub mod circuit;
pub mod health;

pub use circuit::{CircuitBreaker, CircuitState};
pub use health::{
    recovery_action, AlertHandler, CheckStatus, FnHealthCheck, HealthAlert, HealthCheck,
    HealthMonitor, HealthMonitorHandle, HealthReport, HttpHealthCheck, InstanceHealthCheck,
    OverallHealth, RecoveryAction,
};
