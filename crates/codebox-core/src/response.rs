//! Execution response returned to callers (and cached).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, SandboxError};
use crate::security::violation::SecurityViolation;

/// Pass/fail tally parsed from test output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Aggregate of a repeated-execution performance run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceResults {
    pub iterations: u32,
    pub successful_iterations: u32,
    pub avg_execution_time: f64,
    pub min_execution_time: f64,
    pub max_execution_time: f64,
    pub avg_memory_mb: f64,
    pub peak_memory_mb: f64,
    pub avg_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    /// Threshold name -> human-readable breach.
    #[serde(default)]
    pub threshold_violations: BTreeMap<String, String>,
}

/// Static quality metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityResults {
    pub lines_of_code: usize,
    pub comment_lines: usize,
    pub blank_lines: usize,
    pub function_count: usize,
    pub cyclomatic_complexity: usize,
    pub halstead_volume: f64,
    pub maintainability_index: f64,
    pub documentation_ratio: f64,
    pub test_coverage_estimate: f64,
    pub max_line_length: usize,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Job outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Seconds.
    pub execution_time: f64,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,

    pub test_results: Option<TestResults>,
    #[serde(default)]
    pub passed_tests: Vec<String>,
    #[serde(default)]
    pub failed_tests: Vec<String>,

    pub security_scan_passed: bool,
    #[serde(default)]
    pub security_violations: Vec<SecurityViolation>,
    #[serde(default)]
    pub risk_score: f64,

    pub performance_test_passed: Option<bool>,
    pub performance_results: Option<PerformanceResults>,

    pub code_quality_score: Option<f64>,
    pub code_quality_results: Option<QualityResults>,

    pub timeout_occurred: bool,
    pub memory_limit_exceeded: bool,
    #[serde(default)]
    pub security_violation_detected: bool,

    pub error_message: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub warnings: Vec<String>,

    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl ExecutionResponse {
    /// Empty response with a fresh execution id; fields are filled by the
    /// pipeline as stages complete.
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            execution_time: 0.0,
            memory_usage_mb: 0.0,
            cpu_usage_percent: 0.0,
            test_results: None,
            passed_tests: Vec::new(),
            failed_tests: Vec::new(),
            security_scan_passed: false,
            security_violations: Vec::new(),
            risk_score: 0.0,
            performance_test_passed: None,
            performance_results: None,
            code_quality_score: None,
            code_quality_results: None,
            timeout_occurred: false,
            memory_limit_exceeded: false,
            security_violation_detected: false,
            error_message: None,
            error_kind: None,
            warnings: Vec::new(),
            cache_hit: false,
            worker_id: None,
            instance_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed response describing `err`.
    pub fn from_error(err: &SandboxError) -> Self {
        let mut response = Self::new();
        response.apply_error(err);
        response
    }

    /// Mark this response failed with `err`, keeping fields already filled.
    pub fn apply_error(&mut self, err: &SandboxError) {
        self.success = false;
        self.error_message = Some(err.to_string());
        self.error_kind = Some(err.kind());
        match err {
            SandboxError::Security { violations, .. } => {
                self.security_scan_passed = false;
                if self.security_violations.is_empty() {
                    self.security_violations = violations.clone();
                }
            }
            SandboxError::Timeout { .. } => self.timeout_occurred = true,
            _ => {}
        }
    }
}

impl Default for ExecutionResponse {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::violation::{ThreatLevel, ViolationType};

    #[test]
    fn test_new_response_is_failed_until_proven() {
        let r = ExecutionResponse::new();
        assert!(!r.success);
        assert!(!r.execution_id.is_empty());
        assert!(!r.cache_hit);
    }

    #[test]
    fn test_from_security_error_carries_violations() {
        let violation = SecurityViolation::new(
            "py.os_system",
            ViolationType::SystemCommand,
            ThreatLevel::Critical,
            "os.system call",
            None,
        );
        let err = SandboxError::Security {
            reason: "critical violation".into(),
            violations: vec![violation],
        };
        let r = ExecutionResponse::from_error(&err);
        assert!(!r.success);
        assert!(!r.security_scan_passed);
        assert_eq!(r.security_violations.len(), 1);
        assert_eq!(r.error_kind, Some(ErrorKind::SecurityError));
    }

    #[test]
    fn test_from_timeout_sets_flag() {
        let err = SandboxError::Timeout {
            elapsed_ms: 2000,
            limit_ms: 1000,
        };
        let r = ExecutionResponse::from_error(&err);
        assert!(r.timeout_occurred);
        assert_eq!(r.error_kind, Some(ErrorKind::TimeoutError));
    }
}
