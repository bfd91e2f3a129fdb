//! Execution engine: runs sanitized code in a policed subprocess.
//!
//! - [`executor`] : `ExecutionEngine`, the subprocess implementation
//! - [`monitor`]  : `/proc` sampling and limit/behaviour verdicts
//! - [`isolation`]: environment and syscall allow-lists per isolation level
//!
//! The orchestrator only sees the [`CodeExecutor`] trait, so tests and
//! alternative backends can stand in for real processes.

pub mod executor;
pub mod isolation;
pub mod monitor;

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SandboxResult;
use crate::language::Language;
use crate::request::{ExecutionRequest, ExecutionType};

pub use executor::ExecutionEngine;
pub use isolation::IsolationProfile;
pub use monitor::{ProcessSample, ResourceMonitor, Termination};

/// Everything the engine needs to run one program.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionJob {
    pub execution_id: String,
    pub language: Language,
    pub code: String,
    pub execution_type: ExecutionType,
    pub timeout: Duration,
    pub input_data: Option<String>,
    pub environment: BTreeMap<String, String>,
}

impl ExecutionJob {
    /// Job for `request` running already-sanitized `code`.
    pub fn from_request(
        execution_id: impl Into<String>,
        request: &ExecutionRequest,
        code: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            language: request.language,
            code: code.into(),
            execution_type: request.execution_type,
            timeout: Duration::from_secs(request.timeout),
            input_data: request.input_data.clone(),
            environment: request.environment_variables.clone(),
        }
    }
}

/// Raw outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Seconds, compile step included.
    pub execution_time: f64,
    /// Peak resident set size.
    pub memory_usage_mb: f64,
    /// Mean CPU over the samples taken.
    pub cpu_usage_percent: f64,
    pub timeout_occurred: bool,
    pub memory_limit_exceeded: bool,
    pub security_violation_detected: bool,
    /// Why the engine killed the process, if it did.
    pub termination_reason: Option<String>,
    pub output_truncated: bool,
    pub passed_tests: Vec<String>,
    pub failed_tests: Vec<String>,
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// Exit code 0 and no limit or behaviour flag.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
            && !self.timeout_occurred
            && !self.memory_limit_exceeded
            && !self.security_violation_detected
    }
}

/// Runs one job. Implementations must enforce `job.timeout`.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, job: &ExecutionJob) -> SandboxResult<ExecutionResult>;
}

static PASSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:PASS(?:ED)?:?|✓|ok(?:\s+\d+)?\s*-?)\s+(.+?)\s*$").expect("static regex")
});
static FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:FAIL(?:ED)?:?|✗|not ok(?:\s+\d+)?\s*-?)\s+(.+?)\s*$")
        .expect("static regex")
});
/// `test name ... ok` (Rust harness) and `name (module.Class) ... ok`
/// (Python unittest, verbose).
static DOTTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:test\s+)?(\S+)(?:\s+\([^)]*\))?\s+\.\.\.\s+(ok|FAILED|FAIL|ERROR)\s*$")
        .expect("static regex")
});

/// Pass/fail markers in test output, in order of appearance.
pub fn parse_test_results(stdout: &str, stderr: &str) -> (Vec<String>, Vec<String>) {
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    for line in stdout.lines().chain(stderr.lines()) {
        if let Some(c) = DOTTED.captures(line) {
            let name = c[1].to_string();
            if &c[2] == "ok" {
                passed.push(name);
            } else {
                failed.push(name);
            }
        } else if let Some(c) = FAILED.captures(line) {
            failed.push(c[1].to_string());
        } else if let Some(c) = PASSED.captures(line) {
            passed.push(c[1].to_string());
        }
    }
    (passed, failed)
}
