//! Execution request as submitted by callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::language::Language;

/// What the caller wants done with the submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    #[default]
    Run,
    Test,
    PerformanceTest,
    QualityAnalysis,
    SecurityScan,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Run => "run",
            ExecutionType::Test => "test",
            ExecutionType::PerformanceTest => "performance_test",
            ExecutionType::QualityAnalysis => "quality_analysis",
            ExecutionType::SecurityScan => "security_scan",
        }
    }
}

impl std::fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied tightening of the scan policy. Never loosens it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityRequirements {
    /// Block when the aggregate risk score exceeds this value.
    #[serde(default)]
    pub max_risk_score: Option<f64>,
    /// Block when more than this many violations are found.
    #[serde(default)]
    pub max_violations: Option<usize>,
}

fn default_timeout() -> u64 {
    30
}

/// One code-execution job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    #[serde(default)]
    pub execution_type: ExecutionType,
    /// Wall-clock budget in seconds (1..=300).
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    /// Fed to the process on stdin.
    #[serde(default)]
    pub input_data: Option<String>,
    /// When set, trimmed stdout must equal trimmed expected output.
    #[serde(default)]
    pub expected_output: Option<String>,
    /// Keys: `max_execution_time` (s), `max_memory_mb`, `max_cpu_percent`.
    #[serde(default)]
    pub performance_thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub security_requirements: SecurityRequirements,
    /// Identity used for rate limiting and audit.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Session used for load-balancer affinity.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Caller region used for geographic routing.
    #[serde(default)]
    pub region: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            execution_type: ExecutionType::Run,
            timeout: default_timeout(),
            dependencies: Vec::new(),
            environment_variables: BTreeMap::new(),
            input_data: None,
            expected_output: None,
            performance_thresholds: BTreeMap::new(),
            security_requirements: SecurityRequirements::default(),
            client_id: None,
            session_id: None,
            region: None,
        }
    }

    pub fn with_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = execution_type;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input_data = Some(input.into());
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    pub fn with_threshold(mut self, key: impl Into<String>, value: f64) -> Self {
        self.performance_thresholds.insert(key.into(), value);
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Identity for rate limiting and audit attribution.
    pub fn identity(&self) -> &str {
        self.client_id.as_deref().unwrap_or("anonymous")
    }
}
