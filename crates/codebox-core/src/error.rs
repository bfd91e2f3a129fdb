//! Error taxonomy for the sandbox core.

use serde::{Deserialize, Serialize};

use crate::security::violation::SecurityViolation;

/// Coarse error class reported to callers and recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Validation failures, worker exhaustion, processing timeout.
    ExecutionError,
    /// Execution blocked by scan policy or rate limiting.
    SecurityError,
    /// Execution exceeded its time budget.
    TimeoutError,
    /// Infrastructure-level failure.
    SandboxError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::SecurityError => "security_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::SandboxError => "sandbox_error",
        };
        f.write_str(s)
    }
}

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("execution error: {0}")]
    Execution(String),

    #[error("security error: {reason}")]
    Security {
        reason: String,
        violations: Vec<SecurityViolation>,
    },

    #[error("rate limited: {reason}")]
    RateLimited { identity: String, reason: String },

    #[error("execution timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },

    #[error("sandbox infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("circuit breaker open: {consecutive_failures} consecutive failures (threshold {threshold})")]
    CircuitOpen {
        consecutive_failures: u32,
        threshold: u32,
    },

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state error: {0}")]
    State(#[from] codebox_state::StateError),
}

impl SandboxError {
    /// Security rejection without attached violations.
    pub fn security(reason: impl Into<String>) -> Self {
        SandboxError::Security {
            reason: reason.into(),
            violations: Vec::new(),
        }
    }

    /// Map onto the four-way taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Execution(_) | SandboxError::InvalidConfig(_) => {
                ErrorKind::ExecutionError
            }
            SandboxError::Security { .. } | SandboxError::RateLimited { .. } => {
                ErrorKind::SecurityError
            }
            SandboxError::Timeout { .. } => ErrorKind::TimeoutError,
            SandboxError::Infrastructure(_)
            | SandboxError::CircuitOpen { .. }
            | SandboxError::Io(_)
            | SandboxError::Serialization(_)
            | SandboxError::State(_) => ErrorKind::SandboxError,
        }
    }

    /// Whether this failure says something about the health of the
    /// execution backend (as opposed to the submitted code).
    pub fn is_infrastructure(&self) -> bool {
        self.kind() == ErrorKind::SandboxError
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
