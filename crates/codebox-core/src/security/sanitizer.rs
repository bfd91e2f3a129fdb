//! Input validation and cleanup.
//!
//! The sanitizer is the first gate: anything it rejects never reaches the
//! scanner or the engine. Keyword matches are reported as warnings only;
//! blocking decisions belong to the scanner.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{SandboxError, SandboxResult};
use crate::language::Language;
use crate::request::ExecutionRequest;

/// Largest accepted source, in bytes.
pub const MAX_CODE_BYTES: usize = 100 * 1024;
/// Largest accepted stdin payload, in bytes.
pub const MAX_INPUT_BYTES: usize = 1024 * 1024;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Variables that would let submitted code hijack the loader or interpreter.
const FORBIDDEN_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "PATH",
    "HOME",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "PYTHONHOME",
    "NODE_OPTIONS",
    "NODE_PATH",
    "JAVA_TOOL_OPTIONS",
    "_JAVA_OPTIONS",
    "RUSTC_WRAPPER",
    "GOFLAGS",
];

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

static DEPENDENCY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.@/\-\[\]=<>~!,:^]+$").expect("static regex")
});

/// Cleaned code plus non-blocking findings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedCode {
    pub code: String,
    pub warnings: Vec<String>,
}

/// Validates and normalizes submitted code and request parameters.
#[derive(Debug, Clone, Default)]
pub struct InputSanitizer;

impl InputSanitizer {
    pub fn new() -> Self {
        Self
    }

    /// Validate and clean `code` for `language`.
    ///
    /// Fails with a security error on empty or oversized input. Control
    /// characters other than tab and newline are removed; CRLF and lone CR
    /// become LF.
    pub fn sanitize(&self, code: &str, language: Language) -> SandboxResult<SanitizedCode> {
        if code.trim().is_empty() {
            return Err(SandboxError::security("code must not be empty"));
        }
        if code.len() > MAX_CODE_BYTES {
            return Err(SandboxError::security(format!(
                "code size {} bytes exceeds limit of {} bytes",
                code.len(),
                MAX_CODE_BYTES
            )));
        }

        let mut warnings = Vec::new();
        let normalized = code.replace("\r\n", "\n").replace('\r', "\n");

        let mut stripped = 0usize;
        let clean: String = normalized
            .chars()
            .filter(|c| {
                let keep = !c.is_control() || *c == '\n' || *c == '\t';
                if !keep {
                    stripped += 1;
                }
                keep
            })
            .collect();
        if stripped > 0 {
            warnings.push(format!("removed {stripped} control character(s)"));
        }

        for keyword in language.dangerous_keywords() {
            if clean.contains(keyword) {
                warnings.push(format!("potentially dangerous construct: {keyword}"));
            }
        }

        Ok(SanitizedCode {
            code: clean,
            warnings,
        })
    }

    /// Validate every request parameter and sanitize the code.
    pub fn sanitize_request(&self, request: &ExecutionRequest) -> SandboxResult<SanitizedCode> {
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&request.timeout) {
            return Err(SandboxError::Execution(format!(
                "timeout must be within {MIN_TIMEOUT_SECS}..={MAX_TIMEOUT_SECS} seconds, got {}",
                request.timeout
            )));
        }

        for name in request.environment_variables.keys() {
            if !ENV_NAME.is_match(name) {
                return Err(SandboxError::security(format!(
                    "invalid environment variable name: {name:?}"
                )));
            }
            if FORBIDDEN_ENV_VARS.contains(&name.to_uppercase().as_str()) {
                return Err(SandboxError::security(format!(
                    "environment variable {name} may not be overridden"
                )));
            }
        }
        for value in request.environment_variables.values() {
            if value.contains('\0') {
                return Err(SandboxError::security(
                    "environment variable values may not contain NUL bytes",
                ));
            }
        }

        for dep in &request.dependencies {
            if !DEPENDENCY_NAME.is_match(dep) {
                return Err(SandboxError::security(format!(
                    "invalid dependency specifier: {dep:?}"
                )));
            }
        }

        if let Some(input) = &request.input_data {
            if input.len() > MAX_INPUT_BYTES {
                return Err(SandboxError::Execution(format!(
                    "input_data size {} bytes exceeds limit of {} bytes",
                    input.len(),
                    MAX_INPUT_BYTES
                )));
            }
        }

        self.sanitize(&request.code, request.language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ExecutionRequest;

    #[test]
    fn test_rejects_empty_and_whitespace() {
        let s = InputSanitizer::new();
        assert!(s.sanitize("", Language::Python).is_err());
        assert!(s.sanitize("   \n\t", Language::Python).is_err());
    }

    #[test]
    fn test_rejects_oversized() {
        let s = InputSanitizer::new();
        let big = "a".repeat(MAX_CODE_BYTES + 1);
        let err = s.sanitize(&big, Language::Python).unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
        let exact = "a".repeat(MAX_CODE_BYTES);
        assert!(s.sanitize(&exact, Language::Python).is_ok());
    }

    #[test]
    fn test_normalizes_line_endings_and_strips_controls() {
        let s = InputSanitizer::new();
        let out = s
            .sanitize("print(1)\r\nprint(2)\rprint(3)\u{0007}\n\tx", Language::Python)
            .unwrap();
        assert_eq!(out.code, "print(1)\nprint(2)\nprint(3)\n\tx");
        assert!(out.warnings.iter().any(|w| w.contains("control character")));
    }

    #[test]
    fn test_keyword_warnings_are_non_blocking() {
        let s = InputSanitizer::new();
        let out = s
            .sanitize("import os\nprint(os.getcwd())", Language::Python)
            .unwrap();
        assert!(out.warnings.iter().any(|w| w.contains("import os")));
    }

    #[test]
    fn test_request_validation() {
        let s = InputSanitizer::new();
        let ok = ExecutionRequest::new("print(1)", Language::Python).with_env("MODE", "x");
        assert!(s.sanitize_request(&ok).is_ok());

        let bad_timeout = ExecutionRequest::new("print(1)", Language::Python).with_timeout(0);
        assert!(s.sanitize_request(&bad_timeout).is_err());

        let preload =
            ExecutionRequest::new("print(1)", Language::Python).with_env("LD_PRELOAD", "/x.so");
        assert!(s.sanitize_request(&preload).is_err());

        let bad_name =
            ExecutionRequest::new("print(1)", Language::Python).with_env("A-B", "x");
        assert!(s.sanitize_request(&bad_name).is_err());

        let mut shell_dep = ExecutionRequest::new("print(1)", Language::Python);
        shell_dep.dependencies.push("requests; rm -rf /".into());
        assert!(s.sanitize_request(&shell_dep).is_err());

        let mut pinned = ExecutionRequest::new("print(1)", Language::Python);
        pinned.dependencies.push("requests==2.31.0".into());
        assert!(s.sanitize_request(&pinned).is_ok());
    }
}
