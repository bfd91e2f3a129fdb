//! Static-analysis findings and risk scoring.

use serde::{Deserialize, Serialize};

/// Severity of one finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Contribution of one finding at this level to the risk score.
    pub fn weight(&self) -> f64 {
        match self {
            ThreatLevel::Low => 1.0,
            ThreatLevel::Medium => 2.5,
            ThreatLevel::High => 5.0,
            ThreatLevel::Critical => 10.0,
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Category of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    FileAccess,
    NetworkAccess,
    SystemCommand,
    CodeInjection,
    ResourceExhaustion,
    DangerousImport,
    DangerousAttribute,
    RuntimeBehavior,
}

impl std::fmt::Display for ViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationType::FileAccess => "file_access",
            ViolationType::NetworkAccess => "network_access",
            ViolationType::SystemCommand => "system_command",
            ViolationType::CodeInjection => "code_injection",
            ViolationType::ResourceExhaustion => "resource_exhaustion",
            ViolationType::DangerousImport => "dangerous_import",
            ViolationType::DangerousAttribute => "dangerous_attribute",
            ViolationType::RuntimeBehavior => "runtime_behavior",
        };
        f.write_str(s)
    }
}

/// 1-based position in the submitted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeLocation {
    pub line: usize,
    pub column: usize,
}

impl CodeLocation {
    /// Locate a byte offset inside `code`.
    pub fn from_offset(code: &str, offset: usize) -> Self {
        let prefix = &code[..offset.min(code.len())];
        let line = prefix.matches('\n').count() + 1;
        let column = match prefix.rfind('\n') {
            Some(nl) => prefix[nl + 1..].chars().count() + 1,
            None => prefix.chars().count() + 1,
        };
        Self { line, column }
    }
}

/// One detected risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityViolation {
    /// Rule identifier plus position, stable across scans of the same code.
    pub id: String,
    pub violation_type: ViolationType,
    pub threat_level: ThreatLevel,
    pub description: String,
    pub location: Option<CodeLocation>,
    /// The matched source text, trimmed.
    pub snippet: Option<String>,
}

impl SecurityViolation {
    pub fn new(
        rule_id: &str,
        violation_type: ViolationType,
        threat_level: ThreatLevel,
        description: impl Into<String>,
        location: Option<CodeLocation>,
    ) -> Self {
        let id = match location {
            Some(loc) => format!("{rule_id}:{}:{}", loc.line, loc.column),
            None => rule_id.to_string(),
        };
        Self {
            id,
            violation_type,
            threat_level,
            description: description.into(),
            location,
            snippet: None,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn is_critical(&self) -> bool {
        self.threat_level == ThreatLevel::Critical
    }
}

/// Weighted sum of threat levels, capped at 10.
pub fn risk_score(violations: &[SecurityViolation]) -> f64 {
    violations
        .iter()
        .fold(0.0_f64, |acc, v| acc + v.threat_level.weight())
        .min(10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(level: ThreatLevel) -> SecurityViolation {
        SecurityViolation::new("t", ViolationType::FileAccess, level, "d", None)
    }

    #[test]
    fn test_risk_score_weights() {
        assert_eq!(risk_score(&[]), 0.0);
        assert!(risk_score(&[]).is_sign_positive());
        assert_eq!(serde_json::to_string(&risk_score(&[])).unwrap(), "0.0");
        assert_eq!(risk_score(&[v(ThreatLevel::Low), v(ThreatLevel::Medium)]), 3.5);
        assert_eq!(risk_score(&[v(ThreatLevel::High)]), 5.0);
    }

    #[test]
    fn test_risk_score_capped() {
        let many = vec![v(ThreatLevel::High); 5];
        assert_eq!(risk_score(&many), 10.0);
        assert_eq!(risk_score(&[v(ThreatLevel::Critical), v(ThreatLevel::Low)]), 10.0);
    }

    #[test]
    fn test_location_from_offset() {
        let code = "a = 1\nb = os.system('x')\n";
        let offset = code.find("os.system").unwrap();
        let loc = CodeLocation::from_offset(code, offset);
        assert_eq!(loc, CodeLocation { line: 2, column: 5 });
    }

    #[test]
    fn test_violation_type_wire_name() {
        let json = serde_json::to_string(&ViolationType::ResourceExhaustion).unwrap();
        assert_eq!(json, "\"resource_exhaustion\"");
        assert_eq!(ThreatLevel::Critical.to_string(), "critical");
    }
}
