//! Rate limiting and violation-driven blocking through the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;

use codebox_core::{
    AuditEventType, CodeExecutor, ErrorKind, ExecutionJob, ExecutionRequest, ExecutionResult,
    Language, PlatformConfig, SandboxOrchestrator, SandboxResult,
};

struct Succeeds;

#[async_trait]
impl CodeExecutor for Succeeds {
    fn name(&self) -> &str {
        "succeeds"
    }

    async fn execute(&self, _job: &ExecutionJob) -> SandboxResult<ExecutionResult> {
        Ok(ExecutionResult {
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

fn orchestrator() -> SandboxOrchestrator {
    SandboxOrchestrator::builder(PlatformConfig::default())
        .executor(Arc::new(Succeeds))
        .without_cache()
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_burst_rule_throttles_one_identity_only() {
    let orch = orchestrator();

    let mut rejected = 0;
    for n in 0..25 {
        let r = orch
            .execute_code(
                ExecutionRequest::new(format!("print({n})"), Language::Python).with_client("bursty"),
            )
            .await;
        if r.error_kind == Some(ErrorKind::SecurityError) {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 5);

    let other = orch
        .execute_code(ExecutionRequest::new("print('calm')", Language::Python).with_client("calm"))
        .await;
    assert!(other.success);

    let metrics = orch.metrics();
    assert_eq!(metrics.rate_limited, 5);
    // Throttling never blocks an identity outright.
    assert!(metrics.blocked_identities.is_empty());
    assert_eq!(
        orch.audit_logger()
            .entries()
            .iter()
            .filter(|e| e.event_type == AuditEventType::RateLimitExceeded)
            .count(),
        5
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_violations_block_identity() {
    let orch = orchestrator();

    for n in 0..6 {
        let code = format!("x = eval('{n} + 1')\nprint(x)");
        orch.execute_code(ExecutionRequest::new(code, Language::Python).with_client("mallory"))
            .await;
    }
    assert!(orch.rate_limiter().is_blocked("mallory"));

    let clean = orch
        .execute_code(ExecutionRequest::new("print('hi')", Language::Python).with_client("mallory"))
        .await;
    assert!(!clean.success);
    assert_eq!(clean.error_kind, Some(ErrorKind::SecurityError));
    assert_eq!(orch.metrics().blocked_identities, vec!["mallory".to_string()]);

    let bystander = orch
        .execute_code(ExecutionRequest::new("print('hi')", Language::Python).with_client("trent"))
        .await;
    assert!(bystander.success);

    assert!(orch.rate_limiter().unblock("mallory"));
    let forgiven = orch
        .execute_code(ExecutionRequest::new("print('hi')", Language::Python).with_client("mallory"))
        .await;
    assert!(forgiven.success);
}

#[tokio::test]
async fn test_allowed_violations_are_audited_and_reported() {
    let orch = orchestrator();

    let r = orch
        .execute_code(ExecutionRequest::new(
            "import os\nprint(os.getcwd())",
            Language::Python,
        ))
        .await;

    assert!(r.success, "{:?}", r.error_message);
    assert!(r.security_scan_passed);
    assert!(!r.security_violations.is_empty());
    assert!(r.risk_score > 0.0);
    assert!(orch
        .audit_logger()
        .entries()
        .iter()
        .any(|e| e.event_type == AuditEventType::SecurityViolation));
}
