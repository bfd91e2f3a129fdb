//! codeboxd - JSON-lines execution service
//!
//! Reads one `ExecutionRequest` per line from stdin, runs them through the
//! async processor, and writes one `ExecutionResponse` per line to stdout in
//! request order. Logs go to stderr. Metrics are flushed on EOF or Ctrl-C.
//!
//! Configuration: `CODEBOX_CONFIG` names a TOML file; otherwise defaults
//! plus `CODEBOX_*` overrides. `CODEBOX_LOG_FORMAT=json` selects JSON logs.
//! `CODEBOX_AUDIT_LOG` appends the audit trail to a JSON-lines file. With
//! `cache.l2_enabled` the shared cache tier and a durable audit copy live in
//! SurrealDB (`CODEBOX_SURREAL_*`, in-memory when unset).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

use codebox_core::processor::TaskHandler;
use codebox_core::security::{JsonlFileSink, SurrealAuditSink};
use codebox_core::{
    AsyncProcessor, AuditLogger, ExecutionRequest, ExecutionResponse, MultiLevelCache,
    PlatformConfig, SandboxError, SandboxOrchestrator, SurrealHandle, TaskHandle,
};

const CONFIG_ENV: &str = "CODEBOX_CONFIG";
const LOG_FORMAT_ENV: &str = "CODEBOX_LOG_FORMAT";
const AUDIT_LOG_ENV: &str = "CODEBOX_AUDIT_LOG";

/// A response slot, kept in request order.
enum Pending {
    Queued(TaskHandle<ExecutionResponse>),
    Done(ExecutionResponse),
}

fn parse_request(line: &str) -> Result<ExecutionRequest, SandboxError> {
    serde_json::from_str(line).map_err(SandboxError::from)
}

fn load_config() -> Result<PlatformConfig> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PlatformConfig::from_file(&path)
            .with_context(|| format!("Failed to load config: {}", path.to_string_lossy())),
        None => PlatformConfig::from_env().context("Invalid CODEBOX_* environment configuration"),
    }
}

/// Orchestrator with the persistence the configuration asks for.
async fn build_orchestrator(config: &PlatformConfig) -> Result<SandboxOrchestrator> {
    let mut audit = AuditLogger::default();
    if let Some(path) = std::env::var_os(AUDIT_LOG_ENV) {
        info!(path = %path.to_string_lossy(), "codeboxd: audit log file enabled");
        audit = audit.with_sink(Arc::new(JsonlFileSink::new(path)));
    }

    let mut builder = SandboxOrchestrator::builder(config.clone());
    if config.cache.l2_enabled {
        let handle = Arc::new(
            SurrealHandle::setup_from_env()
                .await
                .context("Failed to connect to shared state")?,
        );
        let cache = MultiLevelCache::from_config(&config.cache, Some(handle.clone()))
            .context("Failed to build cache tiers")?;
        audit = audit.with_sink(Arc::new(SurrealAuditSink::new(handle)));
        builder = builder.cache(Arc::new(cache));
    }

    builder
        .audit_logger(Arc::new(audit))
        .build()
        .context("Failed to build sandbox")
}

/// Write each response as it becomes available, preserving slot order.
async fn write_responses<W>(mut rx: mpsc::Receiver<Pending>, mut out: W) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(pending) = rx.recv().await {
        let response = match pending {
            Pending::Queued(handle) => handle
                .result()
                .await
                .unwrap_or_else(|e| ExecutionResponse::from_error(&e)),
            Pending::Done(response) => response,
        };
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    codebox_core::init_tracing(json_logs, Level::INFO);

    let config = load_config()?;
    let orchestrator = Arc::new(build_orchestrator(&config).await?);
    let health = orchestrator
        .health_monitor()
        .clone()
        .spawn(Duration::from_secs(config.health.check_interval_secs.max(1)));

    let handler: Arc<dyn TaskHandler<ExecutionRequest, ExecutionResponse>> = orchestrator.clone();
    let processor = AsyncProcessor::new(&config.processor, handler);

    let (tx, rx) = mpsc::channel(config.processor.queue_size.max(1));
    let writer = tokio::spawn(write_responses(rx, tokio::io::stdout()));

    info!(version = codebox_core::VERSION, "codeboxd: ready");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("codeboxd: interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let pending = match parse_request(&line) {
            Ok(request) => match processor.submit_task(request).await {
                Ok(handle) => Pending::Queued(handle),
                Err(e) => {
                    warn!(line = line_no, error = %e, "codeboxd: request rejected");
                    Pending::Done(ExecutionResponse::from_error(&e))
                }
            },
            Err(e) => {
                warn!(line = line_no, error = %e, "codeboxd: invalid request");
                Pending::Done(ExecutionResponse::from_error(&e))
            }
        };
        if tx.send(pending).await.is_err() {
            warn!("codeboxd: response writer stopped");
            break;
        }
    }

    drop(tx);
    writer.await.context("Response writer panicked")??;
    processor.shutdown().await;
    health.stop().await;

    orchestrator.flush_metrics();
    let stats = processor.stats();
    info!(
        requests = line_no,
        completed = stats.completed,
        failed = stats.failed,
        rejected = stats.rejected,
        "codeboxd: stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_defaults() {
        let request = parse_request(r#"{"code":"print(1)","language":"python"}"#).unwrap();
        assert_eq!(request.timeout, 30);
        assert_eq!(request.identity(), "anonymous");
        assert!(parse_request("{not json").is_err());
    }

    #[tokio::test]
    async fn test_responses_are_written_in_slot_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut first = ExecutionResponse::new();
        first.stdout = "first".into();
        let second = ExecutionResponse::from_error(&SandboxError::Execution("bad line".into()));
        tx.send(Pending::Done(first)).await.unwrap();
        tx.send(Pending::Done(second)).await.unwrap();
        drop(tx);

        let out = write_responses(rx, Vec::new()).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<ExecutionResponse> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].stdout, "first");
        assert!(!lines[1].success);
    }
}
