//! codebox - run untrusted code in a policed sandbox
//!
//! ## Commands
//!
//! - `run`: execute one source file and print the response
//! - `scan`: security-scan a source file without running it
//! - `batch`: execute a JSON-lines file of requests concurrently
//! - `config`: print the validated effective configuration

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info, Level};

use codebox_core::{
    ExecutionRequest, ExecutionResponse, ExecutionType, InputSanitizer, Language, PlatformConfig,
    SandboxOrchestrator, ScanReport, SecurityScanner,
};

#[derive(Parser)]
#[command(name = "codebox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed code execution", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON and emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file (defaults plus CODEBOX_* overrides otherwise)
    #[arg(short, long, global = true, env = "CODEBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file
    Run {
        /// Source file to execute
        file: PathBuf,

        /// Language (inferred from the file extension when omitted)
        #[arg(short, long, value_parser = parse_language)]
        language: Option<Language>,

        /// run, test, performance_test, quality_analysis or security_scan
        #[arg(short = 't', long = "type", default_value = "run", value_parser = parse_execution_type)]
        execution_type: ExecutionType,

        /// Timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// File whose contents are fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Expected stdout; the run fails on mismatch
        #[arg(long)]
        expect: Option<String>,

        /// Client identity used for rate limiting and audit
        #[arg(long, default_value = "cli")]
        client: String,
    },

    /// Security-scan a source file without running it
    Scan {
        /// Source file to scan
        file: PathBuf,

        /// Language (inferred from the file extension when omitted)
        #[arg(short, long, value_parser = parse_language)]
        language: Option<Language>,
    },

    /// Execute every request in a JSON-lines file
    Batch {
        /// One ExecutionRequest JSON object per line
        requests: PathBuf,
    },

    /// Print the validated effective configuration
    Config,
}

fn parse_language(s: &str) -> Result<Language, String> {
    s.parse::<Language>().map_err(|e| e.to_string())
}

fn parse_execution_type(s: &str) -> Result<ExecutionType, String> {
    serde_json::from_value(serde_json::Value::String(s.replace('-', "_")))
        .map_err(|_| format!("unknown execution type: {s}"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    codebox_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            file,
            language,
            execution_type,
            timeout,
            stdin,
            expect,
            client,
        } => {
            let language = resolve_language(&file, language)?;
            let code = read_source(&file)?;
            let mut request = ExecutionRequest::new(code, language)
                .with_type(execution_type)
                .with_timeout(timeout)
                .with_client(client);
            if let Some(path) = stdin {
                let input = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read stdin file: {}", path.display()))?;
                request = request.with_input(input);
            }
            if let Some(expected) = expect {
                request = request.with_expected_output(expected);
            }
            cmd_run(config, request, cli.json).await
        }
        Commands::Scan { file, language } => {
            let language = resolve_language(&file, language)?;
            let code = read_source(&file)?;
            cmd_scan(&config, &code, language, cli.json)
        }
        Commands::Batch { requests } => cmd_batch(config, &requests).await,
        Commands::Config => cmd_config(&config, cli.json),
    }
}

fn load_config(path: Option<&Path>) -> Result<PlatformConfig> {
    match path {
        Some(path) => PlatformConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => PlatformConfig::from_env().context("Invalid CODEBOX_* environment configuration"),
    }
}

fn resolve_language(file: &Path, explicit: Option<Language>) -> Result<Language> {
    if let Some(language) = explicit {
        return Ok(language);
    }
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match Language::ALL.iter().find(|l| l.file_extension() == ext) {
        Some(language) => Ok(*language),
        None => bail!(
            "Cannot infer language from {}; pass --language",
            file.display()
        ),
    }
}

fn read_source(file: &Path) -> Result<String> {
    std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read source file: {}", file.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_run(config: PlatformConfig, request: ExecutionRequest, json: bool) -> Result<ExitCode> {
    let orchestrator =
        SandboxOrchestrator::from_config(config).context("Failed to build sandbox")?;
    debug!(language = %request.language, "running source file");
    let response = orchestrator.execute_code(request).await;

    if json {
        print_json(&response)?;
    } else {
        print_response(&response);
    }
    Ok(exit_code(&response))
}

fn print_response(r: &ExecutionResponse) {
    print!("{}", r.stdout);
    if !r.stderr.is_empty() {
        eprint!("{}", r.stderr);
    }
    eprintln!("---");
    eprintln!(
        "execution {} {} in {:.3}s (exit {}, {:.1} MB peak, {:.1}% cpu)",
        r.execution_id,
        if r.success { "succeeded" } else { "failed" },
        r.execution_time,
        r.exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
        r.memory_usage_mb,
        r.cpu_usage_percent,
    );
    if let Some(error) = &r.error_message {
        eprintln!("error: {error}");
    }
    if !r.security_violations.is_empty() {
        eprintln!("security: risk score {:.1}", r.risk_score);
        for v in &r.security_violations {
            eprintln!("  [{}] {}: {}", v.threat_level, v.violation_type, v.description);
        }
    }
    if let Some(tests) = &r.test_results {
        eprintln!(
            "tests: {} passed, {} failed, {} total",
            tests.passed, tests.failed, tests.total
        );
    }
    if let Some(perf) = &r.performance_results {
        eprintln!(
            "performance: {}/{} iterations ok, avg {:.3}s, min {:.3}s, max {:.3}s",
            perf.successful_iterations,
            perf.iterations,
            perf.avg_execution_time,
            perf.min_execution_time,
            perf.max_execution_time
        );
        for (name, detail) in &perf.threshold_violations {
            eprintln!("  threshold {name}: {detail}");
        }
    }
    if let (Some(score), Some(q)) = (r.code_quality_score, &r.code_quality_results) {
        eprintln!(
            "quality: {score:.1}/10 (loc {}, complexity {}, maintainability {:.1})",
            q.lines_of_code, q.cyclomatic_complexity, q.maintainability_index
        );
        for issue in &q.issues {
            eprintln!("  - {issue}");
        }
    }
    for warning in &r.warnings {
        eprintln!("warning: {warning}");
    }
}

fn exit_code(response: &ExecutionResponse) -> ExitCode {
    if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Sanitize and scan without executing.
fn scan(config: &PlatformConfig, code: &str, language: Language) -> Result<(ScanReport, Vec<String>)> {
    let sanitized = InputSanitizer::new()
        .sanitize(code, language)
        .context("Input rejected by sanitizer")?;
    let scanner = SecurityScanner::new((&config.sandbox).into());
    Ok((scanner.report(&sanitized.code, language), sanitized.warnings))
}

fn cmd_scan(config: &PlatformConfig, code: &str, language: Language, json: bool) -> Result<ExitCode> {
    let (report, warnings) = scan(config, code, language)?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{}: risk score {:.1}, {} violation(s)",
            if report.blocked { "BLOCKED" } else { "passed" },
            report.risk_score,
            report.violations.len()
        );
        if let Some(reason) = &report.reason {
            println!("reason: {reason}");
        }
        for v in &report.violations {
            let at = v
                .location
                .as_ref()
                .map(|l| format!("{}:{}", l.line, l.column))
                .unwrap_or_default();
            println!(
                "  {at:>7} [{}] {} {}",
                v.threat_level, v.violation_type, v.description
            );
        }
        for warning in &warnings {
            println!("warning: {warning}");
        }
    }
    Ok(if report.blocked {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// One request per non-blank line.
fn read_requests(path: &Path) -> Result<Vec<ExecutionRequest>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read requests file: {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<ExecutionRequest>(line)
                .with_context(|| format!("Invalid request on line {}", idx + 1))
        })
        .collect()
}

async fn cmd_batch(config: PlatformConfig, path: &Path) -> Result<ExitCode> {
    let requests = read_requests(path)?;

    let orchestrator =
        SandboxOrchestrator::from_config(config).context("Failed to build sandbox")?;
    info!(count = requests.len(), "executing batch");
    let responses = orchestrator.execute_batch(requests).await;

    for response in &responses {
        println!("{}", serde_json::to_string(response)?);
    }
    let failed = responses.iter().filter(|r| !r.success).count();
    eprintln!(
        "{} request(s): {} succeeded, {} failed",
        responses.len(),
        responses.len() - failed,
        failed
    );
    orchestrator.flush_metrics();
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_config(config: &PlatformConfig, json: bool) -> Result<ExitCode> {
    if json {
        print_json(config)?;
    } else {
        print!(
            "{}",
            toml::to_string_pretty(config).context("Failed to render config as TOML")?
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_language_inferred_from_extension() {
        assert_eq!(
            resolve_language(Path::new("job/main.py"), None).unwrap(),
            Language::Python
        );
        assert_eq!(
            resolve_language(Path::new("x.txt"), Some(Language::Go)).unwrap(),
            Language::Go
        );
        assert!(resolve_language(Path::new("README"), None).is_err());
    }

    #[test]
    fn test_execution_type_parser_accepts_both_spellings() {
        assert_eq!(
            parse_execution_type("performance-test").unwrap(),
            ExecutionType::PerformanceTest
        );
        assert_eq!(
            parse_execution_type("security_scan").unwrap(),
            ExecutionType::SecurityScan
        );
        assert!(parse_execution_type("deploy").is_err());
    }

    #[test]
    fn test_run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "codebox", "run", "hello.py", "--type", "test", "--timeout", "10", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                execution_type,
                timeout,
                language,
                ..
            } => {
                assert_eq!(execution_type, ExecutionType::Test);
                assert_eq!(timeout, 10);
                assert!(language.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&PlatformConfig::default()).unwrap();
        let parsed = PlatformConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.sandbox, PlatformConfig::default().sandbox);
    }

    #[test]
    fn test_scan_flags_blocked_code() {
        let config = PlatformConfig::default();
        let (report, _) = scan(&config, "import os\nos.system('id')", Language::Python).unwrap();
        assert!(report.blocked);
        let (clean, _) = scan(&config, "print(1 + 1)", Language::Python).unwrap();
        assert!(!clean.blocked);
        assert!(scan(&config, "   ", Language::Python).is_err());
    }

    #[test]
    fn test_batch_file_skips_blank_lines_and_names_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.jsonl");
        std::fs::write(
            &path,
            "{\"code\":\"print(1)\",\"language\":\"python\"}\n\n{\"code\":\"console.log(2)\",\"language\":\"javascript\"}\n",
        )
        .unwrap();
        let requests = read_requests(&path).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].language, Language::Javascript);

        std::fs::write(&path, "{\"code\":\"print(1)\",\"language\":\"python\"}\nnope\n").unwrap();
        let err = read_requests(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_config_file_is_loaded_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codebox.toml");
        let mut config = PlatformConfig::default();
        config.sandbox.max_execution_time = 12;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.sandbox.max_execution_time, 12);
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
