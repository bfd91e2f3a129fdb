//! Subprocess execution engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{MonitorConfig, PlatformConfig, SandboxConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::language::CommandSpec;
use crate::request::ExecutionType;

use super::isolation::IsolationProfile;
use super::monitor::{self, ResourceMonitor, Termination};
use super::{parse_test_results, CodeExecutor, ExecutionJob, ExecutionResult};

/// Grace period for pipe readers after the child has exited.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Runs jobs as local subprocesses in throwaway working directories.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    sandbox: SandboxConfig,
    monitor: MonitorConfig,
}

/// How one process invocation ended.
enum Exit {
    Status(ExitStatus),
    TimedOut,
    Killed(Termination),
}

struct ProcessOutcome {
    exit: Exit,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
    peak_memory_mb: f64,
    avg_cpu_percent: f64,
}

impl ExecutionEngine {
    pub fn new(sandbox: SandboxConfig, monitor: MonitorConfig) -> Self {
        Self { sandbox, monitor }
    }

    pub fn from_config(config: &PlatformConfig) -> Self {
        Self::new(config.sandbox.clone(), config.monitor.clone())
    }

    pub fn sandbox_config(&self) -> &SandboxConfig {
        &self.sandbox
    }

    fn work_dir(&self, execution_id: &str) -> SandboxResult<tempfile::TempDir> {
        let prefix = format!("codebox-{}-", short_id(execution_id));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.sandbox.sandbox_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        dir.map_err(|e| SandboxError::Infrastructure(format!("cannot create sandbox dir: {e}")))
    }

    /// Run `job` to completion under the configured limits.
    pub async fn run(&self, job: &ExecutionJob) -> SandboxResult<ExecutionResult> {
        let started = Instant::now();
        let limit = Duration::from_secs(self.sandbox.max_execution_time);
        let budget = job.timeout.min(limit);
        let deadline = started + budget;

        let dir = self.work_dir(&job.execution_id)?;
        let source = dir.path().join(job.language.source_file_name());
        tokio::fs::write(&source, job.code.as_bytes()).await?;

        let profile = IsolationProfile::for_config(&self.sandbox);
        let env = profile.environment(dir.path(), job.language, &job.environment);
        let plan = job.language.build_command();
        let mut result = ExecutionResult {
            warnings: profile.warnings.clone(),
            ..Default::default()
        };

        debug!(
            execution_id = %job.execution_id,
            language = %job.language,
            dir = %dir.path().display(),
            budget_ms = budget.as_millis() as u64,
            "engine: starting"
        );

        if let Some(compile) = &plan.compile {
            let outcome = self
                .run_process(compile, dir.path(), &env, None, deadline, false)
                .await?;
            let compiled = matches!(&outcome.exit, Exit::Status(s) if s.success());
            if !compiled {
                self.fill(&mut result, outcome, limit);
                result.execution_time = started.elapsed().as_secs_f64();
                if !result.timeout_occurred {
                    result.stderr = format!("compilation failed\n{}", result.stderr);
                }
                self.finish_dir(dir);
                return Ok(result);
            }
        }

        let outcome = self
            .run_process(
                &plan.run,
                dir.path(),
                &env,
                job.input_data.as_deref(),
                deadline,
                true,
            )
            .await?;
        self.fill(&mut result, outcome, limit);
        result.execution_time = started.elapsed().as_secs_f64();
        if result.execution_time > limit.as_secs_f64() {
            result.timeout_occurred = true;
        }

        result.warnings.extend(self.audit_files(dir.path(), job));
        if job.execution_type == ExecutionType::Test {
            let (passed, failed) = parse_test_results(&result.stdout, &result.stderr);
            result.passed_tests = passed;
            result.failed_tests = failed;
        }

        self.finish_dir(dir);
        info!(
            execution_id = %job.execution_id,
            exit_code = ?result.exit_code,
            elapsed_ms = (result.execution_time * 1000.0) as u64,
            timeout = result.timeout_occurred,
            "engine: finished"
        );
        Ok(result)
    }

    fn fill(&self, result: &mut ExecutionResult, outcome: ProcessOutcome, limit: Duration) {
        result.stdout = String::from_utf8_lossy(&outcome.stdout).into_owned();
        result.stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();
        result.output_truncated = outcome.truncated;
        result.memory_usage_mb = result.memory_usage_mb.max(outcome.peak_memory_mb);
        result.cpu_usage_percent = outcome.avg_cpu_percent;
        if outcome.truncated {
            result.warnings.push(format!(
                "output truncated to {} bytes",
                self.monitor.max_output_bytes
            ));
        }
        match outcome.exit {
            Exit::Status(status) => result.exit_code = status.code(),
            Exit::TimedOut => {
                result.timeout_occurred = true;
                result.termination_reason =
                    Some(format!("execution exceeded {} s", limit.as_secs()));
            }
            Exit::Killed(termination) => {
                if termination.is_memory_limit() {
                    result.memory_limit_exceeded = true;
                } else {
                    result.security_violation_detected = true;
                }
                result.termination_reason = Some(termination.to_string());
            }
        }
    }

    /// Spawn `spec` in `dir` and police it until it exits or `deadline`.
    async fn run_process(
        &self,
        spec: &CommandSpec,
        dir: &Path,
        env: &BTreeMap<String, String>,
        stdin: Option<&str>,
        deadline: Instant,
        monitored: bool,
    ) -> SandboxResult<ProcessOutcome> {
        let program = resolve_program(&spec.program, dir);
        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .current_dir(dir)
            .env_clear()
            .envs(env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The child leads its own group so descendants die with it.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(|e| {
            SandboxError::Infrastructure(format!("failed to start {}: {e}", spec.program))
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let input = input.as_bytes().to_vec();
            tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is expected.
                let _ = pipe.write_all(&input).await;
            });
        }

        let cap = self.monitor.max_output_bytes;
        let stdout = spawn_reader(child.stdout.take(), cap);
        let stderr = spawn_reader(child.stderr.take(), cap);

        let mut resources = ResourceMonitor::new(self.monitor.clone(), self.sandbox.max_memory_mb);
        let exit = self
            .police(&mut child, &mut resources, deadline, monitored)
            .await?;

        let (stdout, out_truncated) = collect_reader(stdout).await;
        let (stderr, err_truncated) = collect_reader(stderr).await;

        Ok(ProcessOutcome {
            exit,
            stdout,
            stderr,
            truncated: out_truncated || err_truncated,
            peak_memory_mb: resources.peak_memory_mb(),
            avg_cpu_percent: resources.average_cpu_percent(),
        })
    }

    async fn police(
        &self,
        child: &mut Child,
        resources: &mut ResourceMonitor,
        deadline: Instant,
        monitored: bool,
    ) -> SandboxResult<Exit> {
        let pid = child.id();
        let mut ticker = tokio::time::interval(self.monitor.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);

        let exit = loop {
            tokio::select! {
                status = child.wait() => break Exit::Status(status?),
                _ = &mut timeout => break Exit::TimedOut,
                _ = ticker.tick(), if monitored => {
                    let Some(sample) = pid.and_then(monitor::sample) else {
                        continue;
                    };
                    if let Some(termination) = resources.observe(sample, Instant::now()) {
                        warn!(pid = ?pid, reason = %termination, "engine: terminating process");
                        break Exit::Killed(termination);
                    }
                }
            }
        };

        // Descendants may outlive a child that exited on its own too.
        if let Some(pgid) = pid {
            kill_process_group(pgid);
        }
        if !matches!(exit, Exit::Status(_)) {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "engine: kill after exit");
            }
            child.wait().await?;
        }
        Ok(exit)
    }

    /// Report files the program left behind that break the file policy.
    fn audit_files(&self, dir: &Path, job: &ExecutionJob) -> Vec<String> {
        let mut warnings = Vec::new();
        let source_name = job.language.source_file_name();
        let mut total_bytes = 0u64;
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&current) else {
                continue;
            };
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                total_bytes += meta.len();
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == source_name || is_build_artifact(&name) {
                    continue;
                }
                let allowed = self
                    .sandbox
                    .allowed_file_extensions
                    .iter()
                    .any(|ext| name.ends_with(ext.as_str()));
                if !self.sandbox.enable_file_system_access {
                    warnings.push(format!("file written with file-system access disabled: {name}"));
                } else if !allowed {
                    warnings.push(format!("file with disallowed extension: {name}"));
                }
            }
        }
        let cap = self.sandbox.max_file_size_mb * 1024 * 1024;
        if total_bytes > cap {
            warnings.push(format!(
                "sandbox directory holds {total_bytes} bytes, above the {} MB limit",
                self.sandbox.max_file_size_mb
            ));
        }
        warnings
    }

    fn finish_dir(&self, dir: tempfile::TempDir) {
        if self.sandbox.cleanup_after_execution {
            if let Err(e) = dir.close() {
                warn!(error = %e, "engine: failed to remove sandbox dir");
            }
        } else {
            let kept = dir.keep();
            debug!(dir = %kept.display(), "engine: sandbox dir kept");
        }
    }
}

#[async_trait]
impl CodeExecutor for ExecutionEngine {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn execute(&self, job: &ExecutionJob) -> SandboxResult<ExecutionResult> {
        self.run(job).await
    }
}

fn short_id(execution_id: &str) -> &str {
    execution_id.get(..8).unwrap_or(execution_id)
}

/// `./main` refers to the sandbox directory, not the parent's cwd.
fn resolve_program(program: &str, dir: &Path) -> PathBuf {
    match program.strip_prefix("./") {
        Some(rest) => dir.join(rest),
        None => PathBuf::from(program),
    }
}

fn is_build_artifact(name: &str) -> bool {
    name == "main" || name == "main.exe" || name.ends_with(".class") || name.ends_with(".o")
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "engine: failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Bytes read from one pipe so far.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Captured>>;

fn lock_capture(capture: &SharedCapture) -> MutexGuard<'_, Captured> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

struct OutputReader {
    task: JoinHandle<()>,
    capture: SharedCapture,
}

fn spawn_reader<R>(pipe: Option<R>, cap: usize) -> Option<OutputReader>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|pipe| {
        let capture = SharedCapture::default();
        let task = tokio::spawn(read_capped(pipe, cap, capture.clone()));
        OutputReader { task, capture }
    })
}

/// Read to EOF keeping at most `cap` bytes; the rest is drained so the
/// child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut pipe: R, cap: usize, sink: SharedCapture) {
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut captured = lock_capture(&sink);
                let room = cap.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
}

/// Output of a reader task. After a grace period the reader is abandoned
/// and whatever it read so far is returned, flagged as incomplete.
async fn collect_reader(reader: Option<OutputReader>) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let complete = match tokio::time::timeout(READER_GRACE, &mut reader.task).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "engine: output reader failed");
            false
        }
        Err(_) => {
            reader.task.abort();
            warn!("engine: output pipe held open after exit; keeping partial output");
            false
        }
    };
    let mut captured = lock_capture(&reader.capture);
    (
        std::mem::take(&mut captured.bytes),
        captured.truncated || !complete,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(data: &'static [u8], cap: usize) -> (Vec<u8>, bool) {
        collect_reader(spawn_reader(Some(data), cap)).await
    }

    #[tokio::test]
    async fn test_read_capped_truncates_and_drains() {
        let data: &'static [u8] = Box::leak(vec![b'x'; 20_000].into_boxed_slice());
        let (kept, truncated) = read_all(data, 1000).await;
        assert_eq!(kept.len(), 1000);
        assert!(truncated);

        let (kept, truncated) = read_all(b"short", 1000).await;
        assert_eq!(kept, b"short");
        assert!(!truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_output_kept_when_pipe_stays_open() {
        let (mut writer, pipe) = tokio::io::duplex(64);
        writer.write_all(b"partial line\n").await.unwrap();

        let (kept, incomplete) = collect_reader(spawn_reader(Some(pipe), 1000)).await;
        assert_eq!(kept, b"partial line\n");
        assert!(incomplete);
        drop(writer);
    }

    #[test]
    fn test_finish_dir_keeps_or_removes_sandbox() {
        let kept = ExecutionEngine::new(
            SandboxConfig {
                cleanup_after_execution: false,
                ..SandboxConfig::default()
            },
            MonitorConfig::default(),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        kept.finish_dir(dir);
        assert!(path.is_dir());
        std::fs::remove_dir_all(&path).unwrap();

        let cleaned = ExecutionEngine::new(SandboxConfig::default(), MonitorConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        cleaned.finish_dir(dir);
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let engine = ExecutionEngine::new(SandboxConfig::default(), MonitorConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30 & echo started; wait".into()],
        };
        let started = Instant::now();
        let outcome = engine
            .run_process(
                &spec,
                dir.path(),
                &BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
                None,
                Instant::now() + Duration::from_millis(300),
                false,
            )
            .await
            .unwrap();

        assert!(matches!(outcome.exit, Exit::TimedOut));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout), "started\n");
        // The backgrounded sleep held stdout; killing the group closed it.
        assert!(!outcome.truncated);
        assert!(started.elapsed() < READER_GRACE + Duration::from_secs(1));
    }

    #[test]
    fn test_resolve_program_relative_to_sandbox() {
        let dir = Path::new("/tmp/box");
        assert_eq!(resolve_program("./main", dir), PathBuf::from("/tmp/box/main"));
        assert_eq!(resolve_program("python3", dir), PathBuf::from("python3"));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
