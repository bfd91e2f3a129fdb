//! Runtime policing of a child process.
//!
//! [`sample`] reads `/proc/<pid>` (RSS, CPU ticks, open descriptors) and
//! returns `None` on platforms without procfs or once the process is gone.
//! [`ResourceMonitor::observe`] turns successive samples into a kill
//! verdict; it does no I/O so the policy can be exercised directly.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::MonitorConfig;

/// Kernel clock ticks per second for `/proc/<pid>/stat` times. 100 on every
/// mainstream Linux configuration.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// One observation of the child.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSample {
    pub rss_mb: f64,
    /// utime + stime, in clock ticks.
    pub cpu_ticks: u64,
    pub open_paths: Vec<PathBuf>,
}

/// Why the monitor wants the process killed.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    MemoryLimit { rss_mb: f64, limit_mb: u64 },
    CpuSpike { percent: f64, samples: u32 },
    MemoryGrowth { grew_mb: f64 },
    RestrictedPath(PathBuf),
}

impl Termination {
    /// Limit breaches as opposed to suspicious behaviour.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, Termination::MemoryLimit { .. })
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::MemoryLimit { rss_mb, limit_mb } => {
                write!(f, "memory limit exceeded: {rss_mb:.1} MB > {limit_mb} MB")
            }
            Termination::CpuSpike { percent, samples } => write!(
                f,
                "sustained CPU usage {percent:.0}% over {samples} consecutive samples"
            ),
            Termination::MemoryGrowth { grew_mb } => {
                write!(f, "memory grew by {grew_mb:.1} MB between samples")
            }
            Termination::RestrictedPath(path) => {
                write!(f, "opened restricted path {}", path.display())
            }
        }
    }
}

/// Read the current state of `pid` from procfs.
#[cfg(target_os = "linux")]
pub fn sample(pid: u32) -> Option<ProcessSample> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    let status = std::fs::read_to_string(proc_dir.join("status")).ok()?;
    let stat = std::fs::read_to_string(proc_dir.join("stat")).ok()?;
    let rss_kb = parse_vm_rss_kb(&status).unwrap_or(0);
    let cpu_ticks = parse_cpu_ticks(&stat).unwrap_or(0);

    let open_paths = std::fs::read_dir(proc_dir.join("fd"))
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| std::fs::read_link(e.path()).ok())
                .filter(|p| p.is_absolute())
                .collect()
        })
        .unwrap_or_default();

    Some(ProcessSample {
        rss_mb: rss_kb as f64 / 1024.0,
        cpu_ticks,
        open_paths,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn sample(_pid: u32) -> Option<ProcessSample> {
    None
}

/// `VmRSS:   1234 kB` from `/proc/<pid>/status`.
pub(crate) fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// utime + stime (fields 14 and 15) from `/proc/<pid>/stat`. The command
/// name may contain spaces, so fields are counted after the closing paren.
pub(crate) fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // after_comm starts at field 3 (state).
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Stateful verdicts over a sample stream.
#[derive(Debug)]
pub struct ResourceMonitor {
    config: MonitorConfig,
    max_memory_mb: u64,
    previous: Option<(Instant, ProcessSample)>,
    spike_run: u32,
    peak_rss_mb: f64,
    peak_cpu_percent: f64,
    cpu_total: f64,
    cpu_samples: u32,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, max_memory_mb: u64) -> Self {
        Self {
            config,
            max_memory_mb,
            previous: None,
            spike_run: 0,
            peak_rss_mb: 0.0,
            peak_cpu_percent: 0.0,
            cpu_total: 0.0,
            cpu_samples: 0,
        }
    }

    /// Fold in a sample taken at `at`. Returns a verdict when the process
    /// must be terminated.
    pub fn observe(&mut self, sample: ProcessSample, at: Instant) -> Option<Termination> {
        self.peak_rss_mb = self.peak_rss_mb.max(sample.rss_mb);

        if sample.rss_mb > self.max_memory_mb as f64 {
            return Some(Termination::MemoryLimit {
                rss_mb: sample.rss_mb,
                limit_mb: self.max_memory_mb,
            });
        }

        let mut verdict = None;
        if let Some((prev_at, prev)) = &self.previous {
            let wall = at.saturating_duration_since(*prev_at);
            if wall > Duration::ZERO {
                let ticks = sample.cpu_ticks.saturating_sub(prev.cpu_ticks) as f64;
                let percent = ticks / CLOCK_TICKS_PER_SEC / wall.as_secs_f64() * 100.0;
                self.peak_cpu_percent = self.peak_cpu_percent.max(percent);
                self.cpu_total += percent;
                self.cpu_samples += 1;

                if self.config.behavior_monitoring {
                    if percent >= self.config.cpu_spike_percent {
                        self.spike_run += 1;
                    } else {
                        self.spike_run = 0;
                    }
                    let grew = sample.rss_mb - prev.rss_mb;
                    if self.spike_run >= self.config.cpu_spike_samples.max(1) {
                        verdict = Some(Termination::CpuSpike {
                            percent,
                            samples: self.spike_run,
                        });
                    } else if grew > self.config.memory_growth_mb {
                        verdict = Some(Termination::MemoryGrowth { grew_mb: grew });
                    }
                }
            }
        }

        if verdict.is_none() && self.config.behavior_monitoring {
            verdict = sample
                .open_paths
                .iter()
                .find(|p| {
                    self.config
                        .restricted_paths
                        .iter()
                        .any(|prefix| p.starts_with(prefix))
                })
                .map(|p| Termination::RestrictedPath(p.clone()));
        }

        self.previous = Some((at, sample));
        verdict
    }

    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_rss_mb
    }

    pub fn peak_cpu_percent(&self) -> f64 {
        self.peak_cpu_percent
    }

    pub fn average_cpu_percent(&self) -> f64 {
        if self.cpu_samples == 0 {
            0.0
        } else {
            self.cpu_total / self.cpu_samples as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ResourceMonitor {
        let config = MonitorConfig {
            cpu_spike_samples: 3,
            ..MonitorConfig::default()
        };
        ResourceMonitor::new(config, 256)
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_parse_proc_fields() {
        let status = "Name:\tpython3\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss_kb(status), Some(2048));

        let stat = "4242 (my prog) R 1 4242 4242 0 -1 4194304 100 0 0 0 37 5 0 0 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat), Some(42));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[test]
    fn test_memory_limit_verdict() {
        let mut m = monitor();
        let base = Instant::now();
        let over = ProcessSample {
            rss_mb: 300.0,
            ..Default::default()
        };
        let verdict = m.observe(over, base).unwrap();
        assert!(verdict.is_memory_limit());
        assert_eq!(m.peak_memory_mb(), 300.0);
    }

    #[test]
    fn test_cpu_spike_needs_consecutive_samples() {
        let mut m = monitor();
        let base = Instant::now();
        // 10 ticks per 100 ms = 100% of one core.
        let mut ticks = 0;
        assert!(m.observe(ProcessSample::default(), base).is_none());
        for i in 1..=2 {
            ticks += 10;
            let s = ProcessSample {
                cpu_ticks: ticks,
                ..Default::default()
            };
            assert!(m.observe(s, at(base, i * 100)).is_none());
        }
        ticks += 10;
        let s = ProcessSample {
            cpu_ticks: ticks,
            ..Default::default()
        };
        let verdict = m.observe(s, at(base, 300)).unwrap();
        assert!(matches!(verdict, Termination::CpuSpike { samples: 3, .. }));
        assert!(m.peak_cpu_percent() >= 99.0);
    }

    #[test]
    fn test_idle_sample_resets_spike_run() {
        let mut m = monitor();
        let base = Instant::now();
        let ticks = [0, 10, 20, 20, 30, 40];
        for (i, t) in ticks.iter().enumerate() {
            let s = ProcessSample {
                cpu_ticks: *t,
                ..Default::default()
            };
            assert!(m.observe(s, at(base, i as u64 * 100)).is_none());
        }
    }

    #[test]
    fn test_memory_growth_and_restricted_path() {
        let mut m = monitor();
        let base = Instant::now();
        m.observe(
            ProcessSample {
                rss_mb: 10.0,
                ..Default::default()
            },
            base,
        );
        let mut strict = ResourceMonitor::new(
            MonitorConfig {
                memory_growth_mb: 50.0,
                ..MonitorConfig::default()
            },
            1024,
        );
        strict.observe(ProcessSample::default(), base);
        let grew = strict.observe(
            ProcessSample {
                rss_mb: 120.0,
                ..Default::default()
            },
            at(base, 100),
        );
        assert!(matches!(grew, Some(Termination::MemoryGrowth { .. })));

        let opened = m.observe(
            ProcessSample {
                rss_mb: 10.0,
                open_paths: vec![PathBuf::from("/etc/shadow")],
                ..Default::default()
            },
            at(base, 100),
        );
        assert_eq!(
            opened,
            Some(Termination::RestrictedPath(PathBuf::from("/etc/shadow")))
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_self() {
        let s = sample(std::process::id()).unwrap();
        assert!(s.rss_mb > 0.0);
    }
}
