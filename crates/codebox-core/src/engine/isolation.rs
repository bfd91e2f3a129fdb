//! Isolation profiles.
//!
//! Only process-level controls are enforced: a cleared environment with a
//! short allow-list, a private working directory, and the monitor's limits.
//! The syscall allow-list is descriptive. It is exported for operators who
//! run the engine under an external seccomp-capable runtime and is not
//! applied by the engine itself.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::config::{IsolationLevel, SandboxConfig};
use crate::language::Language;

const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const ALLOWED_SYSCALLS: &[&str] = &[
    "read", "write", "open", "openat", "close", "stat", "fstat", "lstat", "newfstatat", "poll",
    "lseek", "mmap", "mprotect", "munmap", "brk", "rt_sigaction", "rt_sigprocmask",
    "rt_sigreturn", "ioctl", "pread64", "pwrite64", "readv", "writev", "access", "pipe", "pipe2",
    "select", "sched_yield", "mremap", "madvise", "dup", "dup2", "dup3", "nanosleep",
    "clock_nanosleep", "getpid", "gettid", "clone", "clone3", "execve", "exit", "exit_group",
    "wait4", "uname", "fcntl", "getcwd", "readlink", "getuid", "getgid", "geteuid", "getegid",
    "arch_prctl", "futex", "set_tid_address", "set_robust_list", "rseq", "prlimit64",
    "getrandom", "clock_gettime", "gettimeofday", "sysinfo", "sigaltstack", "getdents64",
    "epoll_create1", "epoll_ctl", "epoll_wait", "eventfd2",
];

const NETWORK_SYSCALLS: &[&str] = &[
    "socket", "connect", "bind", "listen", "accept", "accept4", "sendto", "recvfrom",
    "sendmsg", "recvmsg", "getsockopt", "setsockopt", "getsockname", "getpeername", "shutdown",
];

const FILE_MUTATION_SYSCALLS: &[&str] = &[
    "mkdir", "mkdirat", "unlink", "unlinkat", "rename", "renameat", "ftruncate", "fsync",
];

/// Effective isolation for one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolationProfile {
    pub requested: IsolationLevel,
    /// What is actually applied.
    pub effective: IsolationLevel,
    pub network_access: bool,
    pub file_system_access: bool,
    pub allowed_syscalls: Vec<&'static str>,
    pub warnings: Vec<String>,
}

impl IsolationProfile {
    pub fn for_config(config: &SandboxConfig) -> Self {
        let mut warnings = Vec::new();
        let effective = match config.isolation_level {
            IsolationLevel::Container => {
                let msg = "container isolation is not available; falling back to process isolation";
                warn!("{msg}");
                warnings.push(msg.to_string());
                IsolationLevel::Process
            }
            IsolationLevel::Thread | IsolationLevel::Process => IsolationLevel::Process,
        };

        let mut allowed_syscalls = ALLOWED_SYSCALLS.to_vec();
        if config.enable_network_access {
            allowed_syscalls.extend_from_slice(NETWORK_SYSCALLS);
        }
        if config.enable_file_system_access {
            allowed_syscalls.extend_from_slice(FILE_MUTATION_SYSCALLS);
        }

        Self {
            requested: config.isolation_level,
            effective,
            network_access: config.enable_network_access,
            file_system_access: config.enable_file_system_access,
            allowed_syscalls,
            warnings,
        }
    }

    /// The complete child environment: the allow-list for `work_dir` and
    /// `language`, then the caller's variables.
    ///
    /// Caller variables are validated by the sanitizer, which rejects the
    /// names set here.
    pub fn environment(
        &self,
        work_dir: &Path,
        language: Language,
        extra: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let dir = work_dir.display().to_string();
        let mut env = BTreeMap::from([
            ("PATH".to_string(), SAFE_PATH.to_string()),
            ("HOME".to_string(), dir.clone()),
            ("TMPDIR".to_string(), dir.clone()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("LC_ALL".to_string(), "C.UTF-8".to_string()),
        ]);
        match language {
            Language::Python => {
                env.insert("PYTHONDONTWRITEBYTECODE".into(), "1".into());
                env.insert("PYTHONUNBUFFERED".into(), "1".into());
            }
            Language::Go => {
                env.insert("GOCACHE".into(), format!("{dir}/.gocache"));
                env.insert("GOPATH".into(), format!("{dir}/.gopath"));
                env.insert("GOFLAGS".into(), "-mod=mod".into());
            }
            Language::Csharp => {
                env.insert("DOTNET_CLI_TELEMETRY_OPTOUT".into(), "1".into());
            }
            _ => {}
        }
        for (key, value) in extra {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        env
    }

    /// seccomp-style description of the allow-list.
    pub fn seccomp_profile(&self) -> serde_json::Value {
        json!({
            "defaultAction": "SCMP_ACT_ERRNO",
            "architectures": ["SCMP_ARCH_X86_64", "SCMP_ARCH_AARCH64"],
            "syscalls": [{
                "names": self.allowed_syscalls,
                "action": "SCMP_ACT_ALLOW",
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_falls_back_to_process() {
        let config = SandboxConfig {
            isolation_level: IsolationLevel::Container,
            ..SandboxConfig::default()
        };
        let profile = IsolationProfile::for_config(&config);
        assert_eq!(profile.effective, IsolationLevel::Process);
        assert_eq!(profile.requested, IsolationLevel::Container);
        assert_eq!(profile.warnings.len(), 1);
    }

    #[test]
    fn test_network_syscalls_follow_config() {
        let closed = IsolationProfile::for_config(&SandboxConfig::default());
        assert!(!closed.allowed_syscalls.contains(&"connect"));

        let open = IsolationProfile::for_config(&SandboxConfig {
            enable_network_access: true,
            ..SandboxConfig::default()
        });
        assert!(open.allowed_syscalls.contains(&"connect"));
        let profile = open.seccomp_profile();
        assert_eq!(profile["defaultAction"], "SCMP_ACT_ERRNO");
    }

    #[test]
    fn test_environment_is_restricted_and_not_overridable() {
        let profile = IsolationProfile::for_config(&SandboxConfig::default());
        let extra = BTreeMap::from([
            ("MODE".to_string(), "ci".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);
        let env = profile.environment(Path::new("/tmp/box"), Language::Python, &extra);
        assert_eq!(env["HOME"], "/tmp/box");
        assert_eq!(env["MODE"], "ci");
        assert_eq!(env["PYTHONDONTWRITEBYTECODE"], "1");
        assert!(!env.contains_key("LD_PRELOAD"));
    }
}
