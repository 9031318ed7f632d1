//! Resource limit policy: turns the engine configuration into limits that are
//! enforced on a child process.
//!
//! Memory and CPU seconds are applied as rlimits right before `exec`. Memory is
//! bounded through the data segment, which counts writable private mappings
//! but not reserved address space, so runtimes that reserve large ranges up
//! front still start. The wall clock is enforced by the caller, which kills
//! the process group once the deadline passes. A limit that cannot be applied is dropped with a warning.

use std::time::Duration;

use crate::config::EngineConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    /// Fractional CPUs, as understood by container runtimes
    pub cpu_limit: Option<f32>,
    pub wall_clock: Duration,
    pub compile_wall_clock: Duration,
    pub max_output_bytes: usize,
}

impl ResourceLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            memory_bytes: Some(config.memory_limit.0).filter(|b| *b > 0),
            cpu_limit: Some(config.cpu_limit).filter(|c| *c > 0.0),
            wall_clock: Duration::from_millis(config.max_execution_time_ms),
            compile_wall_clock: Duration::from_millis(config.compile_timeout_ms()),
            max_output_bytes: config.max_stdout_bytes,
        }
    }

    /// CPU seconds granted to one process: the wall clock scaled by the CPU
    /// share, rounded up so a short timeout never becomes zero.
    pub fn cpu_seconds(&self, wall_clock: Duration) -> Option<u64> {
        let share = self.cpu_limit?;
        let secs = (wall_clock.as_secs_f64() * share as f64).ceil() as u64;
        Some(secs.max(1))
    }

    /// Memory limit in whole MiB, the unit VM configuration expects
    pub fn memory_mib(&self) -> Option<u64> {
        self.memory_bytes.map(|b| (b / (1024 * 1024)).max(1))
    }
}

/// Limits resolved for one process, together with whatever could not be applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enforcement {
    pub data_segment: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub warnings: Vec<String>,
}

impl Enforcement {
    /// Checks each requested limit against the current hard limits. A request
    /// above the hard limit cannot be raised by an unprivileged process, so it
    /// is clamped and reported.
    pub fn resolve(limits: &ResourceLimits, wall_clock: Duration) -> Self {
        let mut enforcement = Self::default();

        #[cfg(unix)]
        {
            enforcement.data_segment = limits
                .memory_bytes
                .map(|b| Rlimit::Data.clamp(b, &mut enforcement.warnings));
            enforcement.cpu_seconds = limits
                .cpu_seconds(wall_clock)
                .map(|s| Rlimit::Cpu.clamp(s, &mut enforcement.warnings));
        }

        #[cfg(not(unix))]
        {
            let _ = wall_clock;
            if limits.memory_bytes.is_some() || limits.cpu_limit.is_some() {
                enforcement
                    .warnings
                    .push("rlimits are not supported on this platform".to_string());
            }
        }

        for warning in &enforcement.warnings {
            log::warn!("Resource limit not fully applied: {warning}");
        }
        enforcement
    }

    /// Installs the limits on `cmd` so they apply in the child before `exec`.
    ///
    /// The child is also moved into its own process group so a timeout can
    /// kill everything it spawned.
    #[cfg(unix)]
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        let data_segment = self.data_segment;
        let cpu_seconds = self.cpu_seconds;

        // SAFETY: the closure only calls async-signal-safe libc functions and
        // does not allocate.
        unsafe {
            cmd.pre_exec(move || {
                libc::setpgid(0, 0);
                Rlimit::Core.set(0, 0);
                if let Some(bytes) = data_segment {
                    Rlimit::Data.set(bytes, bytes);
                }
                if let Some(secs) = cpu_seconds {
                    // Soft limit delivers SIGXCPU, the hard limit one second later SIGKILL
                    Rlimit::Cpu.set(secs, secs + 1);
                }
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    pub fn apply(&self, _cmd: &mut tokio::process::Command) {}
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
enum Rlimit {
    Data,
    Cpu,
    Core,
}

#[cfg(unix)]
impl Rlimit {
    fn name(self) -> &'static str {
        match self {
            Self::Data => "memory",
            Self::Cpu => "cpu",
            Self::Core => "core",
        }
    }

    fn get(self) -> std::io::Result<libc::rlimit> {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let rc = unsafe {
            match self {
                Self::Data => libc::getrlimit(libc::RLIMIT_DATA, &mut current),
                Self::Cpu => libc::getrlimit(libc::RLIMIT_CPU, &mut current),
                Self::Core => libc::getrlimit(libc::RLIMIT_CORE, &mut current),
            }
        };
        if rc == 0 {
            Ok(current)
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    /// Only called between fork and exec, result is ignored there
    fn set(self, soft: u64, hard: u64) {
        let limit = libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        };
        unsafe {
            match self {
                Self::Data => libc::setrlimit(libc::RLIMIT_DATA, &limit),
                Self::Cpu => libc::setrlimit(libc::RLIMIT_CPU, &limit),
                Self::Core => libc::setrlimit(libc::RLIMIT_CORE, &limit),
            };
        }
    }

    fn clamp(self, requested: u64, warnings: &mut Vec<String>) -> u64 {
        let name = self.name();
        let current = match self.get() {
            Ok(current) => current,
            Err(e) => {
                warnings.push(format!("{name}: unable to read current limit: {e}"));
                return requested;
            }
        };

        let hard = current.rlim_max as u64;
        if current.rlim_max != libc::RLIM_INFINITY && requested > hard {
            warnings.push(format!(
                "{name}: requested {requested} exceeds hard limit {hard}, clamped"
            ));
            hard
        } else {
            requested
        }
    }
}

/// Sends SIGKILL to the process group led by `pid`
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to kill process group {pid}: {err}");
        }
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteSize;

    fn limits() -> ResourceLimits {
        let config = EngineConfig {
            memory_limit: ByteSize(256 * 1024 * 1024),
            cpu_limit: 0.5,
            max_execution_time_ms: 3000,
            ..EngineConfig::default()
        };
        ResourceLimits::from_config(&config)
    }

    #[test]
    fn test_limits_from_config() {
        let limits = limits();
        assert_eq!(limits.memory_bytes, Some(256 * 1024 * 1024));
        assert_eq!(limits.memory_mib(), Some(256));
        assert_eq!(limits.wall_clock, Duration::from_secs(3));
        assert_eq!(limits.compile_wall_clock, Duration::from_secs(6));
    }

    #[test]
    fn test_cpu_seconds_scale_with_share() {
        let limits = limits();
        assert_eq!(limits.cpu_seconds(Duration::from_secs(3)), Some(2));
        assert_eq!(limits.cpu_seconds(Duration::from_millis(100)), Some(1));

        let unlimited = ResourceLimits {
            cpu_limit: None,
            ..limits
        };
        assert_eq!(unlimited.cpu_seconds(Duration::from_secs(3)), None);
    }

    #[test]
    fn test_zero_values_disable_limits() {
        let config = EngineConfig {
            memory_limit: ByteSize(0),
            cpu_limit: 0.0,
            ..EngineConfig::default()
        };
        let limits = ResourceLimits::from_config(&config);
        assert_eq!(limits.memory_bytes, None);
        assert_eq!(limits.cpu_limit, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_keeps_reasonable_limits() {
        let limits = limits();
        let enforcement = Enforcement::resolve(&limits, limits.wall_clock);
        assert!(enforcement.data_segment.is_some());
        assert!(enforcement.cpu_seconds.is_some());
    }
}
