use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::ffi::syscall;

/// Profiler options.
///
/// Everything has a default; the only hard requirement is a target, either
/// at least one pid or a program to launch.
#[derive(Clone, Debug)]
pub struct Opts {
    /// Processes to attach to.
    pub pids: Vec<u32>,
    /// Program to launch (mutually additive with `pids`).
    pub program: Option<PathBuf>,
    pub program_args: Vec<String>,
    /// Sampler library to preload into a launched program.
    pub sampler_lib: Option<PathBuf>,

    /// Stop after this long; `None` runs until every target exits.
    pub duration: Option<Duration>,
    /// Wait this long after enabling before sampling matters.
    pub delay: Duration,
    /// Sampling interval, milliseconds.
    pub sampling_interval_ms: f64,
    /// Orchestrator poll cadence.
    pub check_delta: Duration,

    /// Cap on waiting for intermediate files to stop growing.
    pub file_stale_timeout: Duration,
    /// Discovery cap for the runtime channel (fatal on expiry).
    pub discovery_timeout: Duration,
    /// Discovery cap for the sampler channel (silently optional).
    pub sampler_discovery_timeout: Duration,

    /// Run the rundown session after the main ones stop.
    pub rundown: bool,
    pub keep_intermediates: bool,
    /// Threads above this much CPU (ms) start visible in the viewer.
    pub min_visible_cpu_ms: f64,

    /// Output directory; current directory when unset.
    pub output_dir: Option<PathBuf>,
    /// Output base name; computed from target and wall time when unset.
    pub output_base: Option<String>,
    /// Extra symbol search path, recorded for downstream tooling.
    pub symbol_path: Option<PathBuf>,

    /// Where to look for diagnostic endpoints; the OS temp directory when
    /// unset. Exists for embedding and tests.
    pub diagnostic_dir: Option<PathBuf>,
    /// Event-pipe circular buffer, MB.
    pub buffer_mb: u32,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            pids: Vec::new(),
            program: None,
            program_args: Vec::new(),
            sampler_lib: None,
            duration: None,
            delay: Duration::ZERO,
            sampling_interval_ms: 1.0,
            check_delta: Duration::from_millis(500),
            file_stale_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(1),
            sampler_discovery_timeout: Duration::from_millis(500),
            rundown: true,
            keep_intermediates: false,
            min_visible_cpu_ms: 10.0,
            output_dir: None,
            output_base: None,
            symbol_path: None,
            diagnostic_dir: None,
            buffer_mb: 512,
        }
    }
}

impl Opts {
    /// Validates before anything opens. Fatal findings only.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pids.is_empty() && self.program.is_none() {
            return Err(ConfigError::NoTarget);
        }
        for &pid in &self.pids {
            if !syscall::process_alive(pid) {
                return Err(ConfigError::NoSuchProcess(pid));
            }
        }
        if let Some(program) = &self.program {
            if !is_executable(program) {
                return Err(ConfigError::NotExecutable(program.clone()));
            }
        }
        if let Some(duration) = self.duration {
            if duration.is_zero() {
                return Err(ConfigError::NonPositiveDuration);
            }
        }
        if self.sampling_interval_ms < 1.0 {
            return Err(ConfigError::IntervalTooSmall);
        }
        Ok(())
    }
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn needs_a_target() {
        let opts = Opts::default();
        assert!(matches!(opts.validate(), Err(ConfigError::NoTarget)));
    }

    #[test]
    fn rejects_a_dead_pid() {
        let mut opts = Opts::default();
        // Pid over the usual pid_max; never alive.
        opts.pids = vec![0x3FFF_FFFF];
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::NoSuchProcess(_))
        ));
    }

    #[test]
    fn rejects_a_non_executable_program() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "not a program").unwrap();
        let mut opts = Opts::default();
        opts.program = Some(path);
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::NotExecutable(_))
        ));
    }

    #[test]
    fn rejects_zero_duration_and_tiny_intervals() {
        let mut opts = Opts::default();
        opts.pids = vec![std::process::id()];
        opts.duration = Some(Duration::ZERO);
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::NonPositiveDuration)
        ));

        opts.duration = Some(Duration::from_secs(1));
        opts.sampling_interval_ms = 0.25;
        assert!(matches!(opts.validate(), Err(ConfigError::IntervalTooSmall)));
    }

    #[test]
    fn accepts_the_current_process() {
        let mut opts = Opts::default();
        opts.pids = vec![std::process::id()];
        assert!(opts.validate().is_ok());
    }
}
