//! Orchestrator: the full profiling lifecycle.
//!
//! validate -> compute base name -> start target -> delay -> enable
//! sessions -> poll -> stop sessions -> wait for the intermediate files to
//! go stale -> rundown -> convert -> write. One cancellation token flows
//! through every blocking wait; the first cancel requests a graceful stop,
//! the second forces immediate termination.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::executor::block_on;
use tracing::{debug, info, warn};

use crate::config::Opts;
use crate::convert::{convert, ConvertOptions};
use crate::ffi::syscall;
use crate::profile::write::write_gz;
use crate::record::log::LogReader;
use crate::record::LogEvent;
use crate::session::{
    discover, rundown_providers, runtime_providers, sampler_providers, Session, SessionConfig,
};
use crate::{Error, Result};

#[cfg(test)]
mod test;

/// Two-level cancellation: level 1 asks for a graceful stop, level 2
/// forces immediate termination.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// First call requests a graceful stop; the second forces.
    pub fn cancel(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |level| {
                Some((level + 1).min(2))
            });
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) >= 1
    }

    pub fn is_forced(&self) -> bool {
        self.0.load(Ordering::Acquire) >= 2
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    /// `None` when cancelled before anything was worth writing.
    pub output_path: Option<PathBuf>,
    pub cancelled: bool,
}

type Progress = Box<dyn FnMut(&str) + Send>;

pub struct Profiler {
    opts: Opts,
    cancel: CancelToken,
    progress: Option<Progress>,
    /// External pause gate: polled until it returns true before profiling
    /// begins.
    should_start: Option<Box<dyn Fn() -> bool + Send>>,
}

struct Target {
    pid: u32,
    child: Option<Child>,
}

impl Target {
    fn alive(&mut self) -> bool {
        match &mut self.child {
            // try_wait also reaps, so an exited child does not linger as a
            // zombie that kill(0) would still see.
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => syscall::process_alive(self.pid),
        }
    }
}

struct SessionSet {
    pid: u32,
    clr: Session,
    sampler: Option<Session>,
}

impl Profiler {
    pub fn new(opts: Opts, cancel: CancelToken) -> Result<Profiler> {
        opts.validate()?;
        Ok(Profiler {
            opts,
            cancel,
            progress: None,
            should_start: None,
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn set_progress(&mut self, progress: Progress) {
        self.progress = Some(progress);
    }

    pub fn set_should_start(&mut self, gate: Box<dyn Fn() -> bool + Send>) {
        self.should_start = Some(gate);
    }

    fn report(&mut self, msg: &str) {
        info!("{msg}");
        if let Some(progress) = &mut self.progress {
            progress(msg);
        }
    }

    pub fn run(mut self) -> Result<RunOutcome> {
        let mut targets = Vec::new();
        for &pid in &self.opts.pids {
            targets.push(Target { pid, child: None });
        }

        let mut process_name = String::new();
        if let Some(program) = self.opts.program.clone() {
            process_name = program
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let child = self.spawn_target(&program)?;
            targets.push(Target {
                pid: child.id(),
                child: Some(child),
            });
        }
        if process_name.is_empty() {
            process_name = attached_process_name(targets[0].pid);
        }

        let attached = self.opts.program.is_none();
        let base = self.opts.output_base.clone().unwrap_or_else(|| {
            let mut base = format!("ultra_{}_{}", process_name, wall_clock_stamp());
            if attached {
                base.push_str(&format!("_pid_{}", targets[0].pid));
            }
            base
        });
        let out_dir = self
            .opts
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        let mut intermediates: Vec<PathBuf> = Vec::new();
        let result = self.run_collect(&mut targets, &base, &out_dir, &mut intermediates);

        // Intermediate files never outlive a failed run, and only outlive
        // a successful one on request.
        if self.opts.keep_intermediates && result.is_ok() {
            debug!(?intermediates, "keeping intermediate files");
        } else if result.is_err() || !self.opts.keep_intermediates {
            for path in &intermediates {
                let _ = std::fs::remove_file(path);
            }
        }
        result
    }

    fn run_collect(
        &mut self,
        targets: &mut Vec<Target>,
        base: &str,
        out_dir: &Path,
        intermediates: &mut Vec<PathBuf>,
    ) -> Result<RunOutcome> {
        // External pause gate, then the configured delay.
        while let Some(gate) = &self.should_start {
            if gate() {
                break;
            }
            if self.cancellable_sleep(self.opts.check_delta) {
                return Ok(cancelled_outcome());
            }
        }
        if self.cancellable_sleep(self.opts.delay) {
            return Ok(cancelled_outcome());
        }

        let start_unix_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);

        // Enable sessions. The runtime channel is mandatory; the sampler
        // channel only exists if the target was launched with the library
        // preloaded, so its absence is silent.
        let mut sessions: Vec<SessionSet> = Vec::new();
        for target in targets.iter() {
            match self.open_sessions(target.pid, base, out_dir, intermediates) {
                Ok(set) => sessions.push(set),
                Err(e) => {
                    for set in &sessions {
                        block_on(set.clr.stop_and_dispose());
                        if let Some(sampler) = &set.sampler {
                            block_on(sampler.stop_and_dispose());
                        }
                    }
                    return Err(e);
                }
            }
        }
        self.report("profiling started");

        // Poll until duration elapsed, every target exited, or cancel.
        let started = Instant::now();
        loop {
            if self.cancellable_sleep(self.opts.check_delta) {
                self.report("cancel requested, stopping");
                break;
            }
            if let Some(duration) = self.opts.duration {
                if started.elapsed() >= duration {
                    self.report("duration elapsed, stopping");
                    break;
                }
            }
            if targets.iter_mut().all(|t| !t.alive()) {
                self.report("every target process exited, stopping");
                break;
            }
        }

        for set in &sessions {
            block_on(set.clr.stop_and_dispose());
            if let Some(sampler) = &set.sampler {
                block_on(sampler.stop_and_dispose());
            }
        }

        if self.cancel.is_forced() {
            for target in targets.iter_mut() {
                if target.child.is_some() {
                    let _ = syscall::kill(target.pid);
                }
            }
            return Ok(cancelled_outcome());
        }

        // The copy tasks are done, but the filesystem may still be
        // catching up; wait until sizes stop moving.
        self.wait_files_stale(intermediates);

        // Rundown: force the runtime to re-enumerate loaders and methods
        // so late-compiled code still symbolicates. The target may already
        // be gone, which is fine.
        if self.opts.rundown && !self.cancel.is_forced() {
            for pid in sessions.iter().map(|s| s.pid).collect::<Vec<_>>() {
                if let Some(path) = self.run_rundown(pid, base, out_dir) {
                    intermediates.push(path);
                }
            }
        }

        if self.cancel.is_forced() {
            return Ok(cancelled_outcome());
        }

        // Merge and convert.
        let mut streams: Vec<Vec<LogEvent>> = Vec::new();
        for path in intermediates.iter() {
            match read_log(path) {
                Ok(events) => streams.push(events),
                // A missing sampler stream (no events ever flowed) is not
                // an error; a broken one is.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(?path, "empty intermediate stream");
                }
                Err(e) => return Err(Error::io(path.clone(), e)),
            }
        }

        self.report("converting");
        let profile = convert(
            streams,
            ConvertOptions {
                pid: sessions.first().map(|s| s.pid).unwrap_or(0),
                process_name: base_process_name(base).into(),
                interval_ms: self.opts.sampling_interval_ms,
                min_visible_cpu_ms: self.opts.min_visible_cpu_ms,
                start_time_unix_ms: start_unix_ms,
                logical_cpus: std::thread::available_parallelism()
                    .ok()
                    .map(|n| n.get() as u64),
                physical_cpus: None,
                rules: Default::default(),
            },
        );

        let output_path = out_dir.join(format!("{base}.json.gz"));
        write_gz(&output_path, &profile).map_err(|e| Error::io(output_path.clone(), e))?;
        self.report(&format!("wrote {}", output_path.display()));

        Ok(RunOutcome {
            output_path: Some(output_path),
            cancelled: self.cancel.is_cancelled(),
        })
    }

    fn spawn_target(&mut self, program: &Path) -> Result<Child> {
        let mut command = Command::new(program);
        command
            .args(&self.opts.program_args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(lib) = &self.opts.sampler_lib {
            command.env(preload_var(), lib);
        }
        let child = command
            .spawn()
            .map_err(|e| Error::io(program.to_path_buf(), e))?;
        self.report(&format!("launched {} as pid {}", program.display(), child.id()));
        Ok(child)
    }

    fn open_sessions(
        &mut self,
        pid: u32,
        base: &str,
        out_dir: &Path,
        intermediates: &mut Vec<PathBuf>,
    ) -> Result<SessionSet> {
        let clr_path = out_dir.join(format!("{base}_{pid}_clr.nettrace"));
        let clr = Session::new(SessionConfig {
            channel: "clr",
            pid,
            endpoint_dir: self.endpoint_dir(false),
            discovery_timeout: self.opts.discovery_timeout,
            file_path: clr_path.clone(),
            buffer_mb: self.opts.buffer_mb,
            request_rundown: false,
            providers: runtime_providers(),
        });
        intermediates.push(clr_path);
        if let Err(e) = block_on(clr.start(&self.cancel)) {
            block_on(clr.stop_and_dispose());
            return Err(e);
        }

        let sampler_path = out_dir.join(format!("{base}_{pid}_sampler.nettrace"));
        let sampler = Session::new(SessionConfig {
            channel: "sampler",
            pid,
            endpoint_dir: self.endpoint_dir(true),
            discovery_timeout: self.opts.sampler_discovery_timeout,
            file_path: sampler_path.clone(),
            buffer_mb: self.opts.buffer_mb,
            request_rundown: false,
            providers: sampler_providers(),
        });
        let sampler = match block_on(sampler.start(&self.cancel)) {
            Ok(()) => {
                intermediates.push(sampler_path);
                Some(sampler)
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                // No preloaded sampler in the target: proceed without
                // native stacks.
                debug!(pid, error = %e, "sampler channel unavailable");
                block_on(sampler.stop_and_dispose());
                let _ = std::fs::remove_file(&sampler_path);
                None
            }
        };
        Ok(SessionSet { pid, clr, sampler })
    }

    fn run_rundown(&mut self, pid: u32, base: &str, out_dir: &Path) -> Option<PathBuf> {
        let path = out_dir.join(format!("{base}_{pid}_rundown.nettrace"));
        let session = Session::new(SessionConfig {
            channel: "clr",
            pid,
            endpoint_dir: self.endpoint_dir(false),
            discovery_timeout: self.opts.discovery_timeout,
            file_path: path.clone(),
            buffer_mb: self.opts.buffer_mb,
            request_rundown: true,
            providers: rundown_providers(),
        });
        match block_on(session.start(&self.cancel)) {
            Ok(()) => {
                self.wait_files_stale(std::slice::from_ref(&path));
                block_on(session.stop_and_dispose());
                Some(path)
            }
            Err(e) => {
                debug!(pid, error = %e, "rundown unavailable");
                block_on(session.stop_and_dispose());
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    fn endpoint_dir(&self, private: bool) -> PathBuf {
        match &self.opts.diagnostic_dir {
            Some(dir) if private => dir.join(".ultra"),
            Some(dir) => dir.clone(),
            None => discover::diagnostic_dir(private),
        }
    }

    /// Waits until every file's size stops changing between polls, capped
    /// by the stale timeout. Forced cancel abandons the wait.
    fn wait_files_stale(&self, paths: &[PathBuf]) {
        let deadline = Instant::now() + self.opts.file_stale_timeout;
        let mut previous: Vec<u64> = Vec::new();
        loop {
            let sizes: Vec<u64> = paths
                .iter()
                .map(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
                .collect();
            if sizes == previous {
                return;
            }
            previous = sizes;
            if Instant::now() >= deadline {
                warn!("intermediate files still growing at timeout");
                return;
            }
            if self.cancel.is_forced() {
                return;
            }
            std::thread::sleep(self.opts.check_delta);
        }
    }

    /// Sleeps in small steps; true if the run should stop early.
    fn cancellable_sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}

fn cancelled_outcome() -> RunOutcome {
    RunOutcome {
        output_path: None,
        cancelled: true,
    }
}

fn read_log(path: &Path) -> std::io::Result<Vec<LogEvent>> {
    LogReader::open(path)?.read_to_end()
}

fn preload_var() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_INSERT_LIBRARIES"
    } else {
        "LD_PRELOAD"
    }
}

fn attached_process_name(pid: u32) -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) {
            let comm = comm.trim();
            if !comm.is_empty() {
                return comm.replace(['/', ' '], "_");
            }
        }
    }
    format!("pid{pid}")
}

/// `ultra_<name>_<stamp>...` back to `<name>`; best effort for display.
fn base_process_name(base: &str) -> &str {
    base.strip_prefix("ultra_")
        .and_then(|rest| rest.split('_').next())
        .unwrap_or(base)
}

fn wall_clock_stamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0) as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe { libc::localtime_r(&secs, &mut tm) };
    format!(
        "{:04}-{:02}-{:02}_{:02}_{:02}_{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}
