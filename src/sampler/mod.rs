//! Native stack-walking sampler.
//!
//! One dedicated OS thread at the highest priority the OS grants, living
//! inside the target process (deployed as a preloaded library; the library
//! shim calls [`Sampler::spawn`] and wires the emitted events to its
//! diagnostic socket). Every tick it suspends each peer thread in turn,
//! walks its call chain, resumes it, and emits one frame-delta-compressed
//! [`CallStack`][crate::record::CallStack] event per thread.
//!
//! The one contract that outranks everything else here: a suspended peer is
//! always resumed, on every exit path. A peer left suspended deadlocks the
//! target; if a resume ever fails the backend aborts the process instead.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::codec::DeltaCodec;
use crate::record::{
    kind, CallStack, ModuleEvent, ModuleEventKind, ProcessStart, ThreadStart, ThreadStop,
};
use crate::record::log::LogWriter;
use crate::registry::{code_size, ModuleRegistry, Segment};
use crate::ffi::syscall;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;
#[cfg(target_os = "macos")]
#[path = "mac.rs"]
mod platform;

pub mod unwind;

use platform::{list_peers, sample_thread};

/// Offset between the Unix epoch and Windows file time, in 100ns units.
const FILETIME_EPOCH_DELTA: i64 = 116_444_736_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running = 0,
    Waiting = 1,
}

#[derive(Debug)]
pub enum SampleError {
    /// The peer could not be suspended this tick; skipped, not fatal.
    Suspend,
    /// Registers could not be read while suspended.
    Registers,
}

pub(crate) struct PeerThread {
    pub tid: u64,
    pub name: Option<String>,
    pub run_state: RunState,
    pub idle: bool,
    pub cpu_ns: u64,
    pub handle: platform::ThreadHandle,
}

/// What the sampler pushes into the event channel.
pub enum Emitted {
    /// Start-of-stream marker; sent on every enable before any event.
    Manifest,
    Event {
        kind: u16,
        thread_id: u64,
        timestamp_ns: u64,
        payload: Vec<u8>,
    },
}

#[derive(Clone, Debug)]
pub struct SamplerConfig {
    pub interval: Duration,
    /// Stamped into every native record of this run.
    pub sampling_id: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval: Duration::from_millis(1),
            sampling_id: 1,
        }
    }
}

struct Shared {
    stop: AtomicBool,
    enabled: Mutex<bool>,
    gate: Condvar,
    modules: Mutex<ModuleRegistry>,
    epoch: Instant,
    config: SamplerConfig,
    out: Sender<Emitted>,
}

impl Shared {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn emit(&self, kind: u16, thread_id: u64, payload: Vec<u8>) {
        let _ = self.out.send(Emitted::Event {
            kind,
            thread_id,
            timestamp_ns: self.now_ns(),
            payload,
        });
    }
}

/// Preload-shim entry: builds the private discovery directory at
/// `$TMPDIR/.ultra/` and points the process's `TMPDIR` at it, so the
/// diagnostic endpoint the sampler publishes cannot collide with the
/// runtime's own.
///
/// Must run before any thread reads `TMPDIR`; the shim calls it from its
/// loader constructor.
pub fn init_private_discovery_dir() -> std::io::Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join(".ultra");
    std::fs::create_dir_all(&dir)?;
    std::env::set_var("TMPDIR", &dir);
    Ok(dir)
}

/// Handle to the sampling thread.
pub struct Sampler {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl Sampler {
    /// Starts the sampling thread (initially disabled) and returns the
    /// event channel the consumer drains, typically via [`pump`].
    pub fn spawn(config: SamplerConfig) -> (Sampler, Receiver<Emitted>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            enabled: Mutex::new(false),
            gate: Condvar::new(),
            modules: Mutex::new(ModuleRegistry::new()),
            epoch: Instant::now(),
            config,
            out: tx,
        });
        let loop_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name("ultra-sampler".into())
            .spawn(move || sampler_loop(&loop_shared))
            .expect("spawn sampler thread");
        (
            Sampler {
                shared,
                join: Some(join),
            },
            rx,
        )
    }

    /// Starts producing events. The manifest goes out before the first one.
    pub fn enable(&self) {
        *self.shared.enabled.lock().unwrap() = true;
        self.shared.gate.notify_all();
    }

    /// Stops producing events; thread state and delta slots are dropped and
    /// the loop parks until re-enabled. Nothing is dropped silently while
    /// enabled; samples simply are not produced here.
    pub fn disable(&self) {
        *self.shared.enabled.lock().unwrap() = false;
        self.shared.gate.notify_all();
    }

    /// Requests shutdown; takes effect within one tick.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.gate.notify_all();
    }

    pub fn join(mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Loader callback: a native code region appeared.
    ///
    /// `segments`, when available, yields the authoritative code size; the
    /// OS-reported `image_size` is only the fallback.
    pub fn module_loaded(
        &self,
        path: &str,
        base: u64,
        image_size: u64,
        uuid: Option<[u8; 16]>,
        segments: &[Segment],
        already_loaded: bool,
    ) {
        let size = match code_size(segments) {
            0 => image_size,
            code => code,
        };
        let now = self.shared.now_ns();
        self.shared
            .modules
            .lock()
            .unwrap()
            .insert(path, base, size, uuid, now);
        let mut payload = Vec::new();
        ModuleEvent {
            kind: if already_loaded {
                ModuleEventKind::AlreadyLoaded
            } else {
                ModuleEventKind::Loaded
            },
            load_address: base,
            size,
            file_time_utc: file_time_now(),
            uuid: uuid.unwrap_or_default(),
            path: path.into(),
        }
        .encode(&mut payload);
        self.shared.emit(kind::MODULE, 0, payload);
    }

    /// Loader callback: a native code region went away.
    pub fn module_unloaded(&self, path: &str, base: u64) {
        let now = self.shared.now_ns();
        let mut modules = self.shared.modules.lock().unwrap();
        modules.remove(base, now);
        let mut payload = Vec::new();
        ModuleEvent {
            kind: ModuleEventKind::Unloaded,
            load_address: base,
            size: 0,
            file_time_utc: file_time_now(),
            uuid: [0; 16],
            path: path.into(),
        }
        .encode(&mut payload);
        drop(modules);
        self.shared.emit(kind::MODULE, 0, payload);
    }

    /// The registry shared with loader callbacks. Reads after the session
    /// ends need no lock, but this is the writer-side handle.
    pub fn modules(&self) -> &Mutex<ModuleRegistry> {
        &self.shared.modules
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Drains a sampler channel into an intermediate log stream. Returns when
/// the sampler hangs up.
pub fn pump(rx: Receiver<Emitted>, out: impl Write) -> std::io::Result<()> {
    let mut writer = LogWriter::new(out)?;
    for emitted in rx {
        match emitted {
            Emitted::Manifest => writer.manifest()?,
            Emitted::Event {
                kind,
                thread_id,
                timestamp_ns,
                payload,
            } => writer.event(kind, thread_id, timestamp_ns, &payload)?,
        }
    }
    writer.flush()
}

fn sampler_loop(shared: &Shared) {
    let self_tid = syscall::gettid();
    syscall::raise_thread_priority();
    debug!(self_tid, "sampler thread up");

    let mut codec = DeltaCodec::new();
    // tid -> cpu_ns at the previous tick.
    let mut last_cpu: HashMap<u64, u64> = HashMap::new();
    let mut scratch: Vec<u64> = Vec::with_capacity(unwind::MAX_WALK_FRAMES);
    let interval_ns = shared.config.interval.as_nanos() as u64;

    'outer: loop {
        // Park until enabled; the manifest precedes the first event of
        // every enable cycle.
        {
            let mut enabled = shared.enabled.lock().unwrap();
            while !*enabled {
                if shared.stop.load(Ordering::Acquire) {
                    break 'outer;
                }
                enabled = shared.gate.wait(enabled).unwrap();
            }
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let _ = shared.out.send(Emitted::Manifest);
        emit_process_start(shared);

        loop {
            let tick_start = Instant::now();
            if shared.stop.load(Ordering::Acquire) {
                break 'outer;
            }
            if !*shared.enabled.lock().unwrap() {
                // Disabled: drop per-thread state, return slots, park.
                codec.reset();
                last_cpu.clear();
                continue 'outer;
            }

            match list_peers() {
                Ok(peers) => {
                    codec.begin_tick();
                    for peer in &peers {
                        if shared.stop.load(Ordering::Acquire) {
                            // Finish the tick bookkeeping but sample no
                            // further thread; shutdown latency stays under
                            // one tick.
                            break;
                        }
                        if peer.tid == self_tid {
                            continue;
                        }
                        sample_peer(shared, peer, &mut codec, &mut last_cpu, &mut scratch, interval_ns);
                    }
                    for gone in codec.end_tick() {
                        last_cpu.remove(&gone);
                        let mut payload = Vec::new();
                        ThreadStop {
                            sampling_id: shared.config.sampling_id,
                            thread_id: gone,
                        }
                        .encode(&mut payload);
                        shared.emit(kind::THREAD_STOP, gone, payload);
                    }
                }
                Err(e) => warn!(error = %e, "thread enumeration failed this tick"),
            }

            if shared.stop.load(Ordering::Acquire) {
                break 'outer;
            }
            let elapsed = tick_start.elapsed();
            if elapsed < shared.config.interval {
                std::thread::sleep(shared.config.interval - elapsed);
            }
        }
    }
    debug!("sampler thread down");
}

fn sample_peer(
    shared: &Shared,
    peer: &PeerThread,
    codec: &mut DeltaCodec,
    last_cpu: &mut HashMap<u64, u64>,
    scratch: &mut Vec<u64>,
    interval_ns: u64,
) {
    let first_sight = !last_cpu.contains_key(&peer.tid);
    if first_sight {
        let mut payload = Vec::new();
        ThreadStart {
            sampling_id: shared.config.sampling_id,
            thread_id: peer.tid,
            name: peer.name.clone().unwrap_or_default(),
        }
        .encode(&mut payload);
        shared.emit(kind::THREAD_START, peer.tid, payload);
    }

    if peer.idle {
        // Do not suspend what the OS already parked; the slot stays alive.
        codec.touch(peer.tid);
        last_cpu.insert(peer.tid, peer.cpu_ns);
        return;
    }

    match sample_thread(peer, scratch) {
        Ok(()) => {
            let cpu_delta = peer.cpu_ns.saturating_sub(*last_cpu.get(&peer.tid).unwrap_or(&peer.cpu_ns));
            let permil = if interval_ns == 0 {
                0
            } else {
                (cpu_delta.saturating_mul(1000) / interval_ns) as i32
            };
            last_cpu.insert(peer.tid, peer.cpu_ns);

            if let Some(delta) = codec.compress(peer.tid, scratch) {
                let mut payload = Vec::new();
                CallStack {
                    sampling_id: shared.config.sampling_id,
                    thread_id: peer.tid,
                    run_state: peer.run_state as i32,
                    cpu_usage_permil: permil,
                    previous_frame_count: delta.previous_frame_count as i32,
                    frames: delta.frames.to_vec(),
                }
                .encode(&mut payload);
                shared.emit(kind::CALL_STACK, peer.tid, payload);
            }
        }
        Err(e) => {
            trace!(tid = peer.tid, ?e, "skipped thread this tick");
            codec.touch(peer.tid);
            last_cpu.insert(peer.tid, peer.cpu_ns);
        }
    }
}

fn emit_process_start(shared: &Shared) {
    let mut payload = Vec::new();
    ProcessStart {
        start_time_utc: file_time_now(),
        architecture: match std::env::consts::ARCH {
            "x86_64" => 0,
            "aarch64" => 1,
            _ => -1,
        },
        rid: runtime_identifier(),
        os: std::env::consts::OS.into(),
    }
    .encode(&mut payload);
    shared.emit(kind::PROCESS_START, 0, payload);
}

fn runtime_identifier() -> String {
    let os = match std::env::consts::OS {
        "macos" => "osx",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{os}-{arch}")
}

fn file_time_now() -> i64 {
    let unix_100ns = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as i64)
        .unwrap_or(0);
    unix_100ns + FILETIME_EPOCH_DELTA
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::log::LogReader;
    use crate::record::Event;

    // The sampler samples this test process itself: spawn it, let it tick,
    // and expect call stacks for at least one peer thread.
    #[test]
    fn samples_own_process_threads() {
        let busy_stop = Arc::new(AtomicBool::new(false));
        let busy_flag = Arc::clone(&busy_stop);
        let busy = std::thread::spawn(move || {
            let mut x = 0u64;
            while !busy_flag.load(Ordering::Relaxed) {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
                std::hint::black_box(x);
            }
        });

        let (sampler, rx) = Sampler::spawn(SamplerConfig::default());
        let writer = std::thread::spawn(move || {
            let mut out = Vec::new();
            pump(rx, &mut out).unwrap();
            out
        });

        sampler.enable();
        std::thread::sleep(Duration::from_millis(120));
        sampler.join();
        busy_stop.store(true, Ordering::Relaxed);
        busy.join().unwrap();

        let bytes = writer.join().unwrap();
        let mut reader = LogReader::new(&bytes[..]).unwrap();
        let events = reader.read_to_end().unwrap();

        let mut starts = 0;
        let mut stacks = 0;
        for ev in &events {
            match ev.decode().unwrap() {
                Event::ThreadStart(_) => starts += 1,
                Event::CallStack(cs) => {
                    stacks += 1;
                    assert!(cs.previous_frame_count >= 0);
                }
                _ => {}
            }
        }
        assert!(starts >= 1, "no thread starts in {} events", events.len());
        assert!(stacks >= 1, "no call stacks in {} events", events.len());
    }
}
