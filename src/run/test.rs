use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde_json::Value;

use super::*;
use crate::record::log::LogWriter;
use crate::record::{kind, CallStack, GcEnd, GcReason, GcStart, ThreadStart};
use crate::session::transport::MAGIC;

const IPC_HEADER: usize = 20;

/// Serves a diagnostic endpoint forever: CollectTracing2 gets an ack plus
/// `stream` and the connection closes; StopTracing gets an ack.
fn spawn_endpoint(listener: UnixListener, stream_blob: Vec<u8>) {
    std::thread::spawn(move || {
        while let Ok((mut conn, _)) = listener.accept() {
            let mut header = [0u8; IPC_HEADER];
            if conn.read_exact(&mut header).is_err() {
                continue;
            }
            let size = u16::from_le_bytes([header[14], header[15]]) as usize;
            let command = header[17];
            let mut payload = vec![0u8; size - IPC_HEADER];
            if conn.read_exact(&mut payload).is_err() {
                continue;
            }

            let mut ack = Vec::new();
            ack.extend_from_slice(MAGIC);
            ack.extend_from_slice(&((IPC_HEADER + 8) as u16).to_le_bytes());
            ack.push(0xFF);
            ack.push(0x00);
            ack.extend_from_slice(&0u16.to_le_bytes());
            ack.extend_from_slice(&11u64.to_le_bytes());
            let _ = conn.write_all(&ack);

            if command == 0x03 {
                let _ = conn.write_all(&stream_blob);
            }
            // Dropping the connection ends the copy task cleanly.
        }
    });
}

fn sampler_blob(tid: u64) -> Vec<u8> {
    let mut writer = LogWriter::new(Vec::new()).unwrap();
    writer.manifest().unwrap();
    let mut payload = Vec::new();
    ThreadStart {
        sampling_id: 1,
        thread_id: tid,
        name: "main".into(),
    }
    .encode(&mut payload);
    writer.event(kind::THREAD_START, tid, 500_000, &payload).unwrap();

    for (at, prev, frames) in [
        (1_000_000u64, 0i32, vec![0x1000u64, 0x2000]),
        (2_000_000, 2, vec![]),
        (3_000_000, 2, vec![0x3000]),
    ] {
        payload.clear();
        CallStack {
            sampling_id: 1,
            thread_id: tid,
            run_state: 0,
            cpu_usage_permil: 800,
            previous_frame_count: prev,
            frames,
        }
        .encode(&mut payload);
        writer.event(kind::CALL_STACK, tid, at, &payload).unwrap();
    }
    writer.into_inner()
}

fn clr_blob(tid: u64) -> Vec<u8> {
    let mut writer = LogWriter::new(Vec::new()).unwrap();
    writer.manifest().unwrap();
    let mut payload = Vec::new();
    GcStart {
        count: 1,
        depth: 0,
        reason: GcReason::AllocSmall,
        gc_type: 0,
    }
    .encode(&mut payload);
    writer.event(kind::GC_START, tid, 1_500_000, &payload).unwrap();
    payload.clear();
    GcEnd { count: 1, depth: 0 }.encode(&mut payload);
    writer.event(kind::GC_END, tid, 1_800_000, &payload).unwrap();
    writer.into_inner()
}

fn bind_endpoint(dir: &Path, pid: u32) -> UnixListener {
    std::fs::create_dir_all(dir).unwrap();
    UnixListener::bind(dir.join(format!("dotnet-diagnostic-{pid}-1-socket"))).unwrap()
}

fn read_profile(path: &Path) -> Value {
    let mut text = String::new();
    GzDecoder::new(std::fs::File::open(path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    serde_json::from_str(&text).unwrap()
}

fn base_opts(dir: &Path) -> Opts {
    Opts {
        duration: Some(Duration::from_secs(10)),
        check_delta: Duration::from_millis(50),
        discovery_timeout: Duration::from_millis(500),
        sampler_discovery_timeout: Duration::from_millis(200),
        file_stale_timeout: Duration::from_secs(2),
        output_dir: Some(dir.to_path_buf()),
        diagnostic_dir: Some(dir.to_path_buf()),
        output_base: Some("ultra_test_run".into()),
        ..Opts::default()
    }
}

// A short-lived target with a long duration: the run must end on target
// exit within a poll interval and still produce a profile with samples.
#[test]
fn stops_on_target_exit_and_writes_a_profile() {
    let dir = tempfile::tempdir().unwrap();
    let tid = 101;

    // The test owns the short-lived target so the endpoints can be bound
    // under its real pid before the profiler starts looking.
    let mut child = std::process::Command::new("/bin/sleep")
        .arg("0.25")
        .spawn()
        .unwrap();
    let pid = child.id();
    spawn_endpoint(bind_endpoint(dir.path(), pid), clr_blob(tid));
    spawn_endpoint(bind_endpoint(&dir.path().join(".ultra"), pid), sampler_blob(tid));
    let reaper = std::thread::spawn(move || {
        let _ = child.wait();
    });

    let mut opts = base_opts(dir.path());
    opts.pids = vec![pid];
    let profiler = Profiler::new(opts, CancelToken::new()).unwrap();
    let started = std::time::Instant::now();
    let outcome = profiler.run().unwrap();
    reaper.join().unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(5),
        "did not stop on target exit"
    );
    assert!(!outcome.cancelled);
    let output = outcome.output_path.unwrap();
    let profile = read_profile(&output);

    let threads = profile["threads"].as_array().unwrap();
    assert_eq!(threads.len(), 1);
    let main = &threads[0];
    assert_eq!(main["isMainThread"], Value::Bool(true));
    assert!(main["samples"]["length"].as_u64().unwrap() >= 1);
    assert!(main["markers"]["length"].as_u64().unwrap() >= 1);

    // Intermediates are deleted on success by default.
    assert!(std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .all(|e| !e.file_name().to_string_lossy().ends_with(".nettrace")));
}

#[test]
fn missing_sampler_channel_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let pid = std::process::id();
    spawn_endpoint(bind_endpoint(dir.path(), pid), clr_blob(7));

    let mut opts = base_opts(dir.path());
    opts.pids = vec![pid];
    opts.duration = Some(Duration::from_millis(200));
    opts.output_base = Some("ultra_test_nosampler".into());
    let profiler = Profiler::new(opts, CancelToken::new()).unwrap();
    let outcome = profiler.run().unwrap();

    let profile = read_profile(&outcome.output_path.unwrap());
    // Runtime events alone still make a (markers-only) profile.
    assert_eq!(profile["threads"].as_array().unwrap().len(), 1);
}

#[test]
fn missing_runtime_channel_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = base_opts(dir.path());
    opts.pids = vec![std::process::id()];
    opts.discovery_timeout = Duration::from_millis(50);
    let profiler = Profiler::new(opts, CancelToken::new()).unwrap();

    let err = profiler.run().unwrap_err();
    assert!(matches!(err, Error::Connect { channel: "clr", .. }), "{err:?}");
    // The error path removed the intermediate files it created.
    assert!(std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .all(|e| !e.file_name().to_string_lossy().ends_with(".nettrace")));
}

#[test]
fn cancel_before_sessions_produces_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = base_opts(dir.path());
    opts.pids = vec![std::process::id()];
    opts.delay = Duration::from_secs(10);

    let cancel = CancelToken::new();
    cancel.cancel();
    let profiler = Profiler::new(opts, cancel).unwrap();
    let outcome = profiler.run().unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.output_path.is_none());
}

#[test]
fn cancel_levels_escalate() {
    let cancel = CancelToken::new();
    assert!(!cancel.is_cancelled());
    cancel.cancel();
    assert!(cancel.is_cancelled());
    assert!(!cancel.is_forced());
    cancel.cancel();
    assert!(cancel.is_forced());
    cancel.cancel();
    assert!(cancel.is_forced());
}
