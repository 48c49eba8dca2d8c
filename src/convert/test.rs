use serde_json::json;

use super::{convert, ConvertOptions};
use crate::profile::{phase, Category, Profile};
use crate::record::{
    kind, CallStack, GcEnd, GcHeapStats, GcReason, GcStart, LogEvent, MethodJittingStarted,
    MethodLoadVerbose, ModuleEvent, ModuleEventKind, ThreadStart,
};

fn ms(t: f64) -> u64 {
    (t * 1_000_000.0) as u64
}

fn ev(kind: u16, tid: u64, at_ms: f64, encode: impl FnOnce(&mut Vec<u8>)) -> LogEvent {
    let mut payload = Vec::new();
    encode(&mut payload);
    LogEvent {
        kind,
        thread_id: tid,
        timestamp_ns: ms(at_ms),
        payload,
    }
}

fn stack_event_state(tid: u64, at_ms: f64, prev: i32, frames: &[u64], run_state: i32) -> LogEvent {
    ev(kind::CALL_STACK, tid, at_ms, |buf| {
        CallStack {
            sampling_id: 1,
            thread_id: tid,
            run_state,
            cpu_usage_permil: 500,
            previous_frame_count: prev,
            frames: frames.to_vec(),
        }
        .encode(buf)
    })
}

fn stack_event(tid: u64, at_ms: f64, prev: i32, frames: &[u64]) -> LogEvent {
    stack_event_state(tid, at_ms, prev, frames, 0)
}

fn thread_start(tid: u64, at_ms: f64, name: &str) -> LogEvent {
    ev(kind::THREAD_START, tid, at_ms, |buf| {
        ThreadStart {
            sampling_id: 1,
            thread_id: tid,
            name: name.into(),
        }
        .encode(buf)
    })
}

fn module_loaded(path: &str, base: u64, size: u64, at_ms: f64) -> LogEvent {
    ev(kind::MODULE, 0, at_ms, |buf| {
        ModuleEvent {
            kind: ModuleEventKind::Loaded,
            load_address: base,
            size,
            file_time_utc: 0,
            uuid: [0; 16],
            path: path.into(),
        }
        .encode(buf)
    })
}

fn run(events: Vec<LogEvent>) -> Profile {
    convert(vec![events], ConvertOptions::default())
}

#[test]
fn gc_interval_marker_pairs_start_and_end() {
    let profile = run(vec![
        thread_start(9, 0.0, "worker"),
        ev(kind::GC_START, 9, 100.0, |buf| {
            GcStart {
                count: 3,
                depth: 1,
                reason: GcReason::AllocLarge,
                gc_type: 0,
            }
            .encode(buf)
        }),
        ev(kind::GC_END, 9, 150.0, |buf| {
            GcEnd { count: 3, depth: 1 }.encode(buf)
        }),
    ]);

    let thread = &profile.threads[0];
    assert_eq!(thread.markers.length, 1);
    assert_eq!(thread.markers.start_time[0], Some(100.0));
    assert_eq!(thread.markers.end_time[0], Some(150.0));
    assert_eq!(thread.markers.phase[0], phase::INTERVAL);
    assert_eq!(thread.markers.category[0], Category::Gc as usize);
    let data = thread.markers.data[0].as_ref().unwrap();
    assert_eq!(data["reason"], json!("AllocLarge"));
    assert_eq!(data["count"], json!(3));
    assert_eq!(thread.string_array[thread.markers.name[0]], "GC");
}

#[test]
fn unmatched_gc_end_is_ignored() {
    let profile = run(vec![
        thread_start(9, 0.0, "worker"),
        ev(kind::GC_END, 9, 150.0, |buf| {
            GcEnd { count: 3, depth: 1 }.encode(buf)
        }),
    ]);
    assert_eq!(profile.threads[0].markers.length, 0);
}

#[test]
fn kernel_and_native_categories_by_address() {
    let profile = run(vec![stack_event(
        1,
        1.0,
        0,
        &[0xFF00_0000_1234, 0x0000_7FFF_1234],
    )]);

    let thread = &profile.threads[0];
    assert_eq!(thread.frame_table.length, 2);
    let leaf = thread.frame_table.category[0];
    let root = thread.frame_table.category[1];
    assert_eq!(leaf, Some(Category::Kernel as usize));
    assert_eq!(root, Some(Category::Native as usize));
    // Outside every module: hex name, no resource.
    assert_eq!(
        thread.string_array[thread.func_table.name[0]],
        "0xff0000001234"
    );
    assert_eq!(thread.func_table.resource[0], -1);
    assert_eq!(thread.frame_table.address[0], -1);
}

#[test]
fn gc_method_name_overrides_runtime_module_category() {
    let profile = run(vec![
        module_loaded("/usr/share/dotnet/libcoreclr.dylib", 0x10_0000, 0x10_0000, 0.0),
        ev(kind::METHOD_LOAD_VERBOSE, 2, 1.0, |buf| {
            MethodLoadVerbose {
                method_id: 50,
                module_id: 1,
                start_address: 0x10_8000,
                size: 0x100,
                token: 0,
                flags: 0,
                namespace: "WKS::gc_heap".into(),
                name: "plan_phase".into(),
                signature: String::new(),
            }
            .encode(buf)
        }),
        // One frame inside the method, one elsewhere in the runtime.
        stack_event(2, 2.0, 0, &[0x10_8010, 0x10_0040]),
    ]);

    let thread = &profile.threads[0];
    assert_eq!(
        thread.frame_table.category[0],
        Some(Category::Gc as usize),
        "method-name override loses to the module category"
    );
    assert_eq!(thread.frame_table.category[1], Some(Category::Clr as usize));
    assert_eq!(
        thread.string_array[thread.func_table.name[0]],
        "WKS::gc_heap.plan_phase"
    );
}

#[test]
fn managed_assembly_frames_are_managed() {
    let profile = run(vec![
        module_loaded("/app/MyApp.dll", 0x20_0000, 0x1000, 0.0),
        ev(kind::MODULE_LOAD, 0, 0.5, |buf| {
            crate::record::RuntimeModuleLoad {
                module_id: 7,
                assembly_id: 7,
                flags: 0,
                il_path: "/app/MyApp.dll".into(),
                native_path: String::new(),
            }
            .encode(buf)
        }),
        stack_event(1, 1.0, 0, &[0x20_0010]),
    ]);

    let thread = &profile.threads[0];
    assert_eq!(thread.frame_table.category[0], Some(Category::Managed as usize));
}

#[test]
fn heap_stats_become_a_delta_counter() {
    let stats = |at: f64, total: u64| {
        ev(kind::GC_HEAP_STATS, 1, at, |buf| {
            let mut s = GcHeapStats::default();
            s.gen_size[0] = total;
            s.encode(buf)
        })
    };
    let profile = run(vec![
        thread_start(1, 0.0, "Main"),
        stats(10.0, 100),
        stats(20.0, 130),
        stats(30.0, 125),
        stats(40.0, 200),
    ]);

    assert_eq!(profile.counters.len(), 1);
    let counter = &profile.counters[0];
    assert_eq!(counter.name, "GCHeapStats");
    assert_eq!(counter.category, "Memory");
    let samples = &counter.samples;
    assert_eq!(samples.length, 5);
    assert_eq!((samples.time[0], samples.count[0]), (0.0, 0));
    assert_eq!((samples.time[1], samples.count[1]), (10.0, 100));
    assert_eq!((samples.time[2], samples.count[2]), (20.0, 30));
    assert_eq!((samples.time[3], samples.count[3]), (30.0, -5));
    assert_eq!((samples.time[4], samples.count[4]), (40.0, 75));
    // Heap stats also land as instance markers on the reporting thread.
    assert_eq!(profile.threads[0].markers.length, 4);
    assert_eq!(profile.threads[0].markers.phase[0], phase::INSTANCE);
}

#[test]
fn no_heap_stats_means_no_counter() {
    let profile = run(vec![thread_start(1, 0.0, "Main")]);
    assert!(profile.counters.is_empty());
}

#[test]
fn stacks_share_prefixes_and_stay_topological() {
    let profile = run(vec![
        stack_event(1, 1.0, 0, &[0xA, 0xB, 0xC]),
        stack_event(1, 2.0, 2, &[0xD]),
    ]);

    let thread = &profile.threads[0];
    // C, B, A from the first sample; D reuses the C<-B chain.
    assert_eq!(thread.stack_table.length, 4);
    for i in 0..thread.stack_table.length {
        match thread.stack_table.prefix[i] {
            None => {}
            Some(parent) => assert!(parent < i, "stack node {i} points forward to {parent}"),
        }
    }
    assert_eq!(thread.samples.length, 2);
    assert_ne!(thread.samples.stack[0], thread.samples.stack[1]);
}

#[test]
fn cpu_delta_charges_the_span_since_switch_in() {
    let running = 0;
    let waiting = 1;
    let profile = run(vec![
        // Switch-in: the transition sample itself charges nothing.
        stack_event_state(1, 1.0, 0, &[0xA], running),
        stack_event_state(1, 3.0, 1, &[], running),
        // Off the CPU: nothing charged, however long it waits.
        stack_event_state(1, 5.0, 1, &[], waiting),
        stack_event_state(1, 8.0, 1, &[], running),
        stack_event_state(1, 9.0, 1, &[], running),
    ]);

    let samples = &profile.threads[0].samples;
    assert_eq!(samples.length, 5);
    assert_eq!(samples.thread_cpu_delta[0], 0);
    assert_eq!(samples.thread_cpu_delta[1], 2_000_000);
    assert_eq!(samples.thread_cpu_delta[2], 0);
    assert_eq!(samples.thread_cpu_delta[3], 0);
    assert_eq!(samples.thread_cpu_delta[4], 1_000_000);
    assert!((profile.threads[0].cpu_time_ms - 3.0).abs() < 1e-9);
}

#[test]
fn sample_times_never_regress_and_cpu_is_non_negative() {
    let profile = run(vec![
        stack_event(1, 5.0, 0, &[0xA]),
        // Delivered out of order; processed in delivery order, clamped.
        stack_event(1, 3.0, 1, &[]),
        stack_event(1, 7.0, 1, &[]),
    ]);

    let samples = &profile.threads[0].samples;
    assert_eq!(samples.length, 3);
    for i in 1..samples.length {
        assert!(samples.time[i] >= samples.time[i - 1]);
    }
    assert_eq!(samples.time[1], 5.0, "regressing timestamp must clamp");
}

#[test]
fn duplicate_threads_are_deduplicated() {
    let profile = run(vec![
        thread_start(5, 0.0, "first"),
        thread_start(5, 1.0, "second"),
        stack_event(5, 2.0, 0, &[0xA]),
    ]);

    assert_eq!(profile.threads.len(), 1);
    assert_eq!(profile.threads[0].name, "first");
    assert_eq!(profile.threads[0].samples.length, 1);
}

#[test]
fn jit_marker_needs_a_matching_start() {
    let jitting = |at: f64, id: u64| {
        ev(kind::METHOD_JITTING_STARTED, 3, at, |buf| {
            MethodJittingStarted {
                method_id: id,
                module_id: 1,
                token: 0,
                il_size: 420,
                namespace: "My.App".into(),
                name: "Hot".into(),
                signature: String::new(),
            }
            .encode(buf)
        })
    };
    let loaded = |at: f64, id: u64, addr: u64| {
        ev(kind::METHOD_LOAD_VERBOSE, 3, at, |buf| {
            MethodLoadVerbose {
                method_id: id,
                module_id: 1,
                start_address: addr,
                size: 0x40,
                token: 0,
                flags: 0,
                namespace: "My.App".into(),
                name: "Hot".into(),
                signature: String::new(),
            }
            .encode(buf)
        })
    };

    let profile = run(vec![
        jitting(10.0, 1),
        loaded(12.5, 1, 0x5000),
        // No pending start: no marker, but the method still registers.
        loaded(20.0, 2, 0x6000),
        stack_event(3, 30.0, 0, &[0x6010]),
    ]);

    let thread = &profile.threads[0];
    assert_eq!(thread.markers.length, 1);
    assert_eq!(thread.markers.start_time[0], Some(10.0));
    assert_eq!(thread.markers.end_time[0], Some(12.5));
    let data = thread.markers.data[0].as_ref().unwrap();
    assert_eq!(data["fullName"], json!("My.App.Hot"));
    assert_eq!(data["ilSize"], json!(420));
    // The unpaired load symbolicated the sample anyway.
    assert_eq!(thread.string_array[thread.func_table.name[0]], "My.App.Hot");
}

#[test]
fn frame_delta_streams_reassemble() {
    let profile = run(vec![
        stack_event(1, 1.0, 0, &[0xA, 0xB, 0xC, 0xD]),
        stack_event(1, 2.0, 3, &[0x58]),
        stack_event(1, 3.0, 4, &[]),
    ]);

    let thread = &profile.threads[0];
    assert_eq!(thread.samples.length, 3);
    // Second and third sample share the same interned stack.
    assert_eq!(thread.samples.stack[1], thread.samples.stack[2]);
    // [X,B,C,D] introduced exactly one new frame and one new stack node.
    assert_eq!(thread.frame_table.length, 5);
    assert_eq!(thread.stack_table.length, 5);
}

#[test]
fn busiest_thread_is_always_visible_and_selected() {
    let mut events = vec![
        thread_start(1, 0.0, "idle"),
        thread_start(2, 0.0, "busy"),
    ];
    // Thread 2 burns CPU; thread 1 stays under the floor.
    for i in 0..20 {
        let at = 1.0 + i as f64;
        events.push(stack_event(2, at, if i == 0 { 0 } else { 1 }, &[0xB]));
    }
    // A single sample is its own switch-in and charges no CPU.
    events.push(stack_event(1, 30.0, 0, &[0xA]));

    let profile = convert(
        vec![events],
        ConvertOptions {
            min_visible_cpu_ms: 5.0,
            ..ConvertOptions::default()
        },
    );

    assert_eq!(profile.meta.initial_selected_threads, vec![1]);
    assert!(profile.meta.initial_visible_threads.contains(&1));
    assert!(!profile.meta.initial_visible_threads.contains(&0));
}

#[test]
fn rundown_methods_symbolicate_earlier_samples() {
    // The sample arrives before the (rundown) method load in time order,
    // but the first registry pass still resolves it.
    let profile = run(vec![
        stack_event(1, 1.0, 0, &[0x9000]),
        ev(kind::METHOD_LOAD_VERBOSE, 1, 99.0, |buf| {
            MethodLoadVerbose {
                method_id: 8,
                module_id: 1,
                start_address: 0x9000,
                size: 0x100,
                token: 0,
                flags: 0,
                namespace: "Late".into(),
                name: "Method".into(),
                signature: String::new(),
            }
            .encode(buf)
        }),
    ]);

    let thread = &profile.threads[0];
    assert_eq!(thread.string_array[thread.func_table.name[0]], "Late.Method");
}
