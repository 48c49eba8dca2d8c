use super::log::{LogReader, LogWriter};
use super::*;

#[test]
fn call_stack_fixed_prefix_is_32_bytes() {
    let ev = CallStack {
        sampling_id: 7,
        thread_id: 0x1122_3344_5566_7788,
        run_state: 1,
        cpu_usage_permil: 250,
        previous_frame_count: 3,
        frames: vec![0xAAAA, 0xBBBB],
    };
    let mut buf = Vec::new();
    ev.encode(&mut buf);
    assert_eq!(buf.len(), 32 + 16);
    assert_eq!(&buf[0..8], &7u64.to_le_bytes());
    assert_eq!(&buf[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
    assert_eq!(&buf[16..20], &1i32.to_le_bytes());
    assert_eq!(&buf[20..24], &250i32.to_le_bytes());
    assert_eq!(&buf[24..28], &3i32.to_le_bytes());
    assert_eq!(&buf[28..32], &16i32.to_le_bytes());

    match Event::parse(kind::CALL_STACK, &buf).unwrap() {
        Event::CallStack(parsed) => assert_eq!(parsed, ev),
        other => panic!("wrong event: {other:?}"),
    }
}

#[test]
fn module_fixed_prefix_is_48_bytes() {
    let ev = ModuleEvent {
        kind: ModuleEventKind::Loaded,
        load_address: 0x1_0000,
        size: 0x4000,
        file_time_utc: 133_000_000_000_000_000,
        uuid: [0xAB; 16],
        path: "/usr/lib/libcoreclr.dylib".into(),
    };
    let mut buf = Vec::new();
    ev.encode(&mut buf);
    assert_eq!(buf.len(), 48 + ev.path.len());
    assert_eq!(&buf[0..4], &1i32.to_le_bytes());
    assert_eq!(&buf[28..44], &[0xAB; 16]);
    assert_eq!(&buf[44..48], &(ev.path.len() as i32).to_le_bytes());

    match Event::parse(kind::MODULE, &buf).unwrap() {
        Event::Module(parsed) => assert_eq!(parsed, ev),
        other => panic!("wrong event: {other:?}"),
    }
}

#[test]
fn process_start_strings_are_utf16() {
    let ev = ProcessStart {
        start_time_utc: 42,
        architecture: 3,
        rid: "osx-arm64".into(),
        os: "Mac OS X 15.1".into(),
    };
    let mut buf = Vec::new();
    ev.encode(&mut buf);
    // i64 + i32 + i32 + rid chars + i32 + os chars
    assert_eq!(buf.len(), 8 + 4 + 4 + 9 * 2 + 4 + 13 * 2);
    match Event::parse(kind::PROCESS_START, &buf).unwrap() {
        Event::ProcessStart(parsed) => assert_eq!(parsed, ev),
        other => panic!("wrong event: {other:?}"),
    }
}

#[test]
fn truncated_payload_is_an_error() {
    let ev = ThreadStart {
        sampling_id: 1,
        thread_id: 2,
        name: "worker".into(),
    };
    let mut buf = Vec::new();
    ev.encode(&mut buf);
    buf.truncate(buf.len() - 2);
    assert!(matches!(
        Event::parse(kind::THREAD_START, &buf),
        Err(RecordError::Truncated { .. })
    ));
}

#[test]
fn log_round_trip_preserves_order_and_envelopes() {
    let mut writer = LogWriter::new(Vec::new()).unwrap();
    writer.manifest().unwrap();

    let mut payload = Vec::new();
    GcStart {
        count: 3,
        depth: 2,
        reason: GcReason::AllocLarge,
        gc_type: 0,
    }
    .encode(&mut payload);
    writer.event(kind::GC_START, 42, 1_000_000, &payload).unwrap();

    payload.clear();
    GcEnd { count: 3, depth: 2 }.encode(&mut payload);
    writer.event(kind::GC_END, 42, 2_000_000, &payload).unwrap();

    let bytes = writer.into_inner();
    let mut reader = LogReader::new(&bytes[..]).unwrap();
    let events = reader.read_to_end().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].thread_id, 42);
    assert_eq!(events[0].timestamp_ns, 1_000_000);
    match events[0].decode().unwrap() {
        Event::GcStart(gc) => assert_eq!(gc.reason, GcReason::AllocLarge),
        other => panic!("wrong event: {other:?}"),
    }
    match events[1].decode().unwrap() {
        Event::GcEnd(gc) => assert_eq!(gc.count, 3),
        other => panic!("wrong event: {other:?}"),
    }
}

#[test]
fn torn_tail_ends_the_stream_cleanly() {
    let mut writer = LogWriter::new(Vec::new()).unwrap();
    writer.manifest().unwrap();
    let mut payload = Vec::new();
    ThreadStop {
        sampling_id: 1,
        thread_id: 9,
    }
    .encode(&mut payload);
    writer.event(kind::THREAD_STOP, 9, 5, &payload).unwrap();
    let mut bytes = writer.into_inner();
    // Cut into the middle of the last record.
    bytes.truncate(bytes.len() - 3);

    let mut reader = LogReader::new(&bytes[..]).unwrap();
    let events = reader.read_to_end().unwrap();
    assert!(events.is_empty());
}
