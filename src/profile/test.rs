use serde_json::{json, Value};

use super::*;

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap()
}

#[test]
fn tables_keep_columns_aligned() {
    let mut samples = SampleTable::default();
    for i in 0..5 {
        samples.push(SampleRow {
            stack: Some(i),
            time: i as f64,
            weight: 1.0,
            thread_cpu_delta: 100,
        });
    }
    assert_eq!(samples.length, 5);
    assert_eq!(samples.stack.len(), 5);
    assert_eq!(samples.time.len(), 5);
    assert_eq!(samples.thread_cpu_delta.len(), 5);

    let j = to_json(&samples);
    assert_eq!(j["length"], 5);
    assert_eq!(j["weightType"], "samples");
    assert_eq!(j["threadCPUDelta"].as_array().unwrap().len(), 5);
}

#[test]
fn pid_and_tid_serialize_as_strings() {
    let thread = Thread::new(1234, 5678, "Main");
    let j = to_json(&thread);
    assert_eq!(j["pid"], json!("1234"));
    assert_eq!(j["tid"], json!("5678"));
    assert_eq!(j["isMainThread"], json!(false));
    // Absent optionals are omitted, not null.
    assert!(j.get("processShutdownTime").is_none());
    assert!(j.get("unregisterTime").is_none());
}

#[test]
fn marker_phases_are_wire_integers() {
    assert_eq!(phase::INSTANCE, 0);
    assert_eq!(phase::INTERVAL, 1);
    assert_eq!(phase::INTERVAL_START, 2);
    assert_eq!(phase::INTERVAL_END, 3);

    let mut markers = MarkerTable::default();
    markers.push(MarkerRow {
        data: Some(json!({"type": "GC", "reason": "AllocLarge", "count": 3})),
        name: 0,
        start_time: Some(100.0),
        end_time: Some(150.0),
        phase: phase::INTERVAL,
        category: Category::Gc as usize,
    });
    let j = to_json(&markers);
    assert_eq!(j["phase"][0], json!(1));
    assert_eq!(j["startTime"][0], json!(100.0));
    // Unknown payload fields pass through untouched.
    assert_eq!(j["data"][0]["reason"], json!("AllocLarge"));
}

#[test]
fn category_table_matches_the_fixed_indices() {
    let cats = categories();
    assert_eq!(cats.len(), 7);
    assert_eq!(cats[Category::Other as usize].name, "Other");
    assert_eq!(cats[Category::Kernel as usize].name, "Kernel");
    assert_eq!(cats[Category::Native as usize].name, "Native");
    assert_eq!(cats[Category::Managed as usize].name, "Managed");
    assert_eq!(cats[Category::Gc as usize].name, "GC");
    assert_eq!(cats[Category::Jit as usize].name, "JIT");
    assert_eq!(cats[Category::Clr as usize].name, "CLR");
}

#[test]
fn meta_serializes_units_and_versions() {
    let meta = Meta::default();
    let j = to_json(&meta);
    assert_eq!(j["version"], json!(29));
    assert_eq!(j["preprocessedProfileVersion"], json!(51));
    assert_eq!(j["sampleUnits"]["time"], json!("ms"));
    assert_eq!(j["sampleUnits"]["threadCPUDelta"], json!("ns"));
    assert!(j.get("endTime").is_none());
    assert_eq!(j["markerSchema"].as_array().unwrap().len(), 6);
}

#[test]
fn profile_is_camel_case_throughout() {
    let mut profile = Profile::default();
    profile.threads.push(Thread::new(1, 2, "Main"));
    let j = to_json(&profile);
    let thread = &j["threads"][0];
    assert!(thread.get("stackTable").is_some());
    assert!(thread.get("frameTable").is_some());
    assert!(thread.get("stringArray").is_some());
    assert!(thread.get("funcTable").is_some());
    assert!(thread.get("resourceTable").is_some());
    assert!(thread.get("processStartupTime").is_some());
    assert!(thread.get("cpu_time_ms").is_none(), "internal field leaked");
    assert!(thread.get("cpuTimeMs").is_none(), "internal field leaked");
}

#[test]
fn gzip_writer_produces_a_readable_stream() {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profile.json.gz");
    let mut profile = Profile::default();
    profile.threads.push(Thread::new(7, 7, "Main"));
    write::write_gz(&path, &profile).unwrap();

    let mut decoder = GzDecoder::new(std::fs::File::open(&path).unwrap());
    let mut text = String::new();
    decoder.read_to_string(&mut text).unwrap();
    let j: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(j["threads"][0]["pid"], json!("7"));
}
