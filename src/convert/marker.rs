//! Per-thread marker state machines.
//!
//! Each runtime event family that produces interval markers gets one
//! explicit tagged variant (JIT compile pairing, GC begin/end, suspend-EE
//! and restart-EE windows) and one dispatcher routes events to them by
//! kind. Instance markers (heap stats, allocation ticks) have no state and
//! are emitted straight from the dispatcher.

use std::collections::HashMap;

use serde_json::json;

use crate::profile::{phase, Category, MarkerRow, MarkerTable};
use crate::record::{self, Event};

/// Destination for finished markers: the owning thread's marker table and
/// string array.
pub(crate) struct MarkerOut<'a> {
    pub markers: &'a mut MarkerTable,
    pub strings: &'a mut Vec<String>,
    pub string_map: &'a mut HashMap<String, usize>,
}

impl MarkerOut<'_> {
    fn intern(&mut self, name: &str) -> usize {
        if let Some(&index) = self.string_map.get(name) {
            return index;
        }
        let index = self.strings.len();
        self.strings.push(name.to_string());
        self.string_map.insert(name.to_string(), index);
        index
    }

    fn interval(
        &mut self,
        name: &str,
        start: f64,
        end: f64,
        category: Category,
        payload: Option<serde_json::Value>,
    ) {
        let name = self.intern(name);
        self.markers.push(MarkerRow {
            data: payload,
            name,
            start_time: Some(start.min(end)),
            end_time: Some(end),
            phase: phase::INTERVAL,
            category: category as usize,
        });
    }

    fn instance(
        &mut self,
        name: &str,
        time: f64,
        category: Category,
        payload: Option<serde_json::Value>,
    ) {
        let name = self.intern(name);
        self.markers.push(MarkerRow {
            data: payload,
            name,
            start_time: Some(time),
            end_time: None,
            phase: phase::INSTANCE,
            category: category as usize,
        });
    }
}

struct PendingJit {
    start: f64,
    full_name: String,
    il_size: u32,
}

struct GcOpen {
    start: f64,
    reason: record::GcReason,
    count: u32,
}

struct SuspendOpen {
    start: f64,
    reason: u32,
    count: u32,
}

/// One variant per state machine.
enum MarkerBuilder {
    Jit { pending: HashMap<u64, PendingJit> },
    Gc { stack: Vec<GcOpen> },
    SuspendEe { stack: Vec<SuspendOpen> },
    RestartEe { stack: Vec<f64> },
}

/// The four builders of one thread, plus the dispatcher.
pub(crate) struct Builders([MarkerBuilder; 4]);

impl Default for Builders {
    fn default() -> Self {
        Builders([
            MarkerBuilder::Jit {
                pending: HashMap::new(),
            },
            MarkerBuilder::Gc { stack: Vec::new() },
            MarkerBuilder::SuspendEe { stack: Vec::new() },
            MarkerBuilder::RestartEe { stack: Vec::new() },
        ])
    }
}

const JIT: usize = 0;
const GC: usize = 1;
const SUSPEND_EE: usize = 2;
const RESTART_EE: usize = 3;

impl Builders {
    /// Feeds one runtime event through the state machine it belongs to.
    /// Events with no marker semantics fall through untouched.
    pub fn dispatch(&mut self, event: &Event, time: f64, out: &mut MarkerOut<'_>) {
        match event {
            Event::MethodJittingStarted(e) => {
                let MarkerBuilder::Jit { pending } = &mut self.0[JIT] else {
                    unreachable!()
                };
                let full_name = if e.namespace.is_empty() {
                    e.name.clone()
                } else {
                    format!("{}.{}", e.namespace, e.name)
                };
                pending.insert(
                    e.method_id,
                    PendingJit {
                        start: time,
                        full_name,
                        il_size: e.il_size,
                    },
                );
            }
            Event::MethodLoadVerbose(e) => {
                let MarkerBuilder::Jit { pending } = &mut self.0[JIT] else {
                    unreachable!()
                };
                // A load with no pending start (rundown re-enumeration)
                // registers the method but makes no marker.
                if let Some(jit) = pending.remove(&e.method_id) {
                    out.interval(
                        "JitCompile",
                        jit.start,
                        time,
                        Category::Jit,
                        Some(json!({
                            "type": "JitCompile",
                            "fullName": jit.full_name,
                            "ilSize": jit.il_size,
                        })),
                    );
                }
            }
            Event::GcStart(e) => {
                let MarkerBuilder::Gc { stack } = &mut self.0[GC] else {
                    unreachable!()
                };
                stack.push(GcOpen {
                    start: time,
                    reason: e.reason,
                    count: e.count,
                });
            }
            Event::GcEnd(_) => {
                let MarkerBuilder::Gc { stack } = &mut self.0[GC] else {
                    unreachable!()
                };
                // LIFO; an end with nothing open is dropped.
                if let Some(open) = stack.pop() {
                    out.interval(
                        "GC",
                        open.start,
                        time,
                        Category::Gc,
                        Some(json!({
                            "type": "GC",
                            "reason": open.reason.name(),
                            "count": open.count,
                        })),
                    );
                }
            }
            Event::GcSuspendEeBegin(e) => {
                let MarkerBuilder::SuspendEe { stack } = &mut self.0[SUSPEND_EE] else {
                    unreachable!()
                };
                stack.push(SuspendOpen {
                    start: time,
                    reason: e.reason,
                    count: e.count,
                });
            }
            Event::GcSuspendEeEnd(_) => {
                let MarkerBuilder::SuspendEe { stack } = &mut self.0[SUSPEND_EE] else {
                    unreachable!()
                };
                if let Some(open) = stack.pop() {
                    out.interval(
                        "GCSuspendEE",
                        open.start,
                        time,
                        Category::Gc,
                        Some(json!({
                            "type": "GCSuspendEE",
                            "reason": record::runtime::suspend_reason_name(open.reason),
                            "count": open.count,
                        })),
                    );
                }
            }
            Event::GcRestartEeBegin(_) => {
                let MarkerBuilder::RestartEe { stack } = &mut self.0[RESTART_EE] else {
                    unreachable!()
                };
                stack.push(time);
            }
            Event::GcRestartEeEnd(_) => {
                let MarkerBuilder::RestartEe { stack } = &mut self.0[RESTART_EE] else {
                    unreachable!()
                };
                if let Some(start) = stack.pop() {
                    out.interval("GCRestartEE", start, time, Category::Gc, None);
                }
            }
            Event::GcHeapStats(e) => {
                out.instance(
                    "GCHeapStats",
                    time,
                    Category::Gc,
                    Some(json!({
                        "type": "GCHeapStats",
                        "totalHeapSize": e.total_heap_size(),
                        "gen0Size": e.gen_size[0],
                        "gen1Size": e.gen_size[1],
                        "gen2Size": e.gen_size[2],
                        "lohSize": e.gen_size[3],
                        "gen0Promoted": e.promoted[0],
                        "gen1Promoted": e.promoted[1],
                        "gen2Promoted": e.promoted[2],
                        "lohPromoted": e.promoted[3],
                        "finalizationPromotedSize": e.finalization_promoted_size,
                        "finalizationPromotedCount": e.finalization_promoted_count,
                        "pinnedObjectCount": e.pinned_object_count,
                        "gcHandleCount": e.gc_handle_count,
                    })),
                );
            }
            Event::GcAllocationTick(e) => {
                out.instance(
                    "GCAllocationTick",
                    time,
                    Category::Gc,
                    Some(json!({
                        "type": "GCAllocationTick",
                        "amount": e.amount64,
                        "kind": e.kind.name(),
                        "typeName": e.type_name,
                        "heapIndex": e.heap_index,
                    })),
                );
            }
            _ => {}
        }
    }
}
