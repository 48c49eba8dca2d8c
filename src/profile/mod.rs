//! The Firefox Profiler data model.
//!
//! Plain data matching the viewer's JSON schema: camelCase on the wire,
//! absent optionals omitted, and every columnar table serialized as
//! parallel arrays with an explicit `length`. `pid`/`tid` are strings in
//! serialized form, marker phases are integers 0..3, thread CPU deltas are
//! nanoseconds and times are milliseconds.

use serde::Serialize;

pub mod write;

#[cfg(test)]
mod test;

/// Schema versions the viewer accepts this layout as.
pub const VERSION: u32 = 29;
pub const PREPROCESSED_PROFILE_VERSION: u32 = 51;

/// Marker phases, wire order.
pub mod phase {
    pub const INSTANCE: u8 = 0;
    pub const INTERVAL: u8 = 1;
    pub const INTERVAL_START: u8 = 2;
    pub const INTERVAL_END: u8 = 3;
}

/// Fixed display buckets; [`Frame`] categories are indices into
/// [`categories`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Category {
    Other = 0,
    Kernel = 1,
    Native = 2,
    Managed = 3,
    Gc = 4,
    Jit = 5,
    Clr = 6,
}

#[derive(Clone, Debug, Serialize)]
pub struct CategoryInfo {
    pub name: &'static str,
    pub color: &'static str,
    pub subcategories: Vec<&'static str>,
}

/// The category table, in the exact index order [`Category`] encodes.
pub fn categories() -> Vec<CategoryInfo> {
    let info = |name, color| CategoryInfo {
        name,
        color,
        subcategories: vec!["Other"],
    };
    vec![
        info("Other", "grey"),
        info("Kernel", "orange"),
        info("Native", "blue"),
        info("Managed", "green"),
        info("GC", "yellow"),
        info("JIT", "purple"),
        info("CLR", "lightblue"),
    ]
}

/// Serialized as a string; the viewer expects string process ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Pid(pub String);

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        Pid(pid.to_string())
    }
}

/// Serialized as a string, like [`Pid`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Tid(pub String);

impl From<u64> for Tid {
    fn from(tid: u64) -> Self {
        Tid(tid.to_string())
    }
}

// Columnar table: parallel per-field vectors, one shared `length`, and a
// `push` that keeps them aligned. The length invariant is checked on every
// append.
macro_rules! columnar {
    (
        $(#[$tmeta:meta])*
        $table:ident / $row:ident {
            $($(#[$fmeta:meta])* $field:ident: $ty:ty,)*
        }
        $(extra { $($efield:ident: $ety:ty = $edefault:expr,)* })?
    ) => {
        #[derive(Clone, Debug)]
        pub struct $row {
            $(pub $field: $ty,)*
        }

        $(#[$tmeta])*
        #[derive(Clone, Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $table {
            pub length: usize,
            $($(#[$fmeta])* pub $field: Vec<$ty>,)*
            $($(pub $efield: $ety,)*)?
        }

        impl Default for $table {
            fn default() -> Self {
                $table {
                    length: 0,
                    $($field: Vec::new(),)*
                    $($($efield: $edefault,)*)?
                }
            }
        }

        impl $table {
            /// Appends one row and returns its index.
            pub fn push(&mut self, row: $row) -> usize {
                let index = self.length;
                $(self.$field.push(row.$field);)*
                self.length += 1;
                $(assert_eq!(self.$field.len(), self.length, "column length broken");)*
                index
            }
        }
    };
}

columnar!(
    SampleTable / SampleRow {
        stack: Option<usize>,
        time: f64,
        weight: f64,
        #[serde(rename = "threadCPUDelta")]
        thread_cpu_delta: u64,
    }
    extra { weight_type: &'static str = "samples", }
);

columnar!(
    MarkerTable / MarkerRow {
        data: Option<serde_json::Value>,
        name: usize,
        start_time: Option<f64>,
        end_time: Option<f64>,
        phase: u8,
        category: usize,
    }
);

columnar!(
    StackTable / StackRow {
        frame: usize,
        category: usize,
        subcategory: usize,
        prefix: Option<usize>,
    }
);

columnar!(
    FrameTable / FrameRow {
        /// Module-relative code offset, or -1 with no owning module.
        address: i64,
        inline_depth: u32,
        category: Option<usize>,
        subcategory: Option<usize>,
        func: usize,
        native_symbol: Option<usize>,
        line: Option<u32>,
        column: Option<u32>,
    }
);

columnar!(
    FuncTable / FuncRow {
        name: usize,
        #[serde(rename = "isJS")]
        is_js: bool,
        #[serde(rename = "relevantForJS")]
        relevant_for_js: bool,
        /// Index into the resource table, -1 for none.
        resource: i64,
        file_name: Option<usize>,
        line_number: Option<u32>,
        column_number: Option<u32>,
    }
);

columnar!(
    ResourceTable / ResourceRow {
        lib: Option<usize>,
        name: usize,
        host: Option<usize>,
        #[serde(rename = "type")]
        kind: u32,
    }
);

columnar!(
    CounterSampleTable / CounterSampleRow {
        time: f64,
        /// How many updates contributed since the previous sample.
        number: u64,
        /// Delta against the previous sample, never an absolute value.
        count: i64,
    }
);

/// Resource kind for a library (the only kind this profiler produces).
pub const RESOURCE_TYPE_LIBRARY: u32 = 1;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lib {
    pub arch: String,
    pub name: String,
    pub path: String,
    pub debug_name: String,
    pub debug_path: String,
    pub breakpad_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub name: String,
    pub category: String,
    pub description: String,
    pub pid: Pid,
    pub main_thread_index: usize,
    pub samples: CounterSampleTable,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub process_type: String,
    pub process_startup_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_shutdown_time: Option<f64>,
    pub register_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unregister_time: Option<f64>,
    pub paused_ranges: Vec<()>,
    pub name: String,
    pub is_main_thread: bool,
    pub process_name: String,
    pub pid: Pid,
    pub tid: Tid,
    pub samples: SampleTable,
    pub markers: MarkerTable,
    pub stack_table: StackTable,
    pub frame_table: FrameTable,
    pub string_array: Vec<String>,
    pub func_table: FuncTable,
    pub resource_table: ResourceTable,
    /// Accumulated CPU time; drives initially-visible selection, not part
    /// of the serialized schema.
    #[serde(skip)]
    pub cpu_time_ms: f64,
}

impl Thread {
    pub fn new(pid: u32, tid: u64, name: impl Into<String>) -> Thread {
        Thread {
            process_type: "default".into(),
            process_startup_time: 0.0,
            process_shutdown_time: None,
            register_time: 0.0,
            unregister_time: None,
            paused_ranges: Vec::new(),
            name: name.into(),
            is_main_thread: false,
            process_name: String::new(),
            pid: pid.into(),
            tid: tid.into(),
            samples: SampleTable::default(),
            markers: MarkerTable::default(),
            stack_table: StackTable::default(),
            frame_table: FrameTable::default(),
            string_array: Vec::new(),
            func_table: FuncTable::default(),
            resource_table: ResourceTable::default(),
            cpu_time_ms: 0.0,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleUnits {
    pub time: &'static str,
    pub event_delay: &'static str,
    #[serde(rename = "threadCPUDelta")]
    pub thread_cpu_delta: &'static str,
}

impl Default for SampleUnits {
    fn default() -> Self {
        SampleUnits {
            time: "ms",
            event_delay: "ms",
            thread_cpu_delta: "ns",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerSchemaField {
    pub key: &'static str,
    pub label: &'static str,
    pub format: &'static str,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerSchema {
    pub name: &'static str,
    pub tooltip_label: &'static str,
    pub display: Vec<&'static str>,
    pub data: Vec<MarkerSchemaField>,
}

/// Schemas for the marker payloads the converter produces. Known fields
/// are typed here; anything else in a payload map passes through untouched.
pub fn marker_schemas() -> Vec<MarkerSchema> {
    let field = |key, label, format| MarkerSchemaField { key, label, format };
    let displays = || vec!["marker-chart", "marker-table", "timeline-overview"];
    vec![
        MarkerSchema {
            name: "JitCompile",
            tooltip_label: "JIT compile",
            display: displays(),
            data: vec![
                field("fullName", "Method", "string"),
                field("ilSize", "IL size", "bytes"),
            ],
        },
        MarkerSchema {
            name: "GC",
            tooltip_label: "Garbage collection",
            display: displays(),
            data: vec![
                field("reason", "Reason", "string"),
                field("count", "Count", "integer"),
            ],
        },
        MarkerSchema {
            name: "GCSuspendEE",
            tooltip_label: "GC suspend EE",
            display: displays(),
            data: vec![
                field("reason", "Reason", "string"),
                field("count", "Count", "integer"),
            ],
        },
        MarkerSchema {
            name: "GCRestartEE",
            tooltip_label: "GC restart EE",
            display: displays(),
            data: Vec::new(),
        },
        MarkerSchema {
            name: "GCHeapStats",
            tooltip_label: "GC heap stats",
            display: displays(),
            data: vec![
                field("totalHeapSize", "Total heap", "bytes"),
                field("gen0Size", "Gen 0", "bytes"),
                field("gen1Size", "Gen 1", "bytes"),
                field("gen2Size", "Gen 2", "bytes"),
                field("lohSize", "LOH", "bytes"),
            ],
        },
        MarkerSchema {
            name: "GCAllocationTick",
            tooltip_label: "Allocation",
            display: displays(),
            data: vec![
                field("amount", "Amount", "bytes"),
                field("kind", "Kind", "string"),
                field("typeName", "Type", "string"),
                field("heapIndex", "Heap", "integer"),
            ],
        },
    ]
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Sampling interval in ms.
    pub interval: f64,
    pub start_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    pub process_type: u32,
    pub product: String,
    pub stackwalk: u8,
    pub version: u32,
    pub preprocessed_profile_version: u32,
    #[serde(rename = "physicalCPUs", skip_serializing_if = "Option::is_none")]
    pub physical_cpus: Option<u64>,
    #[serde(rename = "logicalCPUs", skip_serializing_if = "Option::is_none")]
    pub logical_cpus: Option<u64>,
    pub oscpu: String,
    pub platform: String,
    pub symbolicated: bool,
    pub imported_from: String,
    pub categories: Vec<CategoryInfo>,
    pub marker_schema: Vec<MarkerSchema>,
    pub sample_units: SampleUnits,
    pub initial_visible_threads: Vec<usize>,
    pub initial_selected_threads: Vec<usize>,
    pub uses_only_one_stack_type: bool,
    pub does_not_use_frame_implementation: bool,
    pub source_code_is_not_on_searchfox: bool,
}

impl Default for Meta {
    fn default() -> Self {
        Meta {
            interval: 1.0,
            start_time: 0.0,
            end_time: None,
            process_type: 0,
            product: "ultra".into(),
            stackwalk: 1,
            version: VERSION,
            preprocessed_profile_version: PREPROCESSED_PROFILE_VERSION,
            physical_cpus: None,
            logical_cpus: None,
            oscpu: String::new(),
            platform: String::new(),
            symbolicated: true,
            imported_from: "ultra".into(),
            categories: categories(),
            marker_schema: marker_schemas(),
            sample_units: SampleUnits::default(),
            initial_visible_threads: Vec::new(),
            initial_selected_threads: Vec::new(),
            uses_only_one_stack_type: true,
            does_not_use_frame_implementation: true,
            source_code_is_not_on_searchfox: true,
        }
    }
}

/// The whole trace. Owns every table; all cross-references are integer
/// indices into sibling tables, so there are no cycles anywhere.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub meta: Meta,
    pub libs: Vec<Lib>,
    pub counters: Vec<Counter>,
    pub threads: Vec<Thread>,
}
