//! Event assembler: merges the sampler and runtime streams into a profile.
//!
//! Two passes over the time-merged streams. The first builds the module and
//! method registries (so that methods the rundown session reports late
//! still symbolicate every sample); the second walks threads, samples and
//! markers in delivery order, interning frames, stacks and strings into the
//! per-thread columnar tables.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::codec::DeltaDecoder;
use crate::profile::{
    Category, Counter, CounterSampleRow, CounterSampleTable, FrameRow, FuncRow, Lib, Profile,
    ResourceRow, SampleRow, StackRow, Thread, RESOURCE_TYPE_LIBRARY,
};
use crate::record::{CallStack, Event, LogEvent, MethodLoadVerbose};
use crate::registry::{MethodRecord, MethodRegistry, ModuleRegistry};

mod marker;

#[cfg(test)]
mod test;

/// Module-name classification hints.
///
/// The runtime and JIT library names differ per OS and have changed between
/// runtime versions, so the match set is data: callers can override it and
/// the defaults carry both the Windows and the Unix spellings.
#[derive(Clone, Debug)]
pub struct CategoryRules {
    pub runtime_core_modules: Vec<String>,
    pub jit_modules: Vec<String>,
    pub gc_method_prefixes: Vec<String>,
}

impl Default for CategoryRules {
    fn default() -> Self {
        CategoryRules {
            runtime_core_modules: vec![
                "coreclr.dll".into(),
                "libcoreclr.so".into(),
                "libcoreclr.dylib".into(),
            ],
            jit_modules: vec![
                "clrjit.dll".into(),
                "libclrjit.so".into(),
                "libclrjit.dylib".into(),
            ],
            gc_method_prefixes: vec!["WKS::gc".into(), "SVR::gc".into()],
        }
    }
}

impl CategoryRules {
    fn is_jit_module(&self, file_name: &str) -> bool {
        matches_any(&self.jit_modules, file_name)
    }

    fn is_runtime_module(&self, file_name: &str) -> bool {
        matches_any(&self.runtime_core_modules, file_name)
    }

    fn is_gc_method(&self, full_name: &str) -> bool {
        self.gc_method_prefixes
            .iter()
            .any(|prefix| starts_with_ignore_case(full_name, prefix))
    }
}

fn matches_any(names: &[String], file_name: &str) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(file_name))
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub pid: u32,
    pub process_name: String,
    pub interval_ms: f64,
    /// Threads above this much accumulated CPU become initially visible.
    pub min_visible_cpu_ms: f64,
    /// Unix time of the session start, milliseconds.
    pub start_time_unix_ms: f64,
    pub logical_cpus: Option<u64>,
    pub physical_cpus: Option<u64>,
    pub rules: CategoryRules,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            pid: 0,
            process_name: String::new(),
            interval_ms: 1.0,
            min_visible_cpu_ms: 10.0,
            start_time_unix_ms: 0.0,
            logical_cpus: None,
            physical_cpus: None,
            rules: CategoryRules::default(),
        }
    }
}

/// Merges the given streams by timestamp and assembles the profile.
///
/// Within one stream, order is preserved for equal timestamps; across
/// streams there is no ordering guarantee beyond the timestamps themselves.
pub fn convert(streams: Vec<Vec<LogEvent>>, opts: ConvertOptions) -> Profile {
    let mut merged: Vec<LogEvent> = streams.into_iter().flatten().collect();
    merged.sort_by_key(|ev| ev.timestamp_ns);

    let mut converter = Converter::new(opts);
    converter.build_registries(&merged);
    for ev in &merged {
        converter.process(ev);
    }
    converter.finish()
}

struct ThreadBuild {
    thread: Thread,
    strings: HashMap<String, usize>,
    frames: HashMap<u64, usize>,
    stacks: HashMap<(Option<usize>, usize), usize>,
    funcs: HashMap<(i64, String), usize>,
    resources: HashMap<usize, usize>,
    builders: marker::Builders,
    last_sample_time: f64,
    last_switch_in: f64,
    last_run_state: i32,
}

struct Converter {
    opts: ConvertOptions,
    modules: ModuleRegistry,
    methods: MethodRegistry,
    /// Paths of managed assemblies; frames inside them are `Managed`.
    managed_paths: HashSet<String>,
    /// Runtime module id -> IL path, for methods without a native module.
    managed_module_paths: HashMap<u64, String>,
    threads: Vec<ThreadBuild>,
    by_tid: HashMap<u64, usize>,
    libs: Vec<Lib>,
    lib_by_path: HashMap<String, usize>,
    decoder: DeltaDecoder,
    heap_stats: Vec<(f64, u64)>,
    platform: Option<String>,
    end_time: f64,
    decode_errors: u64,
}

impl Converter {
    fn new(opts: ConvertOptions) -> Converter {
        Converter {
            opts,
            modules: ModuleRegistry::new(),
            methods: MethodRegistry::new(),
            managed_paths: HashSet::new(),
            managed_module_paths: HashMap::new(),
            threads: Vec::new(),
            by_tid: HashMap::new(),
            libs: Vec::new(),
            lib_by_path: HashMap::new(),
            decoder: DeltaDecoder::new(),
            heap_stats: Vec::new(),
            platform: None,
            end_time: 0.0,
            decode_errors: 0,
        }
    }

    /// First pass: loader and method state, applied in time order so the
    /// rundown re-enumeration refreshes anything unloaded mid-session.
    fn build_registries(&mut self, merged: &[LogEvent]) {
        for ev in merged {
            let Ok(event) = ev.decode() else { continue };
            match event {
                Event::Module(m) => match m.kind {
                    crate::record::ModuleEventKind::Unloaded => {
                        self.modules.remove(m.load_address, ev.timestamp_ns);
                    }
                    _ => {
                        let uuid = (m.uuid != [0; 16]).then_some(m.uuid);
                        self.modules
                            .insert(m.path, m.load_address, m.size, uuid, ev.timestamp_ns);
                    }
                },
                Event::RuntimeModuleLoad(m) => {
                    self.managed_module_paths
                        .insert(m.module_id, m.il_path.clone());
                    if !m.il_path.is_empty() {
                        self.managed_paths.insert(m.il_path);
                    }
                    if !m.native_path.is_empty() {
                        self.managed_paths.insert(m.native_path);
                    }
                }
                Event::MethodLoadVerbose(m) => {
                    self.methods.insert(method_record(&m, ev.thread_id));
                }
                Event::MethodUnloadVerbose(m) => self.methods.remove(m.method_id),
                Event::IlToNativeMap(m) => {
                    self.methods
                        .attach_il_map(m.method_id, &m.il_offsets, &m.native_offsets);
                }
                _ => {}
            }
        }
    }

    fn process(&mut self, ev: &LogEvent) {
        let event = match ev.decode() {
            Ok(event) => event,
            Err(e) => {
                self.decode_errors += 1;
                if self.decode_errors <= 3 {
                    warn!(kind = ev.kind, error = %e, "undecodable event");
                }
                return;
            }
        };
        let time = ev.timestamp_ns as f64 / 1_000_000.0;
        self.end_time = self.end_time.max(time);

        match &event {
            Event::ProcessStart(p) => {
                self.platform = Some(p.os.clone());
            }
            Event::ThreadStart(ts) => {
                if self.by_tid.contains_key(&ts.thread_id) {
                    // The input occasionally reports the same thread twice;
                    // root cause unknown upstream, first record wins.
                    warn!(tid = ts.thread_id, "duplicate thread in input, deduplicated");
                } else {
                    let name = (!ts.name.is_empty()).then(|| ts.name.clone());
                    self.ensure_thread(ts.thread_id, time, name);
                }
            }
            Event::ThreadStop(ts) => {
                if let Some(&index) = self.by_tid.get(&ts.thread_id) {
                    self.threads[index].thread.unregister_time = Some(time);
                }
                self.decoder.forget(ts.thread_id);
            }
            Event::CallStack(cs) => self.handle_sample(cs, time),
            Event::Module(_)
            | Event::RuntimeModuleLoad(_)
            | Event::RuntimeModuleUnload(_)
            | Event::MethodUnloadVerbose(_)
            | Event::IlToNativeMap(_) => {
                // Registry passes own these.
            }
            _ => {
                if let Event::GcHeapStats(stats) = &event {
                    self.heap_stats.push((time, stats.total_heap_size()));
                }
                let index = self.ensure_thread(ev.thread_id, time, None);
                let build = &mut self.threads[index];
                let mut out = marker::MarkerOut {
                    markers: &mut build.thread.markers,
                    strings: &mut build.thread.string_array,
                    string_map: &mut build.strings,
                };
                build.builders.dispatch(&event, time, &mut out);
            }
        }
    }

    fn ensure_thread(&mut self, tid: u64, time: f64, name: Option<String>) -> usize {
        if let Some(&index) = self.by_tid.get(&tid) {
            return index;
        }
        let first = self.threads.is_empty();
        let name = name.unwrap_or_else(|| {
            if first {
                "Main".into()
            } else {
                format!("Thread {tid}")
            }
        });
        let mut thread = Thread::new(self.opts.pid, tid, name);
        thread.is_main_thread = first;
        thread.process_name = self.opts.process_name.clone();
        thread.register_time = time;
        let index = self.threads.len();
        self.threads.push(ThreadBuild {
            thread,
            strings: HashMap::new(),
            frames: HashMap::new(),
            stacks: HashMap::new(),
            funcs: HashMap::new(),
            resources: HashMap::new(),
            builders: marker::Builders::default(),
            last_sample_time: time,
            last_switch_in: time,
            last_run_state: 1,
        });
        self.by_tid.insert(tid, index);
        index
    }

    fn handle_sample(&mut self, cs: &CallStack, time: f64) {
        let index = self.ensure_thread(cs.thread_id, time, None);
        let full = self.decoder.decode(
            cs.thread_id,
            cs.previous_frame_count.max(0) as u32,
            &cs.frames,
        );

        // Resolve every address to a frame before touching the stack
        // table; resolution interns funcs/resources/strings as it goes.
        let mut resolved = Vec::with_capacity(full.len());
        for &addr in &full {
            resolved.push(self.intern_frame(index, addr));
        }
        let build = &mut self.threads[index];
        let mut prefix = None;
        for &(frame, category) in resolved.iter().rev() {
            let key = (prefix, frame);
            let stack_index = match build.stacks.get(&key) {
                Some(&existing) => existing,
                None => {
                    let pushed = build.thread.stack_table.push(StackRow {
                        frame,
                        category,
                        subcategory: 0,
                        prefix,
                    });
                    build.stacks.insert(key, pushed);
                    pushed
                }
            };
            prefix = Some(stack_index);
        }

        // Delivery order is kept even when timestamps regress; the time
        // delta is clamped so sample times never go backwards.
        let delta_ms = (time - build.last_sample_time).max(0.0);
        let sample_time = build.last_sample_time + delta_ms;
        build.last_sample_time = sample_time;

        // CPU delta: the span since the thread last switched in, in
        // nanoseconds, clamped non-negative. Switch-ins are observed as
        // run-state transitions between samples, and a charged sample
        // becomes the new switch-in point, so a continuous running window
        // is charged once. Waiting samples charge nothing.
        if cs.run_state == 0 && build.last_run_state != 0 {
            build.last_switch_in = sample_time;
        }
        let cpu_delta_ns = if cs.run_state == 0 {
            let delta = ((sample_time - build.last_switch_in) * 1_000_000.0).round().max(0.0) as u64;
            build.last_switch_in = sample_time;
            delta
        } else {
            0
        };
        build.last_run_state = cs.run_state;
        build.thread.cpu_time_ms += cpu_delta_ns as f64 / 1_000_000.0;

        build.thread.samples.push(SampleRow {
            stack: prefix,
            time: sample_time,
            weight: 1.0,
            thread_cpu_delta: cpu_delta_ns,
        });
    }

    /// Interns `addr` as a frame on thread `index`, returning
    /// `(frame_index, category_index)`.
    fn intern_frame(&mut self, index: usize, addr: u64) -> (usize, usize) {
        if let Some(&frame) = self.threads[index].frames.get(&addr) {
            let category = self.threads[index].thread.frame_table.category[frame].unwrap_or(0);
            return (frame, category);
        }

        let module = self.modules.lookup(addr);
        let method = self.methods.lookup(addr).cloned();

        let mut category = self.categorize(addr, module);
        let name = match &method {
            Some(m) => {
                let full = m.full_name();
                if self.opts.rules.is_gc_method(&full) {
                    category = Category::Gc;
                }
                full
            }
            // Unresolvable code address: the hex address is the name and
            // the frame gets no resource.
            None => format!("{addr:#x}"),
        };

        let lib = match (module, &method) {
            (Some(id), _) => {
                let record = self.modules.record(id).clone();
                Some(self.intern_lib(&record.path, record.uuid))
            }
            (None, Some(m)) => self
                .managed_module_paths
                .get(&m.module_id)
                .cloned()
                .map(|path| self.intern_lib(&path, None)),
            (None, None) => None,
        };

        let build = &mut self.threads[index];
        let resource = match lib {
            Some(lib_index) => {
                let resource = match build.resources.get(&lib_index) {
                    Some(&existing) => existing,
                    None => {
                        let lib_name = self.libs[lib_index].name.clone();
                        let name_index = intern_string(build, &lib_name);
                        let pushed = build.thread.resource_table.push(ResourceRow {
                            lib: Some(lib_index),
                            name: name_index,
                            host: None,
                            kind: RESOURCE_TYPE_LIBRARY,
                        });
                        build.resources.insert(lib_index, pushed);
                        pushed
                    }
                };
                resource as i64
            }
            None => -1,
        };

        let func = match build.funcs.get(&(resource, name.clone())) {
            Some(&existing) => existing,
            None => {
                let name_index = intern_string(build, &name);
                let pushed = build.thread.func_table.push(FuncRow {
                    name: name_index,
                    is_js: false,
                    relevant_for_js: false,
                    resource,
                    file_name: None,
                    line_number: None,
                    column_number: None,
                });
                build.funcs.insert((resource, name), pushed);
                pushed
            }
        };

        let address = match module {
            Some(id) => (addr - self.modules.record(id).base) as i64,
            None => match &method {
                Some(m) => (addr - m.start_address) as i64,
                None => -1,
            },
        };
        let frame = build.thread.frame_table.push(FrameRow {
            address,
            inline_depth: 0,
            category: Some(category as usize),
            subcategory: Some(0),
            func,
            native_symbol: None,
            line: None,
            column: None,
        });
        build.frames.insert(addr, frame);
        (frame, category as usize)
    }

    fn categorize(&self, addr: u64, module: Option<crate::registry::ModuleId>) -> Category {
        if let Some(id) = module {
            let record = self.modules.record(id);
            if self.managed_paths.contains(&record.path) {
                return Category::Managed;
            }
            if addr >> 56 == 0xFF {
                return Category::Kernel;
            }
            let file = record.file_name();
            if self.opts.rules.is_jit_module(file) {
                return Category::Jit;
            }
            if self.opts.rules.is_runtime_module(file) {
                return Category::Clr;
            }
            Category::Native
        } else if addr >> 56 == 0xFF {
            Category::Kernel
        } else {
            Category::Native
        }
    }

    fn intern_lib(&mut self, path: &str, uuid: Option<[u8; 16]>) -> usize {
        if let Some(&index) = self.lib_by_path.get(path) {
            return index;
        }
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let breakpad_id = uuid
            .map(|u| format!("{}0", hex_upper(&u)))
            .unwrap_or_else(|| "0".repeat(33));
        let index = self.libs.len();
        self.libs.push(Lib {
            arch: std::env::consts::ARCH.into(),
            name: name.clone(),
            path: path.into(),
            debug_name: name,
            debug_path: path.into(),
            breakpad_id,
            code_id: uuid.map(|u| hex_upper(&u)),
        });
        self.lib_by_path.insert(path.into(), index);
        index
    }

    fn finish(mut self) -> Profile {
        let mut profile = Profile::default();
        profile.meta.interval = self.opts.interval_ms;
        profile.meta.start_time = self.opts.start_time_unix_ms;
        profile.meta.end_time = Some(self.end_time);
        profile.meta.logical_cpus = self.opts.logical_cpus;
        profile.meta.physical_cpus = self.opts.physical_cpus;
        if !self.opts.process_name.is_empty() {
            profile.meta.product = self.opts.process_name.clone();
        }
        if let Some(platform) = self.platform.take() {
            profile.meta.oscpu = platform.clone();
            profile.meta.platform = platform;
        }

        // Memory track: deltas of total heap size, with the synthetic zero
        // first sample the viewer drops.
        if !self.heap_stats.is_empty() {
            let mut samples = CounterSampleTable::default();
            samples.push(CounterSampleRow {
                time: 0.0,
                number: 0,
                count: 0,
            });
            let mut previous = 0u64;
            for &(time, total) in &self.heap_stats {
                samples.push(CounterSampleRow {
                    time,
                    number: 1,
                    count: total as i64 - previous as i64,
                });
                previous = total;
            }
            let main_thread_index = self
                .threads
                .iter()
                .position(|t| t.thread.is_main_thread)
                .unwrap_or(0);
            profile.counters.push(Counter {
                name: "GCHeapStats".into(),
                category: "Memory".into(),
                description: "Total GC heap size".into(),
                pid: self.opts.pid.into(),
                main_thread_index,
                samples,
            });
        }

        // Initially-visible selection: everything above the CPU floor, and
        // the busiest thread always, selected even when below the floor.
        let mut busiest: Option<(usize, f64)> = None;
        for (index, build) in self.threads.iter().enumerate() {
            let cpu = build.thread.cpu_time_ms;
            if cpu > self.opts.min_visible_cpu_ms {
                profile.meta.initial_visible_threads.push(index);
            }
            if busiest.map_or(true, |(_, best)| cpu > best) {
                busiest = Some((index, cpu));
            }
        }
        if let Some((index, _)) = busiest {
            if !profile.meta.initial_visible_threads.contains(&index) {
                profile.meta.initial_visible_threads.push(index);
                profile.meta.initial_visible_threads.sort_unstable();
            }
            profile.meta.initial_selected_threads.push(index);
        }

        debug!(
            threads = self.threads.len(),
            libs = self.libs.len(),
            "conversion finished"
        );
        profile.libs = self.libs;
        profile.threads = self.threads.into_iter().map(|b| b.thread).collect();
        profile
    }
}

fn intern_string(build: &mut ThreadBuild, s: &str) -> usize {
    if let Some(&index) = build.strings.get(s) {
        return index;
    }
    let index = build.thread.string_array.len();
    build.thread.string_array.push(s.to_string());
    build.strings.insert(s.to_string(), index);
    index
}

fn method_record(m: &MethodLoadVerbose, jit_thread_id: u64) -> MethodRecord {
    MethodRecord {
        method_id: m.method_id,
        module_id: m.module_id,
        jit_thread_id,
        namespace: m.namespace.clone(),
        name: m.name.clone(),
        signature: m.signature.clone(),
        token: m.token,
        flags: m.flags,
        start_address: m.start_address,
        size: m.size,
        il_map: Vec::new(),
    }
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
