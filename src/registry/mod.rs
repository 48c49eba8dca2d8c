//! Loaded-code bookkeeping: native modules and JITted methods.
//!
//! Both registries answer `address -> owner` for the converter and keep
//! their full load/unload history so late symbolication still sees records
//! that were gone by the end of the session.

use std::collections::HashMap;

pub use method::{IlMapping, MethodRecord, MethodRegistry};

pub mod method;


pub type ModuleId = u32;

#[derive(Clone, Debug)]
pub struct ModuleRecord {
    pub path: String,
    pub base: u64,
    pub size: u64,
    pub uuid: Option<[u8; 16]>,
    pub load_time_ns: u64,
    pub unload_time_ns: Option<u64>,
}

impl ModuleRecord {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// Last path component, used for display and classification.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Tracks loaded/unloaded code regions with binary-search lookup over the
/// currently active set.
///
/// Active regions are pairwise disjoint; a load at an already-active base
/// unloads the older record first. During a load/unload race the ranges can
/// briefly overlap and lookup prefers the most recent load.
#[derive(Default)]
pub struct ModuleRegistry {
    records: Vec<ModuleRecord>,
    // (begin, end, id), sorted by begin; active records only.
    active: Vec<(u64, u64, ModuleId)>,
    by_base: HashMap<u64, ModuleId>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        path: impl Into<String>,
        base: u64,
        size: u64,
        uuid: Option<[u8; 16]>,
        timestamp_ns: u64,
    ) -> ModuleId {
        if let Some(&old) = self.by_base.get(&base) {
            self.unload(old, timestamp_ns);
        }
        let id = self.records.len() as ModuleId;
        self.records.push(ModuleRecord {
            path: path.into(),
            base,
            size,
            uuid,
            load_time_ns: timestamp_ns,
            unload_time_ns: None,
        });
        self.by_base.insert(base, id);
        self.active.push((base, base.saturating_add(size), id));
        self.active.sort_unstable_by_key(|&(begin, _, _)| begin);
        id
    }

    /// Marks the active record at `base` unloaded; the record itself stays
    /// in the history.
    pub fn remove(&mut self, base: u64, timestamp_ns: u64) {
        if let Some(&id) = self.by_base.get(&base) {
            self.unload(id, timestamp_ns);
            self.by_base.remove(&base);
        }
    }

    /// Same as [`Self::remove`], addressed by path.
    pub fn remove_by_path(&mut self, path: &str, timestamp_ns: u64) {
        let base = self
            .active
            .iter()
            .find(|&&(_, _, id)| self.records[id as usize].path == path)
            .map(|&(begin, _, _)| begin);
        if let Some(base) = base {
            self.remove(base, timestamp_ns);
        }
    }

    fn unload(&mut self, id: ModuleId, timestamp_ns: u64) {
        self.records[id as usize].unload_time_ns = Some(timestamp_ns);
        self.active.retain(|&(_, _, active)| active != id);
    }

    pub fn lookup(&self, address: u64) -> Option<ModuleId> {
        let after = self.active.partition_point(|&(begin, _, _)| begin <= address);
        // Walk back over candidates whose range could still cover the
        // address; ties (load/unload race) go to the most recent load.
        let mut best: Option<ModuleId> = None;
        for &(_, end, id) in self.active[..after].iter().rev() {
            if end > address {
                best = match best {
                    Some(prev)
                        if self.records[prev as usize].load_time_ns
                            >= self.records[id as usize].load_time_ns =>
                    {
                        Some(prev)
                    }
                    _ => Some(id),
                };
            } else if best.is_some() {
                break;
            }
        }
        best
    }

    pub fn record(&self, id: ModuleId) -> &ModuleRecord {
        &self.records[id as usize]
    }

    pub fn records(&self) -> &[ModuleRecord] {
        &self.records
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}

/// One mapped segment of a native binary.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub vm_address: u64,
    pub vm_size: u64,
    pub executable: bool,
}

/// Authoritative code size of a native module: the span of its executable
/// segments, from the lowest executable vm-address to the highest executable
/// end. The OS-reported image size is ignored.
pub fn code_size(segments: &[Segment]) -> u64 {
    let mut lo = u64::MAX;
    let mut hi = 0u64;
    for seg in segments.iter().filter(|s| s.executable) {
        lo = lo.min(seg.vm_address);
        hi = hi.max(seg.vm_address.saturating_add(seg.vm_size));
    }
    hi.saturating_sub(lo)
}
