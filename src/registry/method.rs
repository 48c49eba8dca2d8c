use std::collections::{BTreeMap, HashMap};

/// IL offset to native offset, sorted by native offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IlMapping {
    pub il_offset: i32,
    pub native_offset: u32,
}

#[derive(Clone, Debug)]
pub struct MethodRecord {
    pub method_id: u64,
    pub module_id: u64,
    /// Thread on which the JIT produced this body.
    pub jit_thread_id: u64,
    pub namespace: String,
    pub name: String,
    pub signature: String,
    pub token: u32,
    pub flags: u32,
    pub start_address: u64,
    pub size: u32,
    pub il_map: Vec<IlMapping>,
}

impl MethodRecord {
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    fn end(&self) -> u64 {
        self.start_address + self.size as u64
    }
}

/// JITted method ranges: `method_id` is unique within a session and the
/// `[start, start+size)` ranges are disjoint at any instant (an unload
/// removes its range before any re-publish).
#[derive(Default)]
pub struct MethodRegistry {
    records: Vec<MethodRecord>,
    by_start: BTreeMap<u64, usize>,
    by_id: HashMap<u64, usize>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: MethodRecord) {
        let index = self.records.len();
        // Tiered compilation republishes the same method id at a new
        // address; the newest body wins the id.
        self.by_id.insert(record.method_id, index);
        self.by_start.insert(record.start_address, index);
        self.records.push(record);
    }

    /// Removes the method's range from lookup; the record stays for
    /// markers referencing it.
    pub fn remove(&mut self, method_id: u64) {
        if let Some(&index) = self.by_id.get(&method_id) {
            let start = self.records[index].start_address;
            if self.by_start.get(&start) == Some(&index) {
                self.by_start.remove(&start);
            }
        }
    }

    pub fn lookup(&self, address: u64) -> Option<&MethodRecord> {
        let (_, &index) = self.by_start.range(..=address).next_back()?;
        let record = &self.records[index];
        (address < record.end()).then_some(record)
    }

    pub fn by_id(&self, method_id: u64) -> Option<&MethodRecord> {
        self.by_id.get(&method_id).map(|&i| &self.records[i])
    }

    /// Attaches an IL map: entries with negative IL offsets (prolog/epilog
    /// markers) are dropped, the rest sorted ascending by native offset.
    pub fn attach_il_map(&mut self, method_id: u64, il_offsets: &[i32], native_offsets: &[u32]) {
        let Some(&index) = self.by_id.get(&method_id) else {
            return;
        };
        let mut map: Vec<IlMapping> = il_offsets
            .iter()
            .zip(native_offsets)
            .filter(|(&il, _)| il >= 0)
            .map(|(&il_offset, &native_offset)| IlMapping {
                il_offset,
                native_offset,
            })
            .collect();
        map.sort_by_key(|m| m.native_offset);
        self.records[index].il_map = map;
    }

    pub fn records(&self) -> &[MethodRecord] {
        &self.records
    }
}
