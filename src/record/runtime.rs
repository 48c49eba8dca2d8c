//! Runtime (CoreCLR) event payloads, following the EventPipe layouts for
//! the loader, method and GC families. Strings are null-terminated UTF-16.

use super::{put_utf16z, Bytes, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeModuleLoad {
    pub module_id: u64,
    pub assembly_id: u64,
    pub flags: u32,
    pub il_path: String,
    pub native_path: String,
}

impl RuntimeModuleLoad {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(RuntimeModuleLoad {
            module_id: b.u64()?,
            assembly_id: b.u64()?,
            flags: b.u32()?,
            il_path: b.utf16z()?,
            native_path: b.utf16z()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.module_id.to_le_bytes());
        buf.extend_from_slice(&self.assembly_id.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        put_utf16z(buf, &self.il_path);
        put_utf16z(buf, &self.native_path);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeModuleUnload {
    pub module_id: u64,
}

impl RuntimeModuleUnload {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(RuntimeModuleUnload { module_id: b.u64()? })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.module_id.to_le_bytes());
    }
}

/// The JIT started compiling a method; paired with [`MethodLoadVerbose`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodJittingStarted {
    pub method_id: u64,
    pub module_id: u64,
    pub token: u32,
    pub il_size: u32,
    pub namespace: String,
    pub name: String,
    pub signature: String,
}

impl MethodJittingStarted {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(MethodJittingStarted {
            method_id: b.u64()?,
            module_id: b.u64()?,
            token: b.u32()?,
            il_size: b.u32()?,
            namespace: b.utf16z()?,
            name: b.utf16z()?,
            signature: b.utf16z()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.method_id.to_le_bytes());
        buf.extend_from_slice(&self.module_id.to_le_bytes());
        buf.extend_from_slice(&self.token.to_le_bytes());
        buf.extend_from_slice(&self.il_size.to_le_bytes());
        put_utf16z(buf, &self.namespace);
        put_utf16z(buf, &self.name);
        put_utf16z(buf, &self.signature);
    }
}

/// A method finished JIT compilation and is now live at `start_address`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodLoadVerbose {
    pub method_id: u64,
    pub module_id: u64,
    pub start_address: u64,
    pub size: u32,
    pub token: u32,
    pub flags: u32,
    pub namespace: String,
    pub name: String,
    pub signature: String,
}

impl MethodLoadVerbose {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(MethodLoadVerbose {
            method_id: b.u64()?,
            module_id: b.u64()?,
            start_address: b.u64()?,
            size: b.u32()?,
            token: b.u32()?,
            flags: b.u32()?,
            namespace: b.utf16z()?,
            name: b.utf16z()?,
            signature: b.utf16z()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.method_id.to_le_bytes());
        buf.extend_from_slice(&self.module_id.to_le_bytes());
        buf.extend_from_slice(&self.start_address.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.token.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        put_utf16z(buf, &self.namespace);
        put_utf16z(buf, &self.name);
        put_utf16z(buf, &self.signature);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodUnloadVerbose {
    pub method_id: u64,
    pub module_id: u64,
    pub start_address: u64,
}

impl MethodUnloadVerbose {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(MethodUnloadVerbose {
            method_id: b.u64()?,
            module_id: b.u64()?,
            start_address: b.u64()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.method_id.to_le_bytes());
        buf.extend_from_slice(&self.module_id.to_le_bytes());
        buf.extend_from_slice(&self.start_address.to_le_bytes());
    }
}

/// IL offset to native offset mapping for one method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IlToNativeMap {
    pub method_id: u64,
    pub rejit_id: u64,
    pub extent: u8,
    pub il_offsets: Vec<i32>,
    pub native_offsets: Vec<u32>,
}

impl IlToNativeMap {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        let method_id = b.u64()?;
        let rejit_id = b.u64()?;
        let extent = b.u8()?;
        let count = b.u16()? as usize;
        let mut il_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            il_offsets.push(b.i32()?);
        }
        let mut native_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            native_offsets.push(b.u32()?);
        }
        Ok(IlToNativeMap {
            method_id,
            rejit_id,
            extent,
            il_offsets,
            native_offsets,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        assert_eq!(self.il_offsets.len(), self.native_offsets.len());
        buf.extend_from_slice(&self.method_id.to_le_bytes());
        buf.extend_from_slice(&self.rejit_id.to_le_bytes());
        buf.push(self.extent);
        buf.extend_from_slice(&(self.il_offsets.len() as u16).to_le_bytes());
        for off in &self.il_offsets {
            buf.extend_from_slice(&off.to_le_bytes());
        }
        for off in &self.native_offsets {
            buf.extend_from_slice(&off.to_le_bytes());
        }
    }
}

/// Why a GC was triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcReason {
    AllocSmall,
    Induced,
    LowMemory,
    Empty,
    AllocLarge,
    OutOfSpaceSoh,
    OutOfSpaceLoh,
    InducedNotForced,
    Internal,
    InducedLowMemory,
    InducedCompacting,
    LowMemoryHost,
    PmFullGc,
    LowMemoryHostBlocking,
    Unknown(u32),
}

impl GcReason {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => GcReason::AllocSmall,
            1 => GcReason::Induced,
            2 => GcReason::LowMemory,
            3 => GcReason::Empty,
            4 => GcReason::AllocLarge,
            5 => GcReason::OutOfSpaceSoh,
            6 => GcReason::OutOfSpaceLoh,
            7 => GcReason::InducedNotForced,
            8 => GcReason::Internal,
            9 => GcReason::InducedLowMemory,
            10 => GcReason::InducedCompacting,
            11 => GcReason::LowMemoryHost,
            12 => GcReason::PmFullGc,
            13 => GcReason::LowMemoryHostBlocking,
            other => GcReason::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            GcReason::AllocSmall => 0,
            GcReason::Induced => 1,
            GcReason::LowMemory => 2,
            GcReason::Empty => 3,
            GcReason::AllocLarge => 4,
            GcReason::OutOfSpaceSoh => 5,
            GcReason::OutOfSpaceLoh => 6,
            GcReason::InducedNotForced => 7,
            GcReason::Internal => 8,
            GcReason::InducedLowMemory => 9,
            GcReason::InducedCompacting => 10,
            GcReason::LowMemoryHost => 11,
            GcReason::PmFullGc => 12,
            GcReason::LowMemoryHostBlocking => 13,
            GcReason::Unknown(raw) => raw,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GcReason::AllocSmall => "AllocSmall",
            GcReason::Induced => "Induced",
            GcReason::LowMemory => "LowMemory",
            GcReason::Empty => "Empty",
            GcReason::AllocLarge => "AllocLarge",
            GcReason::OutOfSpaceSoh => "OutOfSpaceSOH",
            GcReason::OutOfSpaceLoh => "OutOfSpaceLOH",
            GcReason::InducedNotForced => "InducedNotForced",
            GcReason::Internal => "Internal",
            GcReason::InducedLowMemory => "InducedLowMemory",
            GcReason::InducedCompacting => "InducedCompacting",
            GcReason::LowMemoryHost => "LowMemoryHost",
            GcReason::PmFullGc => "PMFullGC",
            GcReason::LowMemoryHostBlocking => "LowMemoryHostBlocking",
            GcReason::Unknown(_) => "Unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcStart {
    pub count: u32,
    pub depth: u32,
    pub reason: GcReason,
    pub gc_type: u32,
}

impl GcStart {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(GcStart {
            count: b.u32()?,
            depth: b.u32()?,
            reason: GcReason::from_raw(b.u32()?),
            gc_type: b.u32()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.depth.to_le_bytes());
        buf.extend_from_slice(&self.reason.raw().to_le_bytes());
        buf.extend_from_slice(&self.gc_type.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcEnd {
    pub count: u32,
    pub depth: u32,
}

impl GcEnd {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(GcEnd {
            count: b.u32()?,
            depth: b.u32()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.depth.to_le_bytes());
    }
}

/// Why the execution engine is being suspended.
pub fn suspend_reason_name(raw: u32) -> &'static str {
    match raw {
        0 => "Other",
        1 => "GC",
        2 => "AppDomainShutdown",
        3 => "CodePitching",
        4 => "Shutdown",
        5 => "Debugger",
        6 => "GCPrep",
        7 => "DebuggerSweep",
        _ => "Unknown",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcSuspendEeBegin {
    pub reason: u32,
    pub count: u32,
}

impl GcSuspendEeBegin {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(GcSuspendEeBegin {
            reason: b.u32()?,
            count: b.u32()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.reason.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
    }
}

macro_rules! empty_payload {
    ($ty:ident) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $ty;

        impl $ty {
            pub(crate) fn parse(_b: &mut Bytes<'_>) -> Result<Self> {
                Ok($ty)
            }

            pub fn encode(&self, _buf: &mut Vec<u8>) {}
        }
    };
}

empty_payload!(GcSuspendEeEnd);
empty_payload!(GcRestartEeBegin);
empty_payload!(GcRestartEeEnd);

/// Heap snapshot after a collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcHeapStats {
    /// Generation sizes: gen0, gen1, gen2, large object heap.
    pub gen_size: [u64; 4],
    pub promoted: [u64; 4],
    pub finalization_promoted_size: u64,
    pub finalization_promoted_count: u64,
    pub pinned_object_count: u32,
    pub sink_block_count: u32,
    pub gc_handle_count: u32,
}

impl GcHeapStats {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        let mut stats = GcHeapStats::default();
        for i in 0..4 {
            stats.gen_size[i] = b.u64()?;
            stats.promoted[i] = b.u64()?;
        }
        stats.finalization_promoted_size = b.u64()?;
        stats.finalization_promoted_count = b.u64()?;
        stats.pinned_object_count = b.u32()?;
        stats.sink_block_count = b.u32()?;
        stats.gc_handle_count = b.u32()?;
        Ok(stats)
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        for i in 0..4 {
            buf.extend_from_slice(&self.gen_size[i].to_le_bytes());
            buf.extend_from_slice(&self.promoted[i].to_le_bytes());
        }
        buf.extend_from_slice(&self.finalization_promoted_size.to_le_bytes());
        buf.extend_from_slice(&self.finalization_promoted_count.to_le_bytes());
        buf.extend_from_slice(&self.pinned_object_count.to_le_bytes());
        buf.extend_from_slice(&self.sink_block_count.to_le_bytes());
        buf.extend_from_slice(&self.gc_handle_count.to_le_bytes());
    }

    pub fn total_heap_size(&self) -> u64 {
        self.gen_size.iter().sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationKind {
    Small,
    Large,
    Pinned,
    Unknown(u32),
}

impl AllocationKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => AllocationKind::Small,
            1 => AllocationKind::Large,
            2 => AllocationKind::Pinned,
            other => AllocationKind::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            AllocationKind::Small => 0,
            AllocationKind::Large => 1,
            AllocationKind::Pinned => 2,
            AllocationKind::Unknown(raw) => raw,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AllocationKind::Small => "Small",
            AllocationKind::Large => "Large",
            AllocationKind::Pinned => "Pinned",
            AllocationKind::Unknown(_) => "Unknown",
        }
    }
}

/// Sampled allocation notification (roughly every 100 KB per heap).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcAllocationTick {
    pub amount: u32,
    pub kind: AllocationKind,
    pub clr_instance_id: u16,
    pub amount64: u64,
    pub type_id: u64,
    pub type_name: String,
    pub heap_index: u32,
    pub address: u64,
}

impl GcAllocationTick {
    pub(crate) fn parse(b: &mut Bytes<'_>) -> Result<Self> {
        Ok(GcAllocationTick {
            amount: b.u32()?,
            kind: AllocationKind::from_raw(b.u32()?),
            clr_instance_id: b.u16()?,
            amount64: b.u64()?,
            type_id: b.u64()?,
            type_name: b.utf16z()?,
            heap_index: b.u32()?,
            address: b.u64()?,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.kind.raw().to_le_bytes());
        buf.extend_from_slice(&self.clr_instance_id.to_le_bytes());
        buf.extend_from_slice(&self.amount64.to_le_bytes());
        buf.extend_from_slice(&self.type_id.to_le_bytes());
        put_utf16z(buf, &self.type_name);
        buf.extend_from_slice(&self.heap_index.to_le_bytes());
        buf.extend_from_slice(&self.address.to_le_bytes());
    }
}
