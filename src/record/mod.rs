//! Event wire formats.
//!
//! Everything on the wire is little-endian with exact byte offsets; each
//! record module documents its layout next to the parser, and every parser
//! has a matching encoder used by the sampler (native records) and by test
//! fixtures (runtime records).

use thiserror::Error;

pub use log::{LogEvent, LogReader, LogWriter, MANIFEST_ENTRIES};
pub use module::{ModuleEvent, ModuleEventKind};
pub use process::ProcessStart;
pub use runtime::{
    AllocationKind, GcAllocationTick, GcEnd, GcHeapStats, GcReason, GcRestartEeBegin,
    GcRestartEeEnd, GcStart, GcSuspendEeBegin, GcSuspendEeEnd, IlToNativeMap, MethodJittingStarted,
    MethodLoadVerbose, MethodUnloadVerbose, RuntimeModuleLoad, RuntimeModuleUnload,
};
pub use stack::CallStack;
pub use thread::{ThreadStart, ThreadStop};

pub mod log;
pub mod module;
pub mod process;
pub mod runtime;
pub mod stack;
pub mod thread;

#[cfg(test)]
mod test;

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record truncated: wanted {wanted} more bytes, {left} left")]
    Truncated { wanted: usize, left: usize },
    #[error("unknown event kind {0}")]
    UnknownKind(u16),
    #[error("invalid field: {0}")]
    Invalid(&'static str),
}

/// Event kinds as they appear in the intermediate log.
///
/// Native records (emitted by the injected sampler) live below 32; runtime
/// records mirror the EventPipe payloads the diagnostic port delivers.
pub mod kind {
    pub const MANIFEST: u16 = 0;
    pub const CALL_STACK: u16 = 1;
    pub const MODULE: u16 = 2;
    pub const THREAD_START: u16 = 3;
    pub const THREAD_STOP: u16 = 4;
    pub const PROCESS_START: u16 = 5;

    pub const MODULE_LOAD: u16 = 32;
    pub const MODULE_UNLOAD: u16 = 33;
    pub const METHOD_JITTING_STARTED: u16 = 34;
    pub const METHOD_LOAD_VERBOSE: u16 = 35;
    pub const METHOD_UNLOAD_VERBOSE: u16 = 36;
    pub const METHOD_IL_TO_NATIVE_MAP: u16 = 37;

    pub const GC_START: u16 = 48;
    pub const GC_END: u16 = 49;
    pub const GC_SUSPEND_EE_BEGIN: u16 = 50;
    pub const GC_SUSPEND_EE_END: u16 = 51;
    pub const GC_RESTART_EE_BEGIN: u16 = 52;
    pub const GC_RESTART_EE_END: u16 = 53;
    pub const GC_HEAP_STATS: u16 = 54;
    pub const GC_ALLOCATION_TICK: u16 = 55;
}

/// A decoded event together with its log envelope fields.
#[derive(Clone, Debug)]
pub enum Event {
    CallStack(CallStack),
    Module(ModuleEvent),
    ThreadStart(ThreadStart),
    ThreadStop(ThreadStop),
    ProcessStart(ProcessStart),

    RuntimeModuleLoad(RuntimeModuleLoad),
    RuntimeModuleUnload(RuntimeModuleUnload),
    MethodJittingStarted(MethodJittingStarted),
    MethodLoadVerbose(MethodLoadVerbose),
    MethodUnloadVerbose(MethodUnloadVerbose),
    IlToNativeMap(IlToNativeMap),

    GcStart(GcStart),
    GcEnd(GcEnd),
    GcSuspendEeBegin(GcSuspendEeBegin),
    GcSuspendEeEnd(GcSuspendEeEnd),
    GcRestartEeBegin(GcRestartEeBegin),
    GcRestartEeEnd(GcRestartEeEnd),
    GcHeapStats(GcHeapStats),
    GcAllocationTick(GcAllocationTick),
}

impl Event {
    pub fn parse(kind: u16, payload: &[u8]) -> Result<Event> {
        let mut b = Bytes::new(payload);
        let ev = match kind {
            kind::CALL_STACK => Event::CallStack(CallStack::parse(&mut b)?),
            kind::MODULE => Event::Module(ModuleEvent::parse(&mut b)?),
            kind::THREAD_START => Event::ThreadStart(ThreadStart::parse(&mut b)?),
            kind::THREAD_STOP => Event::ThreadStop(ThreadStop::parse(&mut b)?),
            kind::PROCESS_START => Event::ProcessStart(ProcessStart::parse(&mut b)?),
            kind::MODULE_LOAD => Event::RuntimeModuleLoad(RuntimeModuleLoad::parse(&mut b)?),
            kind::MODULE_UNLOAD => Event::RuntimeModuleUnload(RuntimeModuleUnload::parse(&mut b)?),
            kind::METHOD_JITTING_STARTED => {
                Event::MethodJittingStarted(MethodJittingStarted::parse(&mut b)?)
            }
            kind::METHOD_LOAD_VERBOSE => {
                Event::MethodLoadVerbose(MethodLoadVerbose::parse(&mut b)?)
            }
            kind::METHOD_UNLOAD_VERBOSE => {
                Event::MethodUnloadVerbose(MethodUnloadVerbose::parse(&mut b)?)
            }
            kind::METHOD_IL_TO_NATIVE_MAP => Event::IlToNativeMap(IlToNativeMap::parse(&mut b)?),
            kind::GC_START => Event::GcStart(GcStart::parse(&mut b)?),
            kind::GC_END => Event::GcEnd(GcEnd::parse(&mut b)?),
            kind::GC_SUSPEND_EE_BEGIN => Event::GcSuspendEeBegin(GcSuspendEeBegin::parse(&mut b)?),
            kind::GC_SUSPEND_EE_END => Event::GcSuspendEeEnd(GcSuspendEeEnd::parse(&mut b)?),
            kind::GC_RESTART_EE_BEGIN => Event::GcRestartEeBegin(GcRestartEeBegin::parse(&mut b)?),
            kind::GC_RESTART_EE_END => Event::GcRestartEeEnd(GcRestartEeEnd::parse(&mut b)?),
            kind::GC_HEAP_STATS => Event::GcHeapStats(GcHeapStats::parse(&mut b)?),
            kind::GC_ALLOCATION_TICK => Event::GcAllocationTick(GcAllocationTick::parse(&mut b)?),
            other => return Err(RecordError::UnknownKind(other)),
        };
        Ok(ev)
    }
}

/// Bounds-checked little-endian cursor over a record payload.
///
/// File data is untrusted, so unlike the in-process paths this checks every
/// advance and reports how short the buffer came up.
pub(crate) struct Bytes<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! take {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty> {
            const N: usize = size_of::<$ty>();
            let raw = self.bytes(N)?;
            Ok(<$ty>::from_le_bytes(raw.try_into().unwrap()))
        }
    };
}

impl<'a> Bytes<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Bytes { buf, pos: 0 }
    }

    take!(u16, u16);
    take!(u32, u32);
    take!(u64, u64);
    take!(i32, i32);
    take!(i64, i64);

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let left = self.buf.len() - self.pos;
        if left < n {
            return Err(RecordError::Truncated { wanted: n, left });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn utf8(&mut self, n: usize) -> Result<String> {
        let raw = self.bytes(n)?;
        String::from_utf8(raw.to_vec()).map_err(|_| RecordError::Invalid("utf-8 string"))
    }

    /// `n` UTF-16 code units.
    pub fn utf16(&mut self, n: usize) -> Result<String> {
        let raw = self.bytes(n * 2)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| RecordError::Invalid("utf-16 string"))
    }

    /// Null-terminated UTF-16 string (EventPipe payload convention).
    pub fn utf16z(&mut self) -> Result<String> {
        let mut units = Vec::new();
        loop {
            let unit = self.u16()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16(&units).map_err(|_| RecordError::Invalid("utf-16 string"))
    }
}

pub(crate) fn put_utf16z(buf: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf.extend_from_slice(&0u16.to_le_bytes());
}
