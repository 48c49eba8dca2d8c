//! Intermediate event-log container.
//!
//! One such file backs each session (`<base>_<pid>_<kind>.nettrace`). The
//! stream is self-describing: magic, version, then a manifest record naming
//! every event kind the producer may emit, then length-prefixed records in
//! delivery order.
//!
//! Record framing:
//! ```text
//! u32 payload_len
//! u16 kind
//! u16 flags          zero; reserved
//! u64 thread_id      capturing thread (not necessarily the subject)
//! u64 timestamp_ns   monotonic, relative to stream start
//! u8  payload[payload_len]
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use super::{kind, Bytes, Event};

pub const MAGIC: &[u8; 8] = b"ULTRAEVT";
pub const VERSION: u32 = 1;

/// Kind/name pairs carried by the manifest record.
pub const MANIFEST_ENTRIES: &[(u16, &str)] = &[
    (kind::CALL_STACK, "NativeCallStack"),
    (kind::MODULE, "NativeModule"),
    (kind::THREAD_START, "NativeThreadStart"),
    (kind::THREAD_STOP, "NativeThreadStop"),
    (kind::PROCESS_START, "NativeProcessStart"),
    (kind::MODULE_LOAD, "ModuleLoad"),
    (kind::MODULE_UNLOAD, "ModuleUnload"),
    (kind::METHOD_JITTING_STARTED, "MethodJittingStarted"),
    (kind::METHOD_LOAD_VERBOSE, "MethodLoadVerbose"),
    (kind::METHOD_UNLOAD_VERBOSE, "MethodUnloadVerbose"),
    (kind::METHOD_IL_TO_NATIVE_MAP, "MethodILToNativeMap"),
    (kind::GC_START, "GCStart"),
    (kind::GC_END, "GCEnd"),
    (kind::GC_SUSPEND_EE_BEGIN, "GCSuspendEEBegin"),
    (kind::GC_SUSPEND_EE_END, "GCSuspendEEEnd"),
    (kind::GC_RESTART_EE_BEGIN, "GCRestartEEBegin"),
    (kind::GC_RESTART_EE_END, "GCRestartEEEnd"),
    (kind::GC_HEAP_STATS, "GCHeapStats"),
    (kind::GC_ALLOCATION_TICK, "GCAllocationTick"),
];

pub struct LogWriter<W: Write> {
    out: W,
}

impl LogWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        LogWriter::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> LogWriter<W> {
    /// Writes the stream header. The manifest must follow before the first
    /// event; [`Self::manifest`] does both bookends.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        Ok(LogWriter { out })
    }

    pub fn manifest(&mut self) -> io::Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(MANIFEST_ENTRIES.len() as u32).to_le_bytes());
        for (k, name) in MANIFEST_ENTRIES {
            payload.extend_from_slice(&k.to_le_bytes());
            payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
        }
        self.event(kind::MANIFEST, 0, 0, &payload)
    }

    pub fn event(
        &mut self,
        kind: u16,
        thread_id: u64,
        timestamp_ns: u64,
        payload: &[u8],
    ) -> io::Result<()> {
        self.out.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.out.write_all(&kind.to_le_bytes())?;
        self.out.write_all(&0u16.to_le_bytes())?;
        self.out.write_all(&thread_id.to_le_bytes())?;
        self.out.write_all(&timestamp_ns.to_le_bytes())?;
        self.out.write_all(payload)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// One record as read back from the log, envelope plus raw payload.
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub kind: u16,
    pub thread_id: u64,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

impl LogEvent {
    pub fn decode(&self) -> super::Result<Event> {
        Event::parse(self.kind, &self.payload)
    }
}

pub struct LogReader<R: Read> {
    input: R,
}

impl LogReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        LogReader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> LogReader<R> {
    pub fn new(mut input: R) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        let mut version = [0u8; 4];
        input.read_exact(&mut version)?;
        if &magic != MAGIC || u32::from_le_bytes(version) != VERSION {
            return Err(ErrorKind::InvalidData.into());
        }
        Ok(LogReader { input })
    }

    /// Next record, `None` at end of stream.
    ///
    /// A record torn mid-write (the copy task can be cut at stop time) ends
    /// the stream cleanly instead of erroring.
    pub fn next_event(&mut self) -> io::Result<Option<LogEvent>> {
        let mut header = [0u8; 24];
        match read_exact_or_eof(&mut self.input, &mut header)? {
            Filled::Eof => return Ok(None),
            Filled::Full => {}
        }
        let mut b = Bytes::new(&header);
        let payload_len = b.u32().unwrap() as usize;
        let kind = b.u16().unwrap();
        let _flags = b.u16().unwrap();
        let thread_id = b.u64().unwrap();
        let timestamp_ns = b.u64().unwrap();

        let mut payload = vec![0u8; payload_len];
        match read_exact_or_eof(&mut self.input, &mut payload)? {
            Filled::Eof => return Ok(None),
            Filled::Full => {}
        }
        Ok(Some(LogEvent {
            kind,
            thread_id,
            timestamp_ns,
            payload,
        }))
    }

    /// Drains the stream, skipping the manifest record.
    pub fn read_to_end(&mut self) -> io::Result<Vec<LogEvent>> {
        let mut events = Vec::new();
        while let Some(ev) = self.next_event()? {
            if ev.kind != kind::MANIFEST {
                events.push(ev);
            }
        }
        Ok(events)
    }
}

enum Filled {
    Full,
    Eof,
}

fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<Filled> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Filled::Eof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Filled::Full)
}
