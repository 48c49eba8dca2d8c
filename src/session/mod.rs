//! Diagnostic-port sessions.
//!
//! One [`Session`] is one live event stream out of the target process,
//! copied verbatim to one intermediate file. A profiled process has two:
//! the runtime channel (method/GC events over the runtime's diagnostic
//! socket) and the sampler channel (native stacks over the injected
//! library's socket). An optional third, short-lived rundown session forces
//! the runtime to re-enumerate loaders and methods at end of trace.
//!
//! States move `Connecting -> Connected -> Streaming -> Stopping ->
//! Disposed`; any non-terminal state can fall directly to `Disposed`, and
//! getting there always releases the intermediate file handle and the
//! event-pipe session token, no matter which cleanup step failed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::lock::Mutex as AsyncMutex;
use tracing::{debug, warn};

pub use transport::Provider;

use crate::run::CancelToken;
use crate::{Error, Result};

pub mod discover;
pub mod transport;

#[cfg(test)]
mod test;

/// Keywords of the runtime provider, as the runtime defines them.
pub mod keywords {
    pub const GC: u64 = 0x1;
    pub const LOADER: u64 = 0x8;
    pub const JIT: u64 = 0x10;
    pub const START_ENUMERATION: u64 = 0x40;
    pub const INTEROP: u64 = 0x2000;
    pub const EXCEPTION: u64 = 0x8000;
    pub const JITTED_METHOD_IL_TO_NATIVE_MAP: u64 = 0x20000;
    pub const GC_HEAP_AND_TYPE_NAMES: u64 = 0x100_0000;
    pub const STACK: u64 = 0x4000_0000;

    /// Everything method symbolication needs.
    pub const JIT_SYMBOLS: u64 = JIT | JITTED_METHOD_IL_TO_NATIVE_MAP | LOADER;
}

pub const RUNTIME_PROVIDER: &str = "Microsoft-Windows-DotNETRuntime";
pub const SAMPLER_PROVIDER: &str = "Ultra-Sampler";
/// Fixed GUID the sampler library registers its provider under.
pub const SAMPLER_PROVIDER_GUID: &str = "04E4DCBF-494F-45A1-9E4C-9C88D4A2F14A";

const LEVEL_VERBOSE: u32 = 5;

/// Provider set for the runtime channel.
pub fn runtime_providers() -> Vec<Provider> {
    use keywords::*;
    vec![Provider {
        name: RUNTIME_PROVIDER.into(),
        keywords: JIT_SYMBOLS
            | EXCEPTION
            | GC
            | GC_HEAP_AND_TYPE_NAMES
            | INTEROP
            | JIT
            | JITTED_METHOD_IL_TO_NATIVE_MAP
            | LOADER
            | STACK
            | START_ENUMERATION,
        level: LEVEL_VERBOSE,
        filter: String::new(),
    }]
}

/// Provider set for the sampler channel: the one fixed-GUID provider, all
/// keywords.
pub fn sampler_providers() -> Vec<Provider> {
    vec![Provider {
        name: SAMPLER_PROVIDER.into(),
        keywords: u64::MAX,
        level: LEVEL_VERBOSE,
        filter: format!("guid={SAMPLER_PROVIDER_GUID}"),
    }]
}

/// Provider set for the rundown session.
pub fn rundown_providers() -> Vec<Provider> {
    use keywords::*;
    vec![Provider {
        name: RUNTIME_PROVIDER.into(),
        keywords: JIT_SYMBOLS | LOADER | START_ENUMERATION,
        level: LEVEL_VERBOSE,
        filter: String::new(),
    }]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Connecting = 0,
    Connected = 1,
    Streaming = 2,
    Stopping = 3,
    Disposed = 4,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Streaming,
            3 => State::Stopping,
            _ => State::Disposed,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// `"sampler"` or `"clr"`; names the channel in errors and files.
    pub channel: &'static str,
    pub pid: u32,
    /// Directory to discover the endpoint in.
    pub endpoint_dir: PathBuf,
    pub discovery_timeout: Duration,
    /// Intermediate file this session writes.
    pub file_path: PathBuf,
    pub buffer_mb: u32,
    pub request_rundown: bool,
    pub providers: Vec<Provider>,
}

struct Inner {
    endpoint: Option<PathBuf>,
    session_id: u64,
    stream: Option<Arc<UnixStream>>,
    copy: Option<oneshot::Receiver<io::Result<(u64, File)>>>,
}

pub struct Session {
    config: SessionConfig,
    state: AtomicU8,
    dispose_requested: AtomicBool,
    // The single-slot semaphore: start and stop-and-dispose are serialized
    // through this, so disposing mid-connect waits for the connect attempt
    // to notice the request and unwind, never racing its resources.
    slot: AsyncMutex<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Session {
        Session {
            config,
            state: AtomicU8::new(State::Connecting as u8),
            dispose_requested: AtomicBool::new(false),
            slot: AsyncMutex::new(Inner {
                endpoint: None,
                session_id: 0,
                stream: None,
                copy: None,
            }),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.config.file_path
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Discovers the endpoint, opens the intermediate file, begins the
    /// event-pipe session and starts the background copy task.
    pub async fn start(&self, cancel: &CancelToken) -> Result<()> {
        let mut inner = self.slot.lock().await;
        if self.dispose_requested.load(Ordering::Acquire) || self.state() != State::Connecting {
            return Err(Error::Cancelled);
        }

        let dir = self.config.endpoint_dir.clone();
        let pid = self.config.pid;
        let timeout = self.config.discovery_timeout;
        let token = cancel.clone();
        let endpoint = blocking(move || discover::find_endpoint(&dir, pid, timeout, &token))
            .await
            .map_err(|e| self.connect_error(e))?;
        if self.dispose_requested.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        debug!(channel = self.config.channel, ?endpoint, "endpoint found");
        inner.endpoint = Some(endpoint.clone());
        self.set_state(State::Connected);

        let file = File::create(&self.config.file_path)
            .map_err(|e| Error::io(&self.config.file_path, e))?;

        let buffer_mb = self.config.buffer_mb;
        let request_rundown = self.config.request_rundown;
        let providers = self.config.providers.clone();
        let (session_id, stream) = blocking(move || -> io::Result<(u64, UnixStream)> {
            let mut stream = UnixStream::connect(&endpoint)?;
            let id = transport::collect_tracing2(&mut stream, buffer_mb, request_rundown, &providers)?;
            Ok((id, stream))
        })
        .await
        .map_err(|e| self.connect_error(e))?;
        inner.session_id = session_id;

        let stream = Arc::new(stream);
        inner.stream = Some(Arc::clone(&stream));
        let (tx, rx) = oneshot::channel();
        let copy_path = self.config.file_path.clone();
        std::thread::Builder::new()
            .name(format!("ultra-copy-{}", self.config.channel))
            .spawn(move || {
                let result = copy_stream(&stream, file);
                if let Err(e) = &result {
                    warn!(path = ?copy_path, error = %e, "event copy ended with error");
                }
                let _ = tx.send(result);
            })
            .expect("spawn copy thread");
        inner.copy = Some(rx);

        self.set_state(State::Streaming);
        debug!(channel = self.config.channel, session_id, "session streaming");
        Ok(())
    }

    /// Stops the copy task, closes the intermediate file, then stops the
    /// event-pipe session. Each step may fail independently; failures are
    /// logged and swallowed so the remaining steps still run, and the
    /// session is only marked disposed after all three completed.
    pub async fn stop_and_dispose(&self) {
        self.dispose_requested.store(true, Ordering::Release);
        let mut inner = self.slot.lock().await;
        if self.state() == State::Disposed {
            return;
        }
        self.set_state(State::Stopping);

        // 1. Wind down the copy task. Shutting the socket down unblocks
        //    its read if the producer is still alive.
        if let Some(stream) = inner.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let mut file = None;
        if let Some(rx) = inner.copy.take() {
            match rx.await {
                Ok(Ok((bytes, f))) => {
                    debug!(channel = self.config.channel, bytes, "copy task finished");
                    file = Some(f);
                }
                Ok(Err(e)) => warn!(channel = self.config.channel, error = %e, "copy task failed"),
                Err(_) => warn!(channel = self.config.channel, "copy task vanished"),
            }
        }

        // 2. Close the intermediate file.
        if let Some(file) = file {
            if let Err(e) = file.sync_all() {
                warn!(channel = self.config.channel, error = %e, "file close failed");
            }
        }

        // 3. Release the event-pipe session token.
        if let (Some(endpoint), id @ 1..) = (inner.endpoint.take(), inner.session_id) {
            let channel = self.config.channel;
            let result = blocking(move || transport::stop_tracing(&endpoint, id)).await;
            if let Err(e) = result {
                warn!(channel, error = %e, "session stop failed");
            }
        }
        inner.session_id = 0;

        self.set_state(State::Disposed);
    }

    fn connect_error(&self, e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::Interrupted {
            Error::Cancelled
        } else {
            Error::Connect {
                channel: self.config.channel,
                pid: self.config.pid,
                reason: e.to_string(),
            }
        }
    }
}

/// Runs a blocking closure off the cooperative executor and awaits its
/// result.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.await.expect("blocking task panicked")
}

fn copy_stream(mut stream: &UnixStream, mut file: File) -> io::Result<(u64, File)> {
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                file.write_all(&buf[..n])?;
                total += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // A reset just means the producer went away mid-stream; what
            // made it to disk is still usable.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => break,
            Err(e) => return Err(e),
        }
    }
    file.flush()?;
    Ok((total, file))
}
