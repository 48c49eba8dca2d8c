//! Diagnostic-port control protocol (`DOTNET_IPC_V1` framing).
//!
//! Small length-prefixed commands over the target's diagnostic socket:
//!
//! ```text
//! u8  magic[14]   "DOTNET_IPC_V1\0"
//! u16 size        whole frame, header included
//! u8  command_set
//! u8  command_id
//! u16 reserved
//! u8  payload[size - 20]
//! ```
//!
//! Strings in payloads are UTF-16, length-prefixed with the code-unit count
//! including the null terminator.

use std::io::{self, Error, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

pub const MAGIC: &[u8; 14] = b"DOTNET_IPC_V1\0";
const HEADER_LEN: usize = 20;

const COMMAND_SET_EVENT_PIPE: u8 = 0x02;
const COMMAND_SET_SERVER: u8 = 0xFF;

const EVENT_PIPE_STOP_TRACING: u8 = 0x01;
const EVENT_PIPE_COLLECT_TRACING2: u8 = 0x03;

const SERVER_OK: u8 = 0x00;
const SERVER_ERROR: u8 = 0xFF;

/// One event provider to enable.
#[derive(Clone, Debug)]
pub struct Provider {
    pub name: String,
    pub keywords: u64,
    /// 5 = verbose.
    pub level: u32,
    pub filter: String,
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().chain(Some(0)).collect();
    buf.extend_from_slice(&(units.len() as u32).to_le_bytes());
    for unit in units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
}

fn write_frame(
    stream: &mut UnixStream,
    command_set: u8,
    command_id: u8,
    payload: &[u8],
) -> io::Result<()> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&((HEADER_LEN + payload.len()) as u16).to_le_bytes());
    frame.push(command_set);
    frame.push(command_id);
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

struct Response {
    command_id: u8,
    payload: Vec<u8>,
}

fn read_response(stream: &mut UnixStream) -> io::Result<Response> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    if &header[..14] != MAGIC {
        return Err(Error::new(ErrorKind::InvalidData, "bad ipc magic"));
    }
    let size = u16::from_le_bytes([header[14], header[15]]) as usize;
    let command_set = header[16];
    let command_id = header[17];
    if command_set != COMMAND_SET_SERVER || size < HEADER_LEN {
        return Err(Error::new(ErrorKind::InvalidData, "unexpected ipc response"));
    }
    let mut payload = vec![0u8; size - HEADER_LEN];
    stream.read_exact(&mut payload)?;
    if command_id == SERVER_ERROR {
        let hresult = payload
            .get(..4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .unwrap_or(0);
        return Err(Error::new(
            ErrorKind::Other,
            format!("endpoint rejected command: hresult {hresult:#010x}"),
        ));
    }
    if command_id != SERVER_OK {
        return Err(Error::new(ErrorKind::InvalidData, "unexpected ipc response"));
    }
    Ok(Response {
        command_id,
        payload,
    })
}

/// Asks the endpoint to begin an event-pipe session; the event stream
/// follows on the same connection. Returns the session id.
pub fn collect_tracing2(
    stream: &mut UnixStream,
    buffer_mb: u32,
    request_rundown: bool,
    providers: &[Provider],
) -> io::Result<u64> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&buffer_mb.to_le_bytes());
    // 1 = nettrace serialization.
    payload.extend_from_slice(&1u32.to_le_bytes());
    payload.push(request_rundown as u8);
    payload.extend_from_slice(&(providers.len() as u32).to_le_bytes());
    for provider in providers {
        payload.extend_from_slice(&provider.keywords.to_le_bytes());
        payload.extend_from_slice(&provider.level.to_le_bytes());
        put_string(&mut payload, &provider.name);
        put_string(&mut payload, &provider.filter);
    }
    write_frame(stream, COMMAND_SET_EVENT_PIPE, EVENT_PIPE_COLLECT_TRACING2, &payload)?;

    let response = read_response(stream)?;
    debug_assert_eq!(response.command_id, SERVER_OK);
    response
        .payload
        .get(..8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "short session id"))
}

/// Ends an event-pipe session. Runs over a fresh connection: the original
/// one is busy carrying the event stream.
pub fn stop_tracing(endpoint: &Path, session_id: u64) -> io::Result<()> {
    let mut stream = UnixStream::connect(endpoint)?;
    let mut payload = Vec::new();
    payload.extend_from_slice(&session_id.to_le_bytes());
    write_frame(&mut stream, COMMAND_SET_EVENT_PIPE, EVENT_PIPE_STOP_TRACING, &payload)?;
    read_response(&mut stream)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;

    use super::*;

    fn serve_one_ok(listener: UnixListener, session_id: u64) -> std::thread::JoinHandle<Vec<u8>> {
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; HEADER_LEN];
            stream.read_exact(&mut header).unwrap();
            let size = u16::from_le_bytes([header[14], header[15]]) as usize;
            let mut payload = vec![0u8; size - HEADER_LEN];
            stream.read_exact(&mut payload).unwrap();

            let mut response = Vec::new();
            response.extend_from_slice(MAGIC);
            response.extend_from_slice(&28u16.to_le_bytes());
            response.push(COMMAND_SET_SERVER);
            response.push(SERVER_OK);
            response.extend_from_slice(&0u16.to_le_bytes());
            response.extend_from_slice(&session_id.to_le_bytes());
            stream.write_all(&response).unwrap();
            payload
        })
    }

    #[test]
    fn collect_tracing2_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_one_ok(listener, 0xDEAD_BEEF);

        let mut stream = UnixStream::connect(&path).unwrap();
        let providers = [Provider {
            name: "Microsoft-Windows-DotNETRuntime".into(),
            keywords: 0x4_0001,
            level: 5,
            filter: String::new(),
        }];
        let session_id = collect_tracing2(&mut stream, 512, false, &providers).unwrap();
        assert_eq!(session_id, 0xDEAD_BEEF);

        let payload = server.join().unwrap();
        assert_eq!(&payload[0..4], &512u32.to_le_bytes());
        assert_eq!(&payload[4..8], &1u32.to_le_bytes());
        assert_eq!(payload[8], 0);
        assert_eq!(&payload[9..13], &1u32.to_le_bytes());
        assert_eq!(&payload[13..21], &0x4_0001u64.to_le_bytes());
        assert_eq!(&payload[21..25], &5u32.to_le_bytes());
        // "Microsoft-Windows-DotNETRuntime" + null = 32 code units.
        assert_eq!(&payload[25..29], &32u32.to_le_bytes());
    }

    #[test]
    fn stop_tracing_uses_a_fresh_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_one_ok(listener, 7);

        stop_tracing(&path, 7).unwrap();
        let payload = server.join().unwrap();
        assert_eq!(&payload[..8], &7u64.to_le_bytes());
    }
}
