use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::time::Duration;

use futures::executor::block_on;

use super::*;
use crate::run::CancelToken;

const IPC_HEADER: usize = 20;

/// Minimal diagnostic endpoint: accepts the CollectTracing2 connection,
/// acks it, pushes `stream_bytes`, closes; then accepts and acks the
/// StopTracing connection.
fn fake_endpoint(listener: UnixListener, stream_bytes: Vec<u8>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut header = [0u8; IPC_HEADER];
        conn.read_exact(&mut header).unwrap();
        let size = u16::from_le_bytes([header[14], header[15]]) as usize;
        let mut payload = vec![0u8; size - IPC_HEADER];
        conn.read_exact(&mut payload).unwrap();
        conn.write_all(&ok_response(&99u64.to_le_bytes())).unwrap();
        conn.write_all(&stream_bytes).unwrap();
        drop(conn);

        if let Ok((mut conn, _)) = listener.accept() {
            let mut header = [0u8; IPC_HEADER];
            if conn.read_exact(&mut header).is_ok() {
                let size = u16::from_le_bytes([header[14], header[15]]) as usize;
                let mut payload = vec![0u8; size - IPC_HEADER];
                let _ = conn.read_exact(&mut payload);
                let _ = conn.write_all(&ok_response(&99u64.to_le_bytes()));
            }
        }
    })
}

fn ok_response(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(transport::MAGIC);
    out.extend_from_slice(&((IPC_HEADER + payload.len()) as u16).to_le_bytes());
    out.push(0xFF);
    out.push(0x00);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn config(dir: &std::path::Path, file: std::path::PathBuf) -> SessionConfig {
    SessionConfig {
        channel: "clr",
        pid: 42,
        endpoint_dir: dir.to_path_buf(),
        discovery_timeout: Duration::from_secs(1),
        file_path: file,
        buffer_mb: 512,
        request_rundown: false,
        providers: runtime_providers(),
    }
}

#[test]
fn streams_to_file_and_disposes() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("dotnet-diagnostic-42-1-socket");
    let listener = UnixListener::bind(&socket).unwrap();
    let server = fake_endpoint(listener, b"event-stream-bytes".to_vec());

    let file = dir.path().join("out.nettrace");
    let session = Session::new(config(dir.path(), file.clone()));
    assert_eq!(session.state(), State::Connecting);

    block_on(session.start(&CancelToken::new())).unwrap();
    assert_eq!(session.state(), State::Streaming);

    // Producer closed its side; give the copy task a moment to drain.
    std::thread::sleep(Duration::from_millis(100));
    block_on(session.stop_and_dispose());
    assert_eq!(session.state(), State::Disposed);

    assert_eq!(std::fs::read(&file).unwrap(), b"event-stream-bytes");
    server.join().unwrap();
}

#[test]
fn discovery_timeout_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("out.nettrace");
    let mut cfg = config(dir.path(), file);
    cfg.discovery_timeout = Duration::from_millis(50);
    let session = Session::new(cfg);

    let err = block_on(session.start(&CancelToken::new())).unwrap_err();
    assert!(matches!(err, crate::Error::Connect { pid: 42, .. }), "{err:?}");

    // Cleanup still converges even though nothing was ever opened.
    block_on(session.stop_and_dispose());
    assert_eq!(session.state(), State::Disposed);
}

#[test]
fn dispose_converges_even_when_every_step_fails() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("dotnet-diagnostic-42-1-socket");
    let listener = UnixListener::bind(&socket).unwrap();

    // Endpoint acks the start and then disappears entirely: the copy task
    // hits EOF, and StopTracing cannot even connect.
    let server = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut header = [0u8; IPC_HEADER];
        conn.read_exact(&mut header).unwrap();
        let size = u16::from_le_bytes([header[14], header[15]]) as usize;
        let mut payload = vec![0u8; size - IPC_HEADER];
        conn.read_exact(&mut payload).unwrap();
        conn.write_all(&ok_response(&7u64.to_le_bytes())).unwrap();
    });

    let file = dir.path().join("out.nettrace");
    let session = Session::new(config(dir.path(), file.clone()));
    block_on(session.start(&CancelToken::new())).unwrap();
    server.join().unwrap();
    std::fs::remove_file(&socket).unwrap();

    block_on(session.stop_and_dispose());
    assert_eq!(session.state(), State::Disposed);
    // The file handle was released regardless.
    assert!(file.exists());

    // Idempotent.
    block_on(session.stop_and_dispose());
    assert_eq!(session.state(), State::Disposed);
}

#[test]
fn dispose_before_start_cancels_the_start() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("out.nettrace");
    let session = Session::new(config(dir.path(), file));

    block_on(session.stop_and_dispose());
    assert_eq!(session.state(), State::Disposed);

    let err = block_on(session.start(&CancelToken::new())).unwrap_err();
    assert!(matches!(err, crate::Error::Cancelled));
}
