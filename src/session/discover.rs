//! Diagnostic endpoint discovery.
//!
//! The target advertises its diagnostic socket in a well-known temp
//! directory as `dotnet-diagnostic-<pid>-<disambiguator>-socket`; the
//! sampler library advertises its own under a private `.ultra/`
//! subdirectory so the two endpoints cannot be confused. Sockets appear an
//! unpredictable time after process start, so discovery polls with
//! exponential backoff.

use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::run::CancelToken;

const BACKOFF_START: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_millis(100);

/// Directory the runtime uses for its endpoint; with `private` the
/// sampler's isolated `.ultra/` subdirectory.
pub fn diagnostic_dir(private: bool) -> PathBuf {
    let dir = std::env::temp_dir();
    if private {
        dir.join(".ultra")
    } else {
        dir
    }
}

pub fn matches_endpoint(name: &str, pid: u32) -> bool {
    let prefix = format!("dotnet-diagnostic-{pid}-");
    name.starts_with(&prefix) && name.ends_with("-socket")
}

/// Polls `dir` until the endpoint for `pid` appears. Honours the cancel
/// token on every backoff step.
pub fn find_endpoint(
    dir: &Path,
    pid: u32,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    let deadline = Instant::now() + timeout;
    let mut backoff = BACKOFF_START;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::new(ErrorKind::Interrupted, "cancelled"));
        }
        if let Some(found) = scan(dir, pid)? {
            return Ok(found);
        }
        if Instant::now() >= deadline {
            return Err(Error::new(
                ErrorKind::TimedOut,
                format!("no diagnostic endpoint for pid {pid} in {dir:?}"),
            ));
        }
        std::thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

fn scan(dir: &Path, pid: u32) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // The private directory may not exist yet; that's just "not found".
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if matches_endpoint(&entry.file_name().to_string_lossy(), pid) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}
