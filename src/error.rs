use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Profiler error taxonomy.
///
/// `TargetExited` is deliberately absent: all target processes ending before
/// the duration elapsed is a clean end of polling, not a failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid options. Raised before any session opens.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Discovery timed out or the endpoint rejected us.
    ///
    /// Fatal for the runtime channel. The sampler channel swallows this
    /// and the run proceeds without native samples.
    #[error("cannot connect to {channel} channel of process {pid}: {reason}")]
    Connect {
        channel: &'static str,
        pid: u32,
        reason: String,
    },

    /// Reading or writing an intermediate file, or the final trace.
    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A peer thread could not be suspended. Per-thread recoverable; only
    /// surfaced when the sampler cannot continue at all.
    #[error("sampler: {0}")]
    Suspend(String),

    /// The user asked to stop. Not a failure.
    #[error("cancelled")]
    Cancelled,
}

/// Option validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("process {0} does not exist")]
    NoSuchProcess(u32),
    #[error("{} is not an executable file", .0.display())]
    NotExecutable(PathBuf),
    #[error("no target: give at least one pid or a program to launch")]
    NoTarget,
    #[error("duration must be positive")]
    NonPositiveDuration,
    #[error("sampling interval must be at least 1ms")]
    IntervalTooSmall,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for the CLI: 0 success, 1 user cancel,
    /// 2 invalid argument, 3 target not found, 4 runtime failure.
    ///
    /// Code 1 belongs to cancellation alone; an I/O or sampler fault must
    /// not read as "the user pressed Ctrl-C" to a calling script.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Cancelled => 1,
            Error::Config(ConfigError::NoSuchProcess(_)) => 3,
            Error::Config(_) => 2,
            Error::Connect { .. } => 3,
            Error::Io { .. } | Error::Suspend(_) => 4,
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use super::*;

    #[test]
    fn exit_codes_by_taxonomy() {
        assert_eq!(Error::Cancelled.exit_code(), 1);
        assert_eq!(Error::Config(ConfigError::NonPositiveDuration).exit_code(), 2);
        assert_eq!(Error::Config(ConfigError::NoSuchProcess(1)).exit_code(), 3);
        let connect = Error::Connect {
            channel: "clr",
            pid: 1,
            reason: "timed out".into(),
        };
        assert_eq!(connect.exit_code(), 3);
    }

    #[test]
    fn runtime_failures_do_not_look_like_a_cancel() {
        let io = Error::io("/tmp/trace.json.gz", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(io.exit_code(), 4);
        assert_eq!(Error::Suspend("resume failed".into()).exit_code(), 4);
    }
}
