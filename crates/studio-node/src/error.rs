use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the runtime bootstrap and the supervised launch sequence.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported platform: os={os} arch={arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("invalid runtime version {version:?}: {why}")]
    InvalidVersion { version: String, why: &'static str },

    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("download {url}: {message}")]
    Download { url: String, message: String },

    #[error("sha256 mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("extract {}: {message}", archive.display())]
    Extraction { archive: PathBuf, message: String },

    #[error("set permissions on {}", path.display())]
    Permission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bundled script not found: {}", path.display())]
    MissingBundledScript { path: PathBuf },

    #[error("{program} exited with status {code}")]
    CommandFailed { program: String, code: i32 },

    #[error("spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server process is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("install signal handlers")]
    Signal {
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable upper-snake label for reports.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnsupportedPlatform { .. } => "UNSUPPORTED_PLATFORM",
            Error::InvalidVersion { .. } => "INVALID_VERSION",
            Error::LockTimeout { .. } => "LOCK_TIMEOUT",
            Error::Download { .. } => "DOWNLOAD_FAILED",
            Error::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Error::Extraction { .. } => "EXTRACTION_FAILED",
            Error::Permission { .. } => "PERMISSION_FAILED",
            Error::Io { .. } => "IO_ERROR",
            Error::MissingBundledScript { .. } => "MISSING_BUNDLED_SCRIPT",
            Error::CommandFailed { .. } => "COMMAND_FAILED",
            Error::Spawn { .. } => "SPAWN_FAILED",
            Error::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Error::Signal { .. } => "SIGNAL_SETUP_FAILED",
        }
    }

    /// Whether re-invoking the launcher may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::Download { .. }
                | Error::ChecksumMismatch { .. }
                | Error::Extraction { .. }
        )
    }
}
