//! Error types surfaced by the counter store.

use std::fmt;
use std::io;

/// Errors from opening, rotating, or allocating in a counter file.
///
/// None of these ever reach `inc`/`add` callers: user-facing increments are
/// silent no-ops on failure. They are surfaced to the registry, which logs
/// them on the debug channel and leaves the previous state in place.
#[derive(Debug)]
pub enum CounterError {
    /// Telemetry is disabled by the mode file or environment.
    Disabled,
    /// No program identity was supplied, so no file name can be formed.
    MissingBuildInfo,
    /// The metadata block exceeds the fixed 512-byte budget.
    MetadataTooLong(usize),
    /// The counter name exceeds the fixed 256-byte budget. Only the one
    /// counter is affected.
    NameTooLong(usize),
    /// An existing file does not start with the expected magic and metadata.
    HeaderMismatch,
    /// A chain walk or record header failed validation inside the current
    /// mapping bounds. The file may have been written by a newer version.
    Corrupt,
    /// File create/open/stat/write/mmap failed.
    Io(io::Error),
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "counter: disabled by telemetry mode"),
            Self::MissingBuildInfo => write!(f, "counter: missing build info"),
            Self::MetadataTooLong(n) => write!(f, "counter: metadata too long ({n} bytes)"),
            Self::NameTooLong(n) => write!(f, "counter: name too long ({n} bytes)"),
            Self::HeaderMismatch => write!(f, "counter: header mismatch"),
            Self::Corrupt => write!(f, "counter: corrupt counter file"),
            Self::Io(e) => write!(f, "counter: {e}"),
        }
    }
}

impl std::error::Error for CounterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CounterError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
