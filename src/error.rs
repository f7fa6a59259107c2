use std::io;
use thiserror::Error;

/// Every way a trace stream can fail to decode.
///
/// `Corrupt` and `Protocol` are both fatal format errors; they are kept
/// apart so diagnostics can tell "the bytes are damaged" from "a
/// well-formed stream broke the protocol's ordering rules".
#[derive(Error, Debug)]
pub enum TraceError {
    /// The stream's major version is outside the range this decoder
    /// understands.  Reported before any event is produced.
    #[error("unsupported format version {requested} (supported: {min_supported}..={max_supported})")]
    UnsupportedVersion {
        requested: u32,
        min_supported: u32,
        max_supported: u32,
    },

    /// Structural corruption: short reads, declared lengths exceeding
    /// available bytes, malformed tag sequences, bad magic.
    #[error("corrupt stream: {0}")]
    Corrupt(String),

    /// Protocol-order violation on an otherwise well-formed stream:
    /// metadata/thread redefinition, use after removal, illegal
    /// RelLoc/DataLoc schemas.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TraceError {
    /// True for both format-error classifications, for callers that
    /// don't care which.
    pub fn is_format_error(&self) -> bool {
        matches!(self, TraceError::Corrupt(_) | TraceError::Protocol(_))
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        TraceError::Corrupt(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TraceError::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
