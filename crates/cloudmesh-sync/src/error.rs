//! Error types for the sync module.

use thiserror::Error;

/// Errors raised while framing or parsing wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The length header announces more than the configured ceiling.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// A frame with a zero length header carries no token.
    #[error("empty frame")]
    EmptyFrame,

    /// The token byte names no known command.
    #[error("unknown command token {0:#04x}")]
    UnknownToken(u8),

    /// The payload ended before a field could be read.
    #[error("truncated payload while reading {0}")]
    Truncated(&'static str),

    /// Bytes were left over after the last field.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A fixed-width field has the wrong size.
    #[error("invalid field: {0}")]
    InvalidField(#[from] cloudmesh_core::CoreError),

    /// Socket error while reading or writing frames.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The byte stream cannot be framed or a frame is malformed.
    #[error("framing error: {0}")]
    Framing(WireError),

    /// The peer sent something this side cannot act on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket-level failure.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer's clock is too far from ours.
    #[error("clock skew of {skew_ms} ms exceeds {max_skew_ms} ms")]
    ClockSkew { skew_ms: i64, max_skew_ms: i64 },

    /// Disk failure during block sync.
    #[error("file error on {name}: {source}")]
    FileIo {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] cloudmesh_store::StoreError),
}

impl SyncError {
    /// Whether this error ends the session.
    ///
    /// Protocol, file and store errors only cost the message that caused them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Framing(_) | SyncError::Connection(_) | SyncError::ClockSkew { .. }
        )
    }

    pub(crate) fn file(name: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::FileIo {
            name: name.into(),
            source,
        }
    }
}

impl From<WireError> for SyncError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::UnknownToken(_) => SyncError::Protocol(e.to_string()),
            WireError::Io(io) => SyncError::Connection(io),
            other => SyncError::Framing(other),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Connection(std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
