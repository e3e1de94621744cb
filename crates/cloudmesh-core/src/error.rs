//! Error types for cloudmesh core.

use thiserror::Error;

/// Errors raised while building core values from untrusted bytes.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid length for {what}: expected {expected} bytes, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
