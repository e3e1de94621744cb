//! Error types for the daemon.

use cloudmesh_store::StoreError;
use cloudmesh_sync::SyncError;
use thiserror::Error;

/// Errors that can occur while starting or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Socket or file error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid JSON for [`crate::NodeConfig`].
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync or discovery error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Every random port we tried was taken.
    #[error("no free port after {attempts} attempts")]
    NoFreePort { attempts: usize },
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
