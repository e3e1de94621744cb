//! Session configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_LEN;

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Largest tolerated difference between our clock and the peer's.
    pub max_clock_skew_ms: i64,
    /// Ceiling on a frame's length header.
    pub max_frame_len: usize,
    /// Directory whose files are kept in sync block by block.
    /// Block sync is off when unset.
    pub shared_dir: Option<PathBuf>,
    /// Redial once when the peer cleanly closes an outbound connection.
    pub reconnect_on_remote_close: bool,
    /// Capacity of each session's command channel.
    pub command_queue: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_ms: 3_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            shared_dir: None,
            reconnect_on_remote_close: true,
            command_queue: 32,
        }
    }
}
