//! # Cloudmesh Sync
//!
//! Peer-to-peer reconciliation of object collections and shared files.
//!
//! ## Overview
//!
//! Every TCP connection between two nodes runs one [`Session`]. A session
//! checks that the peers' clocks agree, exchanges full tombstone and item
//! lists for every collection, pulls the items it is missing and then
//! forwards local changes as they happen. Conflicts are settled by
//! last-writer-wins on `(timestamp, hash)`; tombstones always win.
//!
//! Files under a shared directory are kept in sync separately, block by
//! block, so only changed 4 KiB blocks cross the wire.
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- CurrentTime ------------>|
//!   |<------- CurrentTime -------------|
//!   |-------- DeleteList ------------->|   per collection
//!   |-------- ObjectList ------------->|
//!   |<------- DeleteList --------------|
//!   |<------- ObjectList --------------|
//!   |<------- ObjectRequest -----------|   ids B lacks or disagrees on
//!   |-------- ObjectReply ------------>|
//!   |            ... steady ...        |
//!   |-------- ObjectList (1 item) ---->|   local change
//!   |-------- DeleteList (1 id) ------>|   local delete
//!
//!   |-------- FileInfo --------------->|   block sync
//!   |<------- FileHashRequest ---------|
//!   |-------- FileHashReply x N ------>|
//!   |<------- FileBlockRequest --------|   differing blocks only
//!   |-------- FileBlockReply --------->|
//! ```

pub mod blocks;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod messages;
pub mod registry;
pub mod session;

#[cfg(test)]
mod test_util;

pub use blocks::{BlockDiffer, FileDigest, BLOCK_SIZE};
pub use codec::{Frame, FrameCodec, DEFAULT_MAX_FRAME_LEN};
pub use config::SyncConfig;
pub use discovery::{
    memory::MemoryDiscovery, memory::MemoryDiscoveryNetwork, Discovery, PeerRecord,
    StaticDiscovery,
};
pub use error::{Result, SyncError, WireError};
pub use manager::{should_drop_inbound, ConnectionManager, PeerKey};
pub use messages::{Message, Token};
pub use registry::CollectionRegistry;
pub use session::{
    apply_delete_list, apply_object_reply, check_clock_skew, Direction, Session, SessionCommand,
    SessionEnd, SessionHandle, SessionReport, SessionState, SessionStats, SyncContext,
};
