//! Last-writer-wins conflict resolution.
//!
//! [`resolve`] is a pure decision over metadata; it never looks at payloads.
//! Given the same two versions, both peers reach the same winner regardless
//! of which side is "local".

use crate::item::Version;

/// Outcome of resolving an inbound item against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The id is tombstoned locally; the inbound item is dropped.
    Tombstoned,
    /// No local item with this id exists; store the inbound one.
    Insert,
    /// The inbound item has a later timestamp.
    AcceptNewer,
    /// Timestamps tie and the inbound hash is greater.
    AcceptHigherHash,
    /// The local item has a later timestamp.
    KeepNewer,
    /// Timestamps tie and the local hash is greater.
    KeepHigherHash,
    /// Timestamps and hashes both match; the items are assumed identical.
    Identical,
}

impl Resolution {
    /// Whether the inbound item should be written to the store.
    pub const fn accepts_remote(self) -> bool {
        matches!(
            self,
            Resolution::Insert | Resolution::AcceptNewer | Resolution::AcceptHigherHash
        )
    }

    /// Short label for logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Resolution::Tombstoned => "tombstoned",
            Resolution::Insert => "insert",
            Resolution::AcceptNewer => "theirs on timestamp",
            Resolution::AcceptHigherHash => "theirs on hash",
            Resolution::KeepNewer => "ours on timestamp",
            Resolution::KeepHigherHash => "ours on hash",
            Resolution::Identical => "identical",
        }
    }
}

/// Decide what to do with an inbound item.
///
/// A tombstone wins unconditionally. Otherwise a missing local item is
/// inserted, and an existing one is compared by timestamp, then by hash as
/// raw bytes. Equal hashes on equal timestamps are a no-op: byte equality of
/// the payloads is not verified.
pub fn resolve(local: Option<&Version>, remote: &Version, tombstoned: bool) -> Resolution {
    if tombstoned {
        return Resolution::Tombstoned;
    }

    let Some(local) = local else {
        return Resolution::Insert;
    };

    use std::cmp::Ordering;
    match local.timestamp.cmp(&remote.timestamp) {
        Ordering::Greater => Resolution::KeepNewer,
        Ordering::Less => Resolution::AcceptNewer,
        Ordering::Equal => match local.hash.cmp(&remote.hash) {
            Ordering::Greater => Resolution::KeepHigherHash,
            Ordering::Less => Resolution::AcceptHigherHash,
            Ordering::Equal => Resolution::Identical,
        },
    }
}
