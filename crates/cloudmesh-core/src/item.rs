//! Items: the versioned objects stored in a collection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::Sha1Hash;
use crate::types::ItemId;

/// The version of an item, compared during conflict resolution.
///
/// Field order matters: the derived `Ord` compares `timestamp` first and
/// falls back to `hash`, which is exactly last-writer-wins with a
/// hash tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Milliseconds since the Unix epoch of the last modification.
    pub timestamp: i64,
    /// Content digest.
    pub hash: Sha1Hash,
}

impl Version {
    /// Create a version.
    pub const fn new(timestamp: i64, hash: Sha1Hash) -> Self {
        Self { timestamp, hash }
    }
}

/// Metadata announced in object lists: everything but the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: ItemId,
    pub hash: Sha1Hash,
    pub timestamp: i64,
}

impl ItemSummary {
    /// The version carried by this summary.
    pub const fn version(&self) -> Version {
        Version::new(self.timestamp, self.hash)
    }

    /// Whether `self` and `other` describe different versions of an item.
    pub fn differs_from(&self, other: &ItemSummary) -> bool {
        self.hash != other.hash || self.timestamp != other.timestamp
    }
}

/// A versioned object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Immutable identifier.
    pub id: ItemId,
    /// Digest of the payload at the time it was written.
    pub hash: Sha1Hash,
    /// Last-modified time in Unix milliseconds.
    pub timestamp: i64,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Item {
    /// Build an item, hashing its payload.
    pub fn new(id: ItemId, payload: impl Into<Bytes>, timestamp: i64) -> Self {
        let payload = payload.into();
        Self {
            id,
            hash: Sha1Hash::hash(&payload),
            timestamp,
            payload,
        }
    }

    /// Build an item from parts received off the wire.
    ///
    /// The hash is taken as given; it is not recomputed from the payload.
    pub fn from_parts(id: ItemId, hash: Sha1Hash, timestamp: i64, payload: Bytes) -> Self {
        Self {
            id,
            hash,
            timestamp,
            payload,
        }
    }

    /// Produce the next revision of this item with a new payload.
    pub fn updated(&self, payload: impl Into<Bytes>, timestamp: i64) -> Self {
        Self::new(self.id, payload, timestamp)
    }

    /// The version of this item.
    pub const fn version(&self) -> Version {
        Version::new(self.timestamp, self.hash)
    }

    /// The list-message summary of this item.
    pub const fn summary(&self) -> ItemSummary {
        ItemSummary {
            id: self.id,
            hash: self.hash,
            timestamp: self.timestamp,
        }
    }
}
