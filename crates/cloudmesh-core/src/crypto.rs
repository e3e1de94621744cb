//! Content digests.
//!
//! Items and file blocks are both addressed by a 20-byte SHA-1 digest.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

use crate::error::CoreError;

/// A 20-byte SHA-1 digest.
///
/// Ordering is lexicographic over the raw bytes, which is the tie-break
/// order used by [`crate::resolve`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sha1Hash(pub [u8; 20]);

impl Sha1Hash {
    /// Width of a digest on the wire.
    pub const LEN: usize = 20;

    /// Compute the SHA-1 digest of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The zero digest (sentinel value).
    pub const ZERO: Self = Self([0u8; 20]);
}

/// Incremental SHA-1 over data that arrives in pieces (whole-file digests).
#[derive(Default, Clone)]
pub struct Sha1Hasher(Sha1);

impl Sha1Hasher {
    /// Start a new digest.
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    /// Feed more data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finish and return the digest.
    pub fn finalize(self) -> Sha1Hash {
        Sha1Hash(self.0.finalize().into())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Sha1Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 20]> for Sha1Hash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Sha1Hash {
    type Error = CoreError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 20] = slice.try_into().map_err(|_| CoreError::InvalidLength {
            what: "sha1 digest",
            expected: Self::LEN,
            got: slice.len(),
        })?;
        Ok(Self(arr))
    }
}
