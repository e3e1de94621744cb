//! # Cloudmesh Core
//!
//! Pure primitives shared by every cloudmesh crate: item identifiers,
//! SHA-1 content digests, versioned items and the last-writer-wins resolver.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`ItemId`] - Opaque 16-byte identifier, stable across the network
//! - [`Sha1Hash`] - 20-byte content digest used for items and file blocks
//! - [`Item`] - A versioned object: id, hash, timestamp and payload
//! - [`Version`] - The `(timestamp, hash)` pair compared during resolution
//! - [`Resolution`] - Outcome of [`resolve`] for an inbound item
//!
//! ## Resolution Order
//!
//! Versions are totally ordered: the greater timestamp wins, and equal
//! timestamps fall back to comparing hashes as raw bytes. A tombstoned id
//! ignores every inbound version.

pub mod clock;
pub mod crypto;
pub mod error;
pub mod item;
pub mod resolve;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{Sha1Hash, Sha1Hasher};
pub use error::{CoreError, Result};
pub use item::{Item, ItemSummary, Version};
pub use resolve::{resolve, Resolution};
pub use types::{ItemId, SessionId};
