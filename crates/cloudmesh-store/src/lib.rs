//! # Cloudmesh Store
//!
//! The object store behind every synchronised collection. Provides a
//! trait-based interface with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! A store holds named collections. Each collection maps [`ItemId`]s to
//! items and keeps a tombstone set of deleted ids. Every write carries a
//! [`Provenance`], and every change is published on a per-collection
//! broadcast channel so sync sessions can forward deltas to their peers.
//!
//! ## Key Types
//!
//! - [`ObjectStore`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests and ephemeral nodes
//! - [`ChangeEvent`] - A published add, update or delete
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cloudmesh_store::{MemoryStore, ObjectStoreExt};
//!
//! async fn example() {
//!     let store = MemoryStore::new();
//!     let item = store.insert_local("notes", &b"hello"[..], 1_700_000_000_000).await.unwrap();
//!     store.remove_local("notes", &[item.id]).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Tombstones are final**: `put` on a tombstoned id returns `PutResult::Tombstoned`
//! - **Idempotent removal**: `mark_removed` reports only newly tombstoned ids
//! - **No resolution here**: the store writes what it is given; conflict
//!   resolution happens in the sync layer before `put`
//!
//! [`ItemId`]: cloudmesh_core::ItemId

pub mod error;
pub mod memory;
pub mod migration;
pub mod notify;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use notify::ChangeHub;
pub use sqlite::SqliteStore;
pub use traits::{ChangeEvent, ChangeKind, ObjectStore, ObjectStoreExt, Provenance, PutResult};
