//! ObjectStore trait: the abstract interface for collection persistence.
//!
//! This trait keeps the sync layer storage-agnostic. Implementations
//! include SQLite (durable) and in-memory (tests, ephemeral nodes).

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use cloudmesh_core::{Item, ItemId, ItemSummary, SessionId};

use crate::error::Result;

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// An application write on this node.
    Local,
    /// Accepted from a peer by the given sync session.
    Sync(SessionId),
}

impl Provenance {
    /// Whether this write was caused by `session`.
    pub fn is_from(&self, session: SessionId) -> bool {
        matches!(self, Provenance::Sync(s) if *s == session)
    }
}

/// Kind of change published on a collection's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// A change to one item of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: String,
    pub kind: ChangeKind,
    pub id: ItemId,
    pub provenance: Provenance,
}

/// Result of writing an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// The id was new to the collection.
    Inserted,
    /// An existing item was replaced.
    Updated,
    /// The id is tombstoned; nothing was written.
    Tombstoned,
}

/// The ObjectStore trait: async interface for collection persistence.
///
/// # Design Notes
///
/// - **Tombstones are final**: once an id is tombstoned, `put` refuses it.
/// - **Changes are published**: every successful `put` and every newly
///   tombstoned id produces one [`ChangeEvent`] on the collection's channel.
/// - **Collections are implicit**: writing to an unknown collection creates it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Collections
    // ─────────────────────────────────────────────────────────────────────────

    /// Names of all collections this store knows about.
    async fn collections(&self) -> Result<Vec<String>>;

    /// Make sure a collection exists, even if empty.
    async fn create_collection(&self, collection: &str) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Items
    // ─────────────────────────────────────────────────────────────────────────

    /// Summaries of every live item, ordered by id.
    async fn list(&self, collection: &str) -> Result<Vec<ItemSummary>>;

    /// Fetch a live item with its payload.
    async fn get(&self, collection: &str, id: &ItemId) -> Result<Option<Item>>;

    /// Store an item, replacing any existing version.
    async fn put(&self, collection: &str, item: &Item, provenance: Provenance) -> Result<PutResult>;

    // ─────────────────────────────────────────────────────────────────────────
    // Tombstones
    // ─────────────────────────────────────────────────────────────────────────

    /// Every tombstoned id, in the order they were removed.
    async fn tombstones(&self, collection: &str) -> Result<Vec<ItemId>>;

    /// Whether an id is tombstoned.
    async fn is_removed(&self, collection: &str, id: &ItemId) -> Result<bool>;

    /// Tombstone ids and drop their live items.
    ///
    /// Returns only the ids that were not already tombstoned.
    async fn mark_removed(
        &self,
        collection: &str,
        ids: &[ItemId],
        provenance: Provenance,
    ) -> Result<Vec<ItemId>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to changes on a collection.
    fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeEvent>;
}

/// Extension trait for application-side writes.
pub trait ObjectStoreExt: ObjectStore {
    /// Create a new item with a fresh id.
    fn insert_local(
        &self,
        collection: &str,
        payload: impl Into<Bytes> + Send,
        now: i64,
    ) -> impl std::future::Future<Output = Result<Item>> + Send;

    /// Replace the payload of an existing id, stamping it with `now`.
    fn update_local(
        &self,
        collection: &str,
        id: ItemId,
        payload: impl Into<Bytes> + Send,
        now: i64,
    ) -> impl std::future::Future<Output = Result<PutResult>> + Send;

    /// Delete ids locally.
    fn remove_local(
        &self,
        collection: &str,
        ids: &[ItemId],
    ) -> impl std::future::Future<Output = Result<Vec<ItemId>>> + Send;
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {
    async fn insert_local(
        &self,
        collection: &str,
        payload: impl Into<Bytes> + Send,
        now: i64,
    ) -> Result<Item> {
        let item = Item::new(ItemId::random(), payload, now);
        self.put(collection, &item, Provenance::Local).await?;
        Ok(item)
    }

    async fn update_local(
        &self,
        collection: &str,
        id: ItemId,
        payload: impl Into<Bytes> + Send,
        now: i64,
    ) -> Result<PutResult> {
        let item = Item::new(id, payload, now);
        self.put(collection, &item, Provenance::Local).await
    }

    async fn remove_local(&self, collection: &str, ids: &[ItemId]) -> Result<Vec<ItemId>> {
        self.mark_removed(collection, ids, Provenance::Local).await
    }
}
