//! In-memory implementation of the ObjectStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use cloudmesh_core::{Item, ItemId, ItemSummary};

use crate::error::Result;
use crate::notify::ChangeHub;
use crate::traits::{ChangeEvent, ChangeKind, ObjectStore, Provenance, PutResult};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped.
pub struct MemoryStore {
    inner: RwLock<HashMap<String, CollectionState>>,
    hub: ChangeHub,
}

#[derive(Default)]
struct CollectionState {
    /// Live items, ordered by id.
    items: BTreeMap<ItemId, Item>,

    /// Tombstones in removal order.
    tombstones: Vec<ItemId>,

    /// Tombstone membership.
    tombstone_set: HashSet<ItemId>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::with_channel_capacity(crate::notify::DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a store whose change channels buffer `capacity` events.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            hub: ChangeHub::new(capacity),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn collections(&self) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        self.inner
            .write()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<ItemSummary>> {
        let inner = self.inner.read();
        Ok(inner
            .get(collection)
            .map(|c| c.items.values().map(Item::summary).collect())
            .unwrap_or_default())
    }

    async fn get(&self, collection: &str, id: &ItemId) -> Result<Option<Item>> {
        let inner = self.inner.read();
        Ok(inner
            .get(collection)
            .and_then(|c| c.items.get(id))
            .cloned())
    }

    async fn put(&self, collection: &str, item: &Item, provenance: Provenance) -> Result<PutResult> {
        let result = {
            let mut inner = self.inner.write();
            let state = inner.entry(collection.to_string()).or_default();

            if state.tombstone_set.contains(&item.id) {
                return Ok(PutResult::Tombstoned);
            }

            match state.items.insert(item.id, item.clone()) {
                Some(_) => PutResult::Updated,
                None => PutResult::Inserted,
            }
        };

        let kind = match result {
            PutResult::Inserted => ChangeKind::Added,
            _ => ChangeKind::Updated,
        };
        self.hub.publish(ChangeEvent {
            collection: collection.to_string(),
            kind,
            id: item.id,
            provenance,
        });

        Ok(result)
    }

    async fn tombstones(&self, collection: &str) -> Result<Vec<ItemId>> {
        let inner = self.inner.read();
        Ok(inner
            .get(collection)
            .map(|c| c.tombstones.clone())
            .unwrap_or_default())
    }

    async fn is_removed(&self, collection: &str, id: &ItemId) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner
            .get(collection)
            .map(|c| c.tombstone_set.contains(id))
            .unwrap_or(false))
    }

    async fn mark_removed(
        &self,
        collection: &str,
        ids: &[ItemId],
        provenance: Provenance,
    ) -> Result<Vec<ItemId>> {
        let removed = {
            let mut inner = self.inner.write();
            let state = inner.entry(collection.to_string()).or_default();

            let mut removed = Vec::new();
            for id in ids {
                if !state.tombstone_set.insert(*id) {
                    continue;
                }
                state.tombstones.push(*id);
                state.items.remove(id);
                removed.push(*id);
            }
            removed
        };

        for id in &removed {
            self.hub.publish(ChangeEvent {
                collection: collection.to_string(),
                kind: ChangeKind::Deleted,
                id: *id,
                provenance,
            });
        }

        Ok(removed)
    }

    fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeEvent> {
        self.hub.subscribe(collection)
    }
}
