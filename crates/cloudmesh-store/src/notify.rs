//! Per-collection change channels shared by the store implementations.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::traits::ChangeEvent;

/// Default number of buffered events per collection before slow
/// subscribers start lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Fan-out of [`ChangeEvent`]s, one broadcast channel per collection.
pub struct ChangeHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
}

impl ChangeHub {
    /// Create a hub whose channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a collection, creating its channel on first use.
    pub fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event. Events for collections nobody watches are dropped.
    pub fn publish(&self, event: ChangeEvent) {
        let channels = self.channels.lock();
        if let Some(sender) = channels.get(&event.collection) {
            // Err only means there are no receivers right now.
            let _ = sender.send(event);
        }
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChangeKind, Provenance};
    use cloudmesh_core::ItemId;

    fn event(collection: &str) -> ChangeEvent {
        ChangeEvent {
            collection: collection.to_string(),
            kind: ChangeKind::Added,
            id: ItemId::from_bytes([1; 16]),
            provenance: Provenance::Local,
        }
    }

    #[tokio::test]
    async fn test_events_reach_only_their_collection() {
        let hub = ChangeHub::default();
        let mut notes = hub.subscribe("notes");
        let mut photos = hub.subscribe("photos");

        hub.publish(event("notes"));

        assert_eq!(notes.recv().await.unwrap(), event("notes"));
        assert!(photos.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let hub = ChangeHub::default();
        hub.publish(event("nobody"));
    }
}
