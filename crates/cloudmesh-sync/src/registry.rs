//! Known collections and their resolution locks.
//!
//! One registry is owned by the process (or by each test) and shared by
//! `Arc` with every session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Tracks collection names and hands out one async lock per collection.
///
/// The lock guards the read-resolve-write sequence for inbound items so two
/// sessions cannot interleave on the same collection. Distinct collections
/// never contend.
pub struct CollectionRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    added: broadcast::Sender<String>,
}

impl CollectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (added, _) = broadcast::channel(256);
        Self {
            locks: Mutex::new(HashMap::new()),
            added,
        }
    }

    /// Record a collection name. Returns `true` if it was not known before.
    pub fn register(&self, name: &str) -> bool {
        let inserted = {
            let mut locks = self.locks.lock();
            if locks.contains_key(name) {
                false
            } else {
                locks.insert(name.to_string(), Arc::default());
                true
            }
        };

        if inserted {
            tracing::debug!(collection = name, "registered collection");
            // No receivers just means no session is running.
            let _ = self.added.send(name.to_string());
        }
        inserted
    }

    /// Whether a collection is known.
    pub fn contains(&self, name: &str) -> bool {
        self.locks.lock().contains_key(name)
    }

    /// Every known collection, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.locks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// The resolution lock for a collection, registering it if needed.
    pub fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.locks.lock().get(name) {
            return lock.clone();
        }
        self.register(name);
        self.locks.lock().get(name).cloned().unwrap_or_default()
    }

    /// Notifications of newly registered collections.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.added.subscribe()
    }
}

impl Default for CollectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let registry = CollectionRegistry::new();
        assert!(registry.register("notes"));
        assert!(!registry.register("notes"));
        assert!(registry.register("photos"));
        assert_eq!(registry.names(), vec!["notes", "photos"]);
    }

    #[test]
    fn test_lock_is_shared_per_collection() {
        let registry = CollectionRegistry::new();
        let a = registry.lock_for("notes");
        let b = registry.lock_for("notes");
        let c = registry.lock_for("photos");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(registry.contains("photos"));
    }

    #[tokio::test]
    async fn test_new_collections_are_announced() {
        let registry = CollectionRegistry::new();
        let mut rx = registry.subscribe();
        registry.register("notes");
        registry.register("notes");
        assert_eq!(rx.recv().await.unwrap(), "notes");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_separate_registries_are_isolated() {
        let a = CollectionRegistry::new();
        let b = CollectionRegistry::new();
        a.register("notes");
        assert!(!b.contains("notes"));
    }
}
