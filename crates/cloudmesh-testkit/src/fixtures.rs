//! Test fixtures and helpers.
//!
//! Common setup code for session and integration tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use cloudmesh_core::{Item, ItemId, ItemSummary, ManualClock};
use cloudmesh_store::{MemoryStore, ObjectStore, ObjectStoreExt};
use cloudmesh_sync::{Direction, Session, SessionHandle, SessionReport, SyncConfig, SyncContext};

/// The time every fixture clock starts at: 2025-01-14T16:00:00Z.
pub const FIXED_NOW: i64 = 1_736_870_400_000;

/// Poll `check` until it holds, panicking after about five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// One side of a sync test: a memory store, a manual clock and a context.
#[derive(Clone)]
pub struct TestNode {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub ctx: SyncContext,
}

impl TestNode {
    /// A node with default sync settings.
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(FIXED_NOW));
        let ctx = SyncContext::new(store.clone(), config).with_clock(clock.clone());
        Self { store, clock, ctx }
    }

    /// Insert a new item stamped with the node's clock.
    pub async fn insert(&self, collection: &str, payload: impl Into<Bytes> + Send) -> Item {
        let now = self.ctx.clock.now_millis();
        self.store
            .insert_local(collection, payload, now)
            .await
            .unwrap()
    }

    /// Delete items locally.
    pub async fn remove(&self, collection: &str, ids: &[ItemId]) {
        self.store.remove_local(collection, ids).await.unwrap();
    }

    /// Live summaries and sorted tombstones of a collection.
    pub async fn snapshot(&self, collection: &str) -> (Vec<ItemSummary>, Vec<ItemId>) {
        let items = self.store.list(collection).await.unwrap();
        let mut tombstones = self.store.tombstones(collection).await.unwrap();
        tombstones.sort();
        (items, tombstones)
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Two nodes joined by a session pair over an in-memory pipe.
pub struct SyncPair {
    pub a: TestNode,
    pub b: TestNode,
    handle_a: SessionHandle,
    handle_b: SessionHandle,
    task_a: JoinHandle<SessionReport>,
    task_b: JoinHandle<SessionReport>,
}

impl SyncPair {
    /// Connect two fresh nodes.
    pub fn start() -> Self {
        Self::connect(TestNode::new(), TestNode::new())
    }

    /// Connect two prepared nodes. `a` is the dialing side.
    pub fn connect(a: TestNode, b: TestNode) -> Self {
        let (io_a, io_b) = tokio::io::duplex(256 * 1024);
        let (session_a, handle_a) = Session::new(a.ctx.clone(), io_a, Direction::Outbound, "b");
        let (session_b, handle_b) = Session::new(b.ctx.clone(), io_b, Direction::Inbound, "a");
        Self {
            a,
            b,
            handle_a,
            handle_b,
            task_a: tokio::spawn(session_a.run()),
            task_b: tokio::spawn(session_b.run()),
        }
    }

    pub fn handle_a(&self) -> &SessionHandle {
        &self.handle_a
    }

    pub fn handle_b(&self) -> &SessionHandle {
        &self.handle_b
    }

    /// Wait until both nodes know `collections` and hold the same items
    /// and tombstones in each.
    pub async fn wait_converged(&self, collections: &[&str]) {
        let (a, b) = (self.a.clone(), self.b.clone());
        let names: Vec<String> = collections.iter().map(|c| c.to_string()).collect();
        eventually(|| {
            let (a, b, names) = (a.clone(), b.clone(), names.clone());
            async move {
                let known_a = a.store.collections().await.unwrap();
                let known_b = b.store.collections().await.unwrap();
                for name in &names {
                    if !known_a.contains(name) || !known_b.contains(name) {
                        return false;
                    }
                    if a.snapshot(name).await != b.snapshot(name).await {
                        return false;
                    }
                }
                true
            }
        })
        .await;
    }

    /// Disconnect both sessions and collect their reports.
    pub async fn stop(self) -> (SessionReport, SessionReport) {
        self.handle_a.disconnect().await;
        self.handle_b.disconnect().await;
        (self.task_a.await.unwrap(), self.task_b.await.unwrap())
    }

    /// Wait for both sessions to end on their own.
    pub async fn join(self) -> (SessionReport, SessionReport) {
        (self.task_a.await.unwrap(), self.task_b.await.unwrap())
    }
}
