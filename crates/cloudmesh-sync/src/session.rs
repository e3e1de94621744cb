//! The synchroniser session: one protocol state machine per connection.
//!
//! ```text
//! Connected --CurrentTime ok--> ClockChecked --> Reconciling --> Steady
//!     \______________________________ error ___________________/ -> Closed
//! ```
//!
//! On start each side sends `CurrentTime`. Once the peer's clock is within
//! tolerance the session subscribes to every known collection, sends its
//! full `DeleteList` and `ObjectList` for each, and enters `Steady`, where
//! local store changes go out as single-item deltas. Content only moves on
//! explicit `ObjectRequest`.
//!
//! The session reads on its own task and hands outbound frames to a writer
//! task, so a slow peer never stalls inbound processing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamMap;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

use cloudmesh_core::{resolve, Clock, Item, ItemId, ItemSummary, Resolution, SessionId, SystemClock};
use cloudmesh_store::{ChangeEvent, ChangeKind, ObjectStore, Provenance, PutResult};

use crate::blocks::BlockDiffer;
use crate::codec::{Frame, FrameCodec};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError, WireError};
use crate::messages::Message;
use crate::registry::CollectionRegistry;

/// How long a closing session waits for queued frames to drain.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session shares with the rest of the process.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn ObjectStore>,
    pub registry: Arc<CollectionRegistry>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
}

impl SyncContext {
    /// A context with a fresh registry and the system clock.
    pub fn new(store: Arc<dyn ObjectStore>, config: SyncConfig) -> Self {
        Self {
            store,
            registry: Arc::new(CollectionRegistry::new()),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share an existing registry.
    pub fn with_registry(mut self, registry: Arc<CollectionRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Protocol state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connected,
    ClockChecked,
    Reconciling,
    Steady,
    Closed,
}

/// Instructions from the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Close the connection. Never followed by a reconnect.
    Disconnect,
    /// Offer a file under the shared directory to the peer.
    AnnounceFile(String),
}

/// Why a session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// The peer closed the connection cleanly.
    RemoteClosed,
    /// We were told to disconnect.
    LocalDisconnect,
    /// A fatal error tore the session down.
    Error(SyncError),
}

/// Counters collected over a session's life.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// `ObjectRequest`s sent.
    pub items_requested: usize,
    /// Inbound items written to the store.
    pub items_accepted: usize,
    /// Inbound items that lost resolution.
    pub items_rejected: usize,
    /// Ids newly tombstoned from the peer's delete lists.
    pub tombstones_applied: usize,
    /// Single-item deltas forwarded to the peer.
    pub deltas_sent: usize,
    /// `FileBlockRequest`s sent.
    pub blocks_requested: usize,
    /// Blocks written to disk.
    pub blocks_written: usize,
    /// Recoverable errors logged and skipped.
    pub errors_absorbed: usize,
}

/// Result of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    pub direction: Direction,
    pub end: SessionEnd,
    pub stats: SessionStats,
}

/// Handle for steering a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// The session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Ask the session to close. Returns `false` if it already ended.
    pub async fn disconnect(&self) -> bool {
        self.commands.send(SessionCommand::Disconnect).await.is_ok()
    }

    /// Ask the session to announce a shared file.
    pub async fn announce_file(&self, name: impl Into<String>) -> bool {
        self.commands
            .send(SessionCommand::AnnounceFile(name.into()))
            .await
            .is_ok()
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Reject a peer whose clock differs from ours by more than `max_skew_ms`.
pub fn check_clock_skew(local_ms: i64, remote_ms: i64, max_skew_ms: i64) -> Result<()> {
    let skew_ms = local_ms.saturating_sub(remote_ms).saturating_abs();
    if skew_ms > max_skew_ms {
        return Err(SyncError::ClockSkew {
            skew_ms,
            max_skew_ms,
        });
    }
    Ok(())
}

/// Tombstone the ids of a peer's delete list under the collection lock.
///
/// Returns the ids that were not already tombstoned.
pub async fn apply_delete_list(
    ctx: &SyncContext,
    collection: &str,
    ids: &[ItemId],
    provenance: Provenance,
) -> Result<Vec<ItemId>> {
    let lock = ctx.registry.lock_for(collection);
    let _guard = lock.lock().await;
    Ok(ctx.store.mark_removed(collection, ids, provenance).await?)
}

/// Resolve an inbound item against local state and store it if it wins.
pub async fn apply_object_reply(
    ctx: &SyncContext,
    collection: &str,
    item: &Item,
    provenance: Provenance,
) -> Result<Resolution> {
    let lock = ctx.registry.lock_for(collection);
    let _guard = lock.lock().await;

    let tombstoned = ctx.store.is_removed(collection, &item.id).await?;
    let local = ctx.store.get(collection, &item.id).await?;
    let resolution = resolve(
        local.as_ref().map(Item::version).as_ref(),
        &item.version(),
        tombstoned,
    );

    if resolution.accepts_remote()
        && ctx.store.put(collection, item, provenance).await? == PutResult::Tombstoned
    {
        return Ok(Resolution::Tombstoned);
    }
    Ok(resolution)
}

/// A synchroniser session bound to one connection.
pub struct Session<T> {
    id: SessionId,
    ctx: SyncContext,
    io: T,
    direction: Direction,
    peer: String,
    commands: mpsc::Receiver<SessionCommand>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a session over `io`. Nothing happens until [`Session::run`].
    pub fn new(
        ctx: SyncContext,
        io: T,
        direction: Direction,
        peer: impl Into<String>,
    ) -> (Self, SessionHandle) {
        let id = SessionId::next();
        let (tx, rx) = mpsc::channel(ctx.config.command_queue.max(1));
        let session = Self {
            id,
            ctx,
            io,
            direction,
            peer: peer.into(),
            commands: rx,
        };
        (session, SessionHandle { id, commands: tx })
    }

    /// The session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Run the protocol until the connection ends.
    pub async fn run(self) -> SessionReport {
        let span = tracing::info_span!(
            "session",
            id = %self.id,
            peer = %self.peer,
            direction = %self.direction,
        );
        let Self {
            id,
            ctx,
            io,
            direction,
            commands,
            ..
        } = self;

        let (read_half, write_half) = tokio::io::split(io);
        let codec = FrameCodec::new(ctx.config.max_frame_len);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let mut writer = tokio::spawn(
            write_loop(FramedWrite::new(write_half, codec.clone()), outbound_rx)
                .instrument(span.clone()),
        );

        let blocks = ctx.config.shared_dir.clone().map(BlockDiffer::new);
        let added = BroadcastStream::new(ctx.registry.subscribe());
        let mut driver = Driver {
            id,
            ctx,
            reader: FramedRead::new(read_half, codec),
            outbound,
            commands,
            commands_open: true,
            state: SessionState::Connected,
            changes: StreamMap::new(),
            added,
            blocks,
            deferred_files: Vec::new(),
            stats: SessionStats::default(),
        };

        let end = async {
            tracing::info!("session started");
            let end = match driver.drive().await {
                Ok(end) => end,
                Err(e) => {
                    tracing::warn!(error = %e, "session failed");
                    SessionEnd::Error(e)
                }
            };
            driver.state = SessionState::Closed;
            tracing::info!(?end, stats = ?driver.stats, "session closed");
            end
        }
        .instrument(span)
        .await;

        let Driver { outbound, stats, .. } = driver;
        drop(outbound);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }

        SessionReport {
            id,
            direction,
            end,
            stats,
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) where
    W: AsyncWrite + Unpin,
{
    let result: std::result::Result<(), WireError> = async {
        while let Some(message) = outbound.recv().await {
            sink.feed(message).await?;
            while let Ok(more) = outbound.try_recv() {
                sink.feed(more).await?;
            }
            SinkExt::<Message>::flush(&mut sink).await?;
        }
        SinkExt::<Message>::close(&mut sink).await
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, "writer stopped");
    }
}

/// Mutable state of a running session.
struct Driver<R> {
    id: SessionId,
    ctx: SyncContext,
    reader: FramedRead<R, FrameCodec>,
    outbound: mpsc::UnboundedSender<Message>,
    commands: mpsc::Receiver<SessionCommand>,
    commands_open: bool,
    state: SessionState,
    changes: StreamMap<String, BroadcastStream<ChangeEvent>>,
    added: BroadcastStream<String>,
    blocks: Option<BlockDiffer>,
    deferred_files: Vec<String>,
    stats: SessionStats,
}

impl<R> Driver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn drive(&mut self) -> Result<SessionEnd> {
        let now = self.ctx.clock.now_millis();
        self.send(Message::CurrentTime { millis: now })?;

        loop {
            tokio::select! {
                frame = self.reader.next() => match frame {
                    None => return Ok(SessionEnd::RemoteClosed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(frame)) => {
                        let result = self.handle_frame(frame).await;
                        self.absorb(result)?;
                    }
                },
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(SessionCommand::Disconnect) => return Ok(SessionEnd::LocalDisconnect),
                    Some(SessionCommand::AnnounceFile(name)) => {
                        let result = self.announce_file(name).await;
                        self.absorb(result)?;
                    }
                    None => self.commands_open = false,
                },
                Some((collection, event)) = self.changes.next(), if self.state == SessionState::Steady => {
                    let result = self.forward_change(collection, event).await;
                    self.absorb(result)?;
                }
                Some(added) = self.added.next(), if self.state == SessionState::Steady => {
                    let result = self.on_collection_added(added).await;
                    self.absorb(result)?;
                }
            }
        }
    }

    /// Log and swallow recoverable errors; pass fatal ones through.
    fn absorb(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if !e.is_fatal() => {
                tracing::warn!(error = %e, "ignoring message");
                self.stats.errors_absorbed += 1;
                Ok(())
            }
            other => other,
        }
    }

    fn send(&mut self, message: Message) -> Result<()> {
        tracing::trace!(token = ?message.token(), "send");
        self.outbound.send(message).map_err(|_| {
            SyncError::Connection(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "writer closed",
            ))
        })
    }

    fn differ(&mut self) -> Result<&mut BlockDiffer> {
        self.blocks
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("block sync is not enabled".into()))
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let message = Message::decode(frame)?;
        tracing::trace!(token = ?message.token(), "recv");

        if self.state == SessionState::Connected && !matches!(message, Message::CurrentTime { .. }) {
            return Err(SyncError::Protocol(format!(
                "{:?} before clock check",
                message.token()
            )));
        }

        match message {
            Message::CurrentTime { millis } => self.on_current_time(millis).await,
            Message::DeleteList { collection, ids } => self.on_delete_list(collection, ids).await,
            Message::ObjectList { collection, items } => {
                self.on_object_list(collection, items).await
            }
            Message::ObjectRequest { collection, id } => {
                self.on_object_request(collection, id).await
            }
            Message::ObjectReply { collection, item } => {
                self.on_object_reply(collection, item).await
            }
            Message::FileInfo { name, size, hash } => {
                let request = self.differ()?.on_file_info(&name, size, hash).await?;
                if let Some(request) = request {
                    self.send(request)?;
                }
                Ok(())
            }
            Message::FileHashRequest { name } => {
                let replies = self.differ()?.on_hash_request(&name).await?;
                for reply in replies {
                    self.send(reply)?;
                }
                Ok(())
            }
            Message::FileHashReply { name, index, hash } => {
                if let Some(request) = self.differ()?.on_hash_reply(&name, index, hash) {
                    self.stats.blocks_requested += 1;
                    self.send(request)?;
                }
                Ok(())
            }
            Message::FileBlockRequest { name, index } => {
                let reply = self.differ()?.on_block_request(&name, index).await?;
                self.send(reply)
            }
            Message::FileBlockReply { name, index, data } => {
                self.differ()?.on_block_reply(&name, index, data).await?;
                self.stats.blocks_written += 1;
                tracing::debug!(file = %name, index, "wrote block");
                Ok(())
            }
        }
    }

    async fn on_current_time(&mut self, remote_ms: i64) -> Result<()> {
        let local_ms = self.ctx.clock.now_millis();
        check_clock_skew(local_ms, remote_ms, self.ctx.config.max_clock_skew_ms)?;

        if self.state != SessionState::Connected {
            tracing::debug!("repeated clock announcement");
            return Ok(());
        }

        tracing::debug!(skew_ms = local_ms - remote_ms, "clock check passed");
        self.state = SessionState::ClockChecked;
        self.reconcile().await
    }

    async fn reconcile(&mut self) -> Result<()> {
        self.state = SessionState::Reconciling;

        for name in self.ctx.store.collections().await? {
            self.ctx.registry.register(&name);
        }
        for name in self.ctx.registry.names() {
            let result = self.open_collection(&name).await;
            self.absorb(result)?;
        }

        self.state = SessionState::Steady;
        tracing::info!(collections = self.changes.len(), "reconciliation sent, steady");

        let result = self.announce_shared_files().await;
        self.absorb(result)
    }

    /// Subscribe to a collection and send its full lists, once per session.
    async fn open_collection(&mut self, name: &str) -> Result<()> {
        if self.changes.contains_key(name) {
            return Ok(());
        }
        // Subscribe before reading so no change between the two is lost.
        let rx = self.ctx.store.subscribe(name);
        self.changes.insert(name.to_string(), BroadcastStream::new(rx));
        self.send_full_lists(name).await
    }

    async fn send_full_lists(&mut self, name: &str) -> Result<()> {
        let ids = self.ctx.store.tombstones(name).await?;
        let items = self.ctx.store.list(name).await?;
        tracing::debug!(
            collection = name,
            tombstones = ids.len(),
            items = items.len(),
            "announcing collection"
        );

        self.send(Message::DeleteList {
            collection: name.to_string(),
            ids,
        })?;
        self.send(Message::ObjectList {
            collection: name.to_string(),
            items,
        })
    }

    /// Make a peer-announced collection known locally.
    async fn adopt_collection(&mut self, name: &str) -> Result<()> {
        if self.ctx.registry.register(name) {
            self.ctx.store.create_collection(name).await?;
            tracing::info!(collection = name, "learned collection from peer");
        }
        self.open_collection(name).await
    }

    async fn on_delete_list(&mut self, collection: String, ids: Vec<ItemId>) -> Result<()> {
        self.adopt_collection(&collection).await?;
        let removed =
            apply_delete_list(&self.ctx, &collection, &ids, Provenance::Sync(self.id)).await?;

        tracing::debug!(
            collection = %collection,
            listed = ids.len(),
            removed = removed.len(),
            "applied delete list"
        );
        self.stats.tombstones_applied += removed.len();
        Ok(())
    }

    async fn on_object_list(&mut self, collection: String, items: Vec<ItemSummary>) -> Result<()> {
        self.adopt_collection(&collection).await?;

        let local: HashMap<ItemId, ItemSummary> = self
            .ctx
            .store
            .list(&collection)
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let mut requested = 0;
        for remote in items {
            let wanted = local
                .get(&remote.id)
                .map_or(true, |mine| mine.differs_from(&remote));
            if wanted {
                self.send(Message::ObjectRequest {
                    collection: collection.clone(),
                    id: remote.id,
                })?;
                requested += 1;
            }
        }

        tracing::debug!(collection = %collection, requested, "diffed object list");
        self.stats.items_requested += requested;
        Ok(())
    }

    async fn on_object_request(&mut self, collection: String, id: ItemId) -> Result<()> {
        match self.ctx.store.get(&collection, &id).await? {
            Some(item) => self.send(Message::ObjectReply { collection, item }),
            None => {
                tracing::warn!(collection = %collection, %id, "request for unknown item dropped");
                Ok(())
            }
        }
    }

    async fn on_object_reply(&mut self, collection: String, item: Item) -> Result<()> {
        let resolution =
            apply_object_reply(&self.ctx, &collection, &item, Provenance::Sync(self.id)).await?;

        tracing::debug!(
            collection = %collection,
            id = %item.id,
            resolution = resolution.as_str(),
            "resolved inbound item"
        );
        if resolution.accepts_remote() {
            self.stats.items_accepted += 1;
        } else {
            self.stats.items_rejected += 1;
        }
        Ok(())
    }

    async fn forward_change(
        &mut self,
        collection: String,
        event: std::result::Result<ChangeEvent, BroadcastStreamRecvError>,
    ) -> Result<()> {
        let event = match event {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(collection = %collection, missed, "change feed lagged, re-announcing");
                return self.send_full_lists(&collection).await;
            }
        };

        if event.provenance.is_from(self.id) {
            return Ok(());
        }

        match event.kind {
            ChangeKind::Added | ChangeKind::Updated => {
                // Already gone again: the delete event will follow.
                let Some(item) = self.ctx.store.get(&collection, &event.id).await? else {
                    return Ok(());
                };
                self.send(Message::ObjectList {
                    collection,
                    items: vec![item.summary()],
                })?;
            }
            ChangeKind::Deleted => {
                self.send(Message::DeleteList {
                    collection,
                    ids: vec![event.id],
                })?;
            }
        }
        self.stats.deltas_sent += 1;
        Ok(())
    }

    async fn on_collection_added(
        &mut self,
        added: std::result::Result<String, BroadcastStreamRecvError>,
    ) -> Result<()> {
        match added {
            Ok(name) => self.open_collection(&name).await,
            Err(BroadcastStreamRecvError::Lagged(_)) => {
                for name in self.ctx.registry.names() {
                    let result = self.open_collection(&name).await;
                    self.absorb(result)?;
                }
                Ok(())
            }
        }
    }

    async fn announce_shared_files(&mut self) -> Result<()> {
        let Some(differ) = self.blocks.as_ref() else {
            return Ok(());
        };
        let mut names = differ.shared_files().await?;
        names.append(&mut self.deferred_files);

        tracing::debug!(files = names.len(), "announcing shared files");
        for name in names {
            let result = self.announce_file(name).await;
            self.absorb(result)?;
        }
        Ok(())
    }

    async fn announce_file(&mut self, name: String) -> Result<()> {
        if self.state != SessionState::Steady {
            self.deferred_files.push(name);
            return Ok(());
        }
        let info = self.differ()?.announce(&name).await?;
        self.send(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use cloudmesh_core::{ManualClock, Sha1Hash};
    use cloudmesh_store::{MemoryStore, ObjectStoreExt};
    use crate::test_util::eventually;
    use proptest::prelude::*;
    use tokio::task::JoinHandle;
    use tokio_util::codec::{Encoder, Framed};

    const NOW: i64 = 1_700_000_000_000;

    fn context(store: Arc<MemoryStore>, now: i64) -> SyncContext {
        SyncContext::new(store, SyncConfig::default()).with_clock(Arc::new(ManualClock::new(now)))
    }

    fn spawn_pair(
        a: SyncContext,
        b: SyncContext,
    ) -> (
        (SessionHandle, JoinHandle<SessionReport>),
        (SessionHandle, JoinHandle<SessionReport>),
    ) {
        let (io_a, io_b) = tokio::io::duplex(64 * 1024);
        let (session_a, handle_a) = Session::new(a, io_a, Direction::Outbound, "b");
        let (session_b, handle_b) = Session::new(b, io_b, Direction::Inbound, "a");
        (
            (handle_a, tokio::spawn(session_a.run())),
            (handle_b, tokio::spawn(session_b.run())),
        )
    }

    async fn same_contents(a: &MemoryStore, b: &MemoryStore, collection: &str) -> bool {
        a.list(collection).await.unwrap() == b.list(collection).await.unwrap()
            && sorted(a.tombstones(collection).await.unwrap())
                == sorted(b.tombstones(collection).await.unwrap())
    }

    fn sorted(mut ids: Vec<ItemId>) -> Vec<ItemId> {
        ids.sort();
        ids
    }

    /// A raw peer speaking frames directly to a session under test.
    fn raw_peer(ctx: SyncContext) -> (Framed<tokio::io::DuplexStream, FrameCodec>, JoinHandle<SessionReport>) {
        let (io_a, io_b) = tokio::io::duplex(64 * 1024);
        let (session, _handle) = Session::new(ctx, io_a, Direction::Inbound, "raw");
        let task = tokio::spawn(session.run());
        (Framed::new(io_b, FrameCodec::default()), task)
    }

    async fn next_message(peer: &mut Framed<tokio::io::DuplexStream, FrameCodec>) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        Message::decode(frame).unwrap()
    }

    #[test]
    fn test_clock_skew_boundary() {
        assert!(check_clock_skew(1_000_000, 997_000, 3_000).is_ok());
        assert!(check_clock_skew(1_000_000, 1_003_000, 3_000).is_ok());
        assert!(matches!(
            check_clock_skew(1_000_000, 996_999, 3_000),
            Err(SyncError::ClockSkew { skew_ms: 3_001, .. })
        ));
        assert!(check_clock_skew(i64::MIN, i64::MAX, 3_000).is_err());
    }

    #[tokio::test]
    async fn test_sessions_converge_both_ways() {
        let store_a = Arc::new(MemoryStore::new());
        let store_b = Arc::new(MemoryStore::new());

        let only_a = store_a.insert_local("notes", &b"from a"[..], NOW).await.unwrap();
        let only_b = store_b.insert_local("notes", &b"from b"[..], NOW).await.unwrap();
        let shared = Item::new(ItemId::from_bytes([9; 16]), &b"doomed"[..], NOW);
        store_a.put("notes", &shared, Provenance::Local).await.unwrap();
        store_b.remove_local("notes", &[shared.id]).await.unwrap();

        let ((ha, ta), (hb, tb)) = spawn_pair(
            context(store_a.clone(), NOW),
            context(store_b.clone(), NOW),
        );

        eventually(|| {
            let (a, b) = (store_a.clone(), store_b.clone());
            async move { a.list("notes").await.unwrap().len() == 2 && same_contents(&a, &b, "notes").await }
        })
        .await;

        assert!(store_a.get("notes", &only_b.id).await.unwrap().is_some());
        assert!(store_b.get("notes", &only_a.id).await.unwrap().is_some());
        assert!(store_a.is_removed("notes", &shared.id).await.unwrap());

        ha.disconnect().await;
        hb.disconnect().await;
        let report_a = ta.await.unwrap();
        tb.await.unwrap();
        assert_eq!(report_a.stats.tombstones_applied, 1);
    }

    #[tokio::test]
    async fn test_newer_version_wins_on_both_sides() {
        let store_a = Arc::new(MemoryStore::new());
        let store_b = Arc::new(MemoryStore::new());
        let id = ItemId::from_bytes([1; 16]);

        store_a
            .put("c", &Item::new(id, &b"old"[..], NOW - 10), Provenance::Local)
            .await
            .unwrap();
        let newer = Item::new(id, &b"new"[..], NOW);
        store_b.put("c", &newer, Provenance::Local).await.unwrap();

        let ((ha, _), (hb, _)) = spawn_pair(context(store_a.clone(), NOW), context(store_b.clone(), NOW));

        eventually(|| {
            let a = store_a.clone();
            let newer = newer.clone();
            async move { a.get("c", &newer.id).await.unwrap().as_ref() == Some(&newer) }
        })
        .await;
        assert_eq!(store_b.get("c", &id).await.unwrap(), Some(newer));

        ha.disconnect().await;
        hb.disconnect().await;
    }

    #[tokio::test]
    async fn test_clock_skew_aborts_both_sessions() {
        let store_a = Arc::new(MemoryStore::new());
        let store_b = Arc::new(MemoryStore::new());
        store_a.insert_local("c", &b"x"[..], NOW).await.unwrap();

        let ((_, ta), (_, tb)) = spawn_pair(
            context(store_a, NOW),
            context(store_b.clone(), NOW - 3_001),
        );

        let report_a = ta.await.unwrap();
        let report_b = tb.await.unwrap();
        assert!(matches!(
            report_a.end,
            SessionEnd::Error(SyncError::ClockSkew { .. })
        ));
        // B either saw the skew itself or the connection closing.
        assert!(!matches!(report_b.end, SessionEnd::LocalDisconnect));
        assert!(store_b.list("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_steady_deltas_do_not_echo() {
        let store_a = Arc::new(MemoryStore::new());
        let store_b = Arc::new(MemoryStore::new());
        store_a.create_collection("c").await.unwrap();

        let ((ha, ta), (hb, tb)) = spawn_pair(context(store_a.clone(), NOW), context(store_b.clone(), NOW));

        // Wait until B has adopted the collection from A's lists.
        eventually(|| {
            let b = store_b.clone();
            async move { b.collections().await.unwrap() == vec!["c".to_string()] }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = store_a.insert_local("c", &b"late"[..], NOW).await.unwrap().id;
        eventually(|| {
            let b = store_b.clone();
            async move { b.get("c", &id).await.unwrap().is_some() }
        })
        .await;

        store_a.remove_local("c", &[id]).await.unwrap();
        eventually(|| {
            let b = store_b.clone();
            async move { b.is_removed("c", &id).await.unwrap() }
        })
        .await;

        ha.disconnect().await;
        hb.disconnect().await;
        let report_a = ta.await.unwrap();
        let report_b = tb.await.unwrap();
        assert_eq!(report_a.stats.deltas_sent, 2);
        assert_eq!(report_b.stats.deltas_sent, 0);
        assert_eq!(report_b.stats.items_accepted, 1);
    }

    #[tokio::test]
    async fn test_messages_before_clock_check_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("c").await.unwrap();
        let (mut peer, task) = raw_peer(context(store, NOW));

        assert_eq!(next_message(&mut peer).await, Message::CurrentTime { millis: NOW });

        peer.send(Message::ObjectRequest {
            collection: "c".into(),
            id: ItemId::from_bytes([1; 16]),
        })
        .await
        .unwrap();
        peer.send(Message::CurrentTime { millis: NOW }).await.unwrap();

        assert_eq!(
            next_message(&mut peer).await,
            Message::DeleteList {
                collection: "c".into(),
                ids: vec![]
            }
        );
        assert_eq!(
            next_message(&mut peer).await,
            Message::ObjectList {
                collection: "c".into(),
                items: vec![]
            }
        );

        drop(peer);
        let report = task.await.unwrap();
        assert!(matches!(report.end, SessionEnd::RemoteClosed));
        assert_eq!(report.stats.errors_absorbed, 1);
    }

    #[tokio::test]
    async fn test_unknown_token_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let (mut peer, task) = raw_peer(context(store, NOW));
        next_message(&mut peer).await;

        peer.send(Frame {
            token: 0x7f,
            payload: bytes::Bytes::from_static(b"junk"),
        })
        .await
        .unwrap();
        peer.send(Message::CurrentTime { millis: NOW }).await.unwrap();
        peer.send(Message::ObjectRequest {
            collection: "missing".into(),
            id: ItemId::from_bytes([2; 16]),
        })
        .await
        .unwrap();

        drop(peer);
        let report = task.await.unwrap();
        assert!(matches!(report.end, SessionEnd::RemoteClosed));
        assert_eq!(report.stats.errors_absorbed, 1);
    }

    #[tokio::test]
    async fn test_implausible_length_closes_session() {
        use tokio::io::AsyncWriteExt;

        let store = Arc::new(MemoryStore::new());
        let (io_a, mut io_b) = tokio::io::duplex(1024);
        let (session, _handle) = Session::new(context(store, NOW), io_a, Direction::Inbound, "raw");
        let task = tokio::spawn(session.run());

        io_b.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();

        let report = task.await.unwrap();
        assert!(matches!(
            report.end,
            SessionEnd::Error(SyncError::Framing(WireError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_tombstoned_reply_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone(), NOW);
        let id = ItemId::from_bytes([4; 16]);
        store.remove_local("c", &[id]).await.unwrap();

        let item = Item::new(id, &b"zombie"[..], i64::MAX);
        let resolution = apply_object_reply(&ctx, "c", &item, Provenance::Local).await.unwrap();
        assert_eq!(resolution, Resolution::Tombstoned);
        assert!(store.get("c", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shared_files_are_block_synced() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir_a.path().join("blob.bin"), &content).unwrap();

        let config = |dir: &std::path::Path| SyncConfig {
            shared_dir: Some(dir.to_path_buf()),
            ..SyncConfig::default()
        };
        let a = SyncContext::new(Arc::new(MemoryStore::new()), config(dir_a.path()))
            .with_clock(Arc::new(ManualClock::new(NOW)));
        let b = SyncContext::new(Arc::new(MemoryStore::new()), config(dir_b.path()))
            .with_clock(Arc::new(ManualClock::new(NOW)));

        let ((ha, _), (hb, tb)) = spawn_pair(a, b);
        let target = dir_b.path().join("blob.bin");
        eventually(|| {
            let target = target.clone();
            let content = content.clone();
            async move { std::fs::read(&target).map(|d| d == content).unwrap_or(false) }
        })
        .await;

        ha.disconnect().await;
        hb.disconnect().await;
        assert_eq!(tb.await.unwrap().stats.blocks_written, 3);
    }

    #[tokio::test]
    async fn test_differing_shared_files_converge() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("f.bin"), vec![0xaa; 9000]).unwrap();
        std::fs::write(dir_b.path().join("f.bin"), vec![0xbb; 9000]).unwrap();

        let config = |dir: &std::path::Path| SyncConfig {
            shared_dir: Some(dir.to_path_buf()),
            ..SyncConfig::default()
        };
        let a = SyncContext::new(Arc::new(MemoryStore::new()), config(dir_a.path()))
            .with_clock(Arc::new(ManualClock::new(NOW)));
        let b = SyncContext::new(Arc::new(MemoryStore::new()), config(dir_b.path()))
            .with_clock(Arc::new(ManualClock::new(NOW)));

        let ((ha, ta), (hb, tb)) = spawn_pair(a, b);
        let (path_a, path_b) = (dir_a.path().join("f.bin"), dir_b.path().join("f.bin"));
        eventually(|| {
            let (path_a, path_b) = (path_a.clone(), path_b.clone());
            async move {
                match (std::fs::read(&path_a), std::fs::read(&path_b)) {
                    (Ok(x), Ok(y)) => x == y,
                    _ => false,
                }
            }
        })
        .await;

        ha.disconnect().await;
        hb.disconnect().await;
        let written = ta.await.unwrap().stats.blocks_written + tb.await.unwrap().stats.blocks_written;
        assert_eq!(written, 3);

        let expected = if Sha1Hash::hash(&[0xaa; 9000]) > Sha1Hash::hash(&[0xbb; 9000]) {
            0xaa
        } else {
            0xbb
        };
        assert_eq!(std::fs::read(&path_a).unwrap(), vec![expected; 9000]);
    }

    #[tokio::test]
    async fn test_lagged_change_feed_resends_full_lists() {
        let store = Arc::new(MemoryStore::with_channel_capacity(1));
        store.create_collection("c").await.unwrap();
        let (mut peer, task) = raw_peer(context(store.clone(), NOW));

        peer.send(Message::CurrentTime { millis: NOW }).await.unwrap();
        assert!(matches!(next_message(&mut peer).await, Message::CurrentTime { .. }));
        assert!(matches!(next_message(&mut peer).await, Message::DeleteList { .. }));
        assert!(matches!(next_message(&mut peer).await, Message::ObjectList { .. }));

        // No await yields between these writes, so the session's
        // subscription overflows before it reads a single event.
        for n in 0..3u8 {
            store.insert_local("c", vec![n], NOW).await.unwrap();
        }
        let gone = ItemId::from_bytes([8; 16]);
        store.remove_local("c", &[gone]).await.unwrap();

        let Message::DeleteList { collection, ids } = next_message(&mut peer).await else {
            panic!("expected a full DeleteList");
        };
        assert_eq!(collection, "c");
        assert_eq!(ids, vec![gone]);
        let Message::ObjectList { collection, items } = next_message(&mut peer).await else {
            panic!("expected a full ObjectList");
        };
        assert_eq!(collection, "c");
        assert_eq!(items.len(), 3);

        drop(peer);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_reach_session_in_pieces() {
        use tokio::io::AsyncWriteExt;

        let store = Arc::new(MemoryStore::new());
        store.create_collection("c").await.unwrap();
        let (io_a, io_b) = tokio::io::duplex(64 * 1024);
        let (session, handle) = Session::new(context(store.clone(), NOW), io_a, Direction::Inbound, "raw");
        let task = tokio::spawn(session.run());

        let (read_b, mut write_b) = tokio::io::split(io_b);
        let mut reader = FramedRead::new(read_b, FrameCodec::default());

        let mut wire = BytesMut::new();
        let mut codec = FrameCodec::default();
        codec.encode(Message::CurrentTime { millis: NOW }, &mut wire).unwrap();
        codec
            .encode(
                Message::DeleteList {
                    collection: "c".into(),
                    ids: vec![ItemId::from_bytes([5; 16])],
                },
                &mut wire,
            )
            .unwrap();
        for byte in wire.iter() {
            write_b.write_all(&[*byte]).await.unwrap();
        }

        eventually(|| {
            let s = store.clone();
            async move { s.is_removed("c", &ItemId::from_bytes([5; 16])).await.unwrap() }
        })
        .await;

        // Drain what the session sent so its writer is never blocked.
        let _ = reader.next().await;
        handle.disconnect().await;
        assert!(matches!(task.await.unwrap().end, SessionEnd::LocalDisconnect));
    }

    proptest! {
        #[test]
        fn prop_delete_list_replay_is_idempotent(
            live in proptest::collection::vec(any::<[u8; 16]>(), 0..10),
            deleted in proptest::collection::vec(any::<[u8; 16]>(), 0..10),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = Arc::new(MemoryStore::new());
                let ctx = context(store.clone(), NOW);
                for bytes in &live {
                    let item = Item::new(ItemId::from_bytes(*bytes), bytes.to_vec(), NOW);
                    store.put("c", &item, Provenance::Local).await.unwrap();
                }
                let ids: Vec<ItemId> = deleted.iter().copied().map(ItemId::from_bytes).collect();

                apply_delete_list(&ctx, "c", &ids, Provenance::Local).await.unwrap();
                let once = (store.list("c").await.unwrap(), store.tombstones("c").await.unwrap());

                let again = apply_delete_list(&ctx, "c", &ids, Provenance::Local).await.unwrap();
                let twice = (store.list("c").await.unwrap(), store.tombstones("c").await.unwrap());

                assert!(again.is_empty());
                assert_eq!(once, twice);
            });
        }

        #[test]
        fn prop_tombstoned_id_ignores_any_reply(
            timestamp in any::<i64>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = Arc::new(MemoryStore::new());
                let ctx = context(store.clone(), NOW);
                let id = ItemId::from_bytes([7; 16]);
                store.remove_local("c", &[id]).await.unwrap();

                let item = Item::new(id, payload, timestamp);
                let resolution = apply_object_reply(&ctx, "c", &item, Provenance::Local).await.unwrap();
                assert_eq!(resolution, Resolution::Tombstoned);
                assert!(store.list("c").await.unwrap().is_empty());
            });
        }
    }
}
