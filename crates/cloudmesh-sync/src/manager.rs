//! Connection management.
//!
//! The manager accepts inbound TCP connections, dials peers, starts one
//! [`Session`] per connection and tracks the live set. Both sides of a pair
//! typically dial each other; the inbound connection from the
//! lexicographically lower address is dropped before any protocol runs so a
//! single session pair survives.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use cloudmesh_core::SessionId;

use crate::error::Result;
use crate::session::{Direction, Session, SessionEnd, SessionHandle, SessionReport, SyncContext};

/// How long [`ConnectionManager::shutdown`] waits for each session task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of a connection in the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub addr: SocketAddr,
    pub direction: Direction,
}

/// Whether an inbound connection should be closed unprotocolled.
///
/// Compares the textual forms of the addresses, so `"10.0.0.10"` sorts
/// before `"10.0.0.2"`.
pub fn should_drop_inbound(remote: IpAddr, local: IpAddr) -> bool {
    remote.to_string() < local.to_string()
}

struct Entry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

struct Inner {
    ctx: SyncContext,
    sessions: Mutex<HashMap<PeerKey, Entry>>,
    closing: AtomicBool,
}

/// Owner of every live session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager whose sessions share `ctx`.
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                sessions: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// The context handed to new sessions.
    pub fn context(&self) -> &SyncContext {
        &self.inner.ctx
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Keys of the live sessions.
    pub fn peers(&self) -> Vec<PeerKey> {
        self.inner.sessions.lock().keys().copied().collect()
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote) = listener.accept().await?;
            if let Err(e) = self.accept(stream) {
                tracing::warn!(%remote, error = %e, "failed to accept connection");
            }
        }
    }

    /// Start an inbound session, unless dedup drops the connection.
    ///
    /// Returns `None` when the connection was closed without a session.
    pub fn accept(&self, stream: TcpStream) -> Result<Option<SessionId>> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;

        if should_drop_inbound(remote.ip(), local.ip()) {
            tracing::info!(%remote, %local, "dropping duplicate inbound connection");
            return Ok(None);
        }
        Ok(Some(self.start(stream, remote, Direction::Inbound, false)))
    }

    /// Dial a peer and start an outbound session.
    pub async fn dial(&self, addr: SocketAddr) -> Result<SessionId> {
        let reconnect = self.inner.ctx.config.reconnect_on_remote_close;
        self.connect(addr, reconnect).await
    }

    async fn connect(&self, addr: SocketAddr, reconnect: bool) -> Result<SessionId> {
        tracing::debug!(%addr, "dialing");
        let stream = TcpStream::connect(addr).await?;
        Ok(self.start(stream, addr, Direction::Outbound, reconnect))
    }

    fn start(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        direction: Direction,
        reconnect: bool,
    ) -> SessionId {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%remote, error = %e, "could not set TCP_NODELAY");
        }

        let key = PeerKey {
            addr: remote,
            direction,
        };
        let (session, handle) =
            Session::new(self.inner.ctx.clone(), stream, direction, remote.to_string());
        let id = handle.id();

        // Hold the table lock across spawn so the task cannot finish and
        // try to remove itself before it is inserted.
        let mut sessions = self.inner.sessions.lock();
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let report = session.run().await;
            manager.finish(key, report, reconnect).await;
        });
        if let Some(old) = sessions.insert(key, Entry { handle, task }) {
            tracing::debug!(%remote, %direction, old = %old.handle.id(), "replacing session");
            tokio::spawn(async move {
                old.handle.disconnect().await;
            });
        }
        drop(sessions);

        tracing::info!(%remote, %direction, session = %id, "session registered");
        id
    }

    async fn finish(&self, key: PeerKey, report: SessionReport, reconnect: bool) {
        {
            let mut sessions = self.inner.sessions.lock();
            if sessions.get(&key).map(|e| e.handle.id()) == Some(report.id) {
                sessions.remove(&key);
            }
        }

        let remote_closed = matches!(report.end, SessionEnd::RemoteClosed);
        if key.direction != Direction::Outbound
            || !remote_closed
            || !reconnect
            || self.inner.closing.load(Ordering::Acquire)
        {
            return;
        }

        tracing::info!(addr = %key.addr, "peer closed connection, reconnecting once");
        if let Err(e) = self.connect(key.addr, false).await {
            tracing::warn!(addr = %key.addr, error = %e, "reconnect failed");
        }
    }

    fn handles(&self) -> Vec<SessionHandle> {
        self.inner
            .sessions
            .lock()
            .values()
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Tell every live session to disconnect. Disconnected sessions are not
    /// reconnected.
    pub async fn broadcast_disconnect_all(&self) {
        let handles = self.handles();
        tracing::info!(sessions = handles.len(), "disconnecting all sessions");
        for handle in handles {
            handle.disconnect().await;
        }
    }

    /// Offer a shared file to every live session's peer.
    pub async fn announce_file(&self, name: &str) {
        for handle in self.handles() {
            handle.announce_file(name).await;
        }
    }

    /// Disconnect everything and wait for the session tasks to end.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::Release);
        let entries: Vec<Entry> = self
            .inner
            .sessions
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in &entries {
            entry.handle.disconnect().await;
        }
        for entry in entries {
            let mut task = entry.task;
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                tracing::warn!(session = %entry.handle.id(), "session did not stop, aborting");
                task.abort();
            }
        }
    }
}
