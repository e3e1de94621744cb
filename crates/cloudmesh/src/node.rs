//! A running node: store, listener, discovery and connection manager.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;

use cloudmesh_store::{MemoryStore, ObjectStore, SqliteStore};
use cloudmesh_sync::{ConnectionManager, Discovery, PeerRecord, SyncContext};

use crate::config::{bind_listener, NodeConfig};
use crate::error::Result;

/// A cloudmesh node.
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn ObjectStore>,
    discovery: Arc<dyn Discovery>,
    manager: ConnectionManager,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Node {
    /// Open the store, bind the listener and advertise the node.
    pub async fn start(config: NodeConfig, discovery: Arc<dyn Discovery>) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match &config.database {
            Some(path) => {
                tracing::info!(path = %path.display(), "opening database");
                Arc::new(SqliteStore::open(path)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, store, discovery).await
    }

    /// Like [`Node::start`], with a store supplied by the caller.
    pub async fn with_store(
        config: NodeConfig,
        store: Arc<dyn ObjectStore>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self> {
        for name in &config.collections {
            store.create_collection(name).await?;
        }

        let ctx = SyncContext::new(store.clone(), config.sync.clone());
        for name in store.collections().await? {
            ctx.registry.register(&name);
        }

        let listener = bind_listener(config.listen_addr, config.port).await?;
        let local_addr = listener.local_addr()?;
        discovery
            .advertise(&config.node_name, &config.service_type, local_addr.port())
            .await?;
        tracing::info!(
            name = %config.node_name,
            addr = %local_addr,
            collections = ctx.registry.names().len(),
            "node started"
        );

        Ok(Self {
            config,
            store,
            discovery,
            manager: ConnectionManager::new(ctx),
            listener,
            local_addr,
        })
    }

    /// The node's object store.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Serve connections and follow discovery until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            config,
            discovery,
            manager,
            listener,
            local_addr,
            ..
        } = self;

        let mut peers = discovery.browse(&config.service_type).await?;
        let mut browsing = true;
        let serve = manager.serve(listener);
        tokio::pin!(serve);
        tokio::pin!(shutdown);

        let result: Result<()> = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                served = &mut serve => break served.map_err(Into::into),
                snapshot = peers.recv(), if browsing => match snapshot {
                    Some(records) => {
                        follow_peers(&config, &*discovery, &manager, local_addr, records).await;
                    }
                    None => {
                        tracing::debug!("discovery stream ended");
                        browsing = false;
                    }
                },
            }
        };

        tracing::info!("shutting down");
        manager.shutdown().await;
        result
    }
}

/// Replace the live sessions with fresh dials to `records`.
async fn follow_peers(
    config: &NodeConfig,
    discovery: &dyn Discovery,
    manager: &ConnectionManager,
    local_addr: SocketAddr,
    records: Vec<PeerRecord>,
) {
    tracing::info!(peers = records.len(), "peer set changed");
    manager.broadcast_disconnect_all().await;

    for record in records {
        if record.name == config.node_name {
            continue;
        }
        let (addresses, port) = match discovery.resolve(&record).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(peer = %record.name, error = %e, "could not resolve peer");
                continue;
            }
        };
        let Some(ip) = preferred_address(&addresses) else {
            tracing::warn!(peer = %record.name, "peer has no addresses");
            continue;
        };
        let addr = SocketAddr::new(ip, port);
        if is_self(addr, local_addr) {
            continue;
        }

        let manager = manager.clone();
        let name = record.name;
        tokio::spawn(async move {
            if let Err(e) = manager.dial(addr).await {
                tracing::warn!(peer = %name, %addr, error = %e, "dial failed");
            }
        });
    }
}

/// The first IPv4 address, or the first address of any family.
pub fn preferred_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
}

fn is_self(addr: SocketAddr, local: SocketAddr) -> bool {
    if addr.port() != local.port() {
        return false;
    }
    addr.ip() == local.ip() || (local.ip().is_unspecified() && addr.ip().is_loopback())
}
