//! Peer discovery abstraction.
//!
//! Discovery only produces peer records; it never opens connections. A
//! browse stream yields the full set of currently visible peers each time it
//! changes, and the node re-dials from every snapshot.

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// A peer as advertised on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Advertised service name.
    pub name: String,
    /// Candidate addresses, in advertised order.
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

impl PeerRecord {
    pub fn new(name: impl Into<String>, addresses: Vec<IpAddr>, port: u16) -> Self {
        Self {
            name: name.into(),
            addresses,
            port,
        }
    }
}

/// Source of peer records.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Publish this node under `service_type`.
    async fn advertise(&self, name: &str, service_type: &str, port: u16) -> Result<()>;

    /// Watch the peers advertising `service_type`.
    ///
    /// Each received value is the complete current peer set.
    async fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<Vec<PeerRecord>>>;

    /// Resolve a record to its host addresses and port.
    async fn resolve(&self, record: &PeerRecord) -> Result<(Vec<IpAddr>, u16)>;
}

/// A fixed peer list, delivered as a single snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<PeerRecord>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<PeerRecord>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn advertise(&self, name: &str, service_type: &str, port: u16) -> Result<()> {
        tracing::debug!(name, service_type, port, "static discovery does not advertise");
        Ok(())
    }

    async fn browse(&self, _service_type: &str) -> Result<mpsc::Receiver<Vec<PeerRecord>>> {
        // Keep the sender alive so the stream stays open.
        let (tx, rx) = mpsc::channel(1);
        let peers = self.peers.clone();
        tokio::spawn(async move {
            if tx.send(peers).await.is_ok() {
                tx.closed().await;
            }
        });
        Ok(rx)
    }

    async fn resolve(&self, record: &PeerRecord) -> Result<(Vec<IpAddr>, u16)> {
        Ok((record.addresses.clone(), record.port))
    }
}

/// In-process discovery for tests.
pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Default)]
    struct State {
        /// Advertised services by (service type, name).
        services: BTreeMap<(String, String), PeerRecord>,
        browsers: Vec<(String, mpsc::Sender<Vec<PeerRecord>>)>,
    }

    impl State {
        fn snapshot(&self, service_type: &str) -> Vec<PeerRecord> {
            self.services
                .iter()
                .filter(|((ty, _), _)| ty == service_type)
                .map(|(_, record)| record.clone())
                .collect()
        }

        fn notify(&mut self, service_type: &str) {
            let snapshot = self.snapshot(service_type);
            self.browsers.retain(|(ty, tx)| {
                if ty != service_type {
                    return !tx.is_closed();
                }
                // A full queue just means the browser has not caught up.
                !matches!(
                    tx.try_send(snapshot.clone()),
                    Err(mpsc::error::TrySendError::Closed(_))
                )
            });
        }
    }

    /// A shared advertisement space.
    #[derive(Default)]
    pub struct MemoryDiscoveryNetwork {
        state: Mutex<State>,
    }

    impl MemoryDiscoveryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// A discovery handle for a host reachable at `host`.
        pub fn create(self: &Arc<Self>, host: IpAddr) -> MemoryDiscovery {
            MemoryDiscovery {
                host,
                network: Arc::clone(self),
            }
        }

        /// Remove an advertisement, as if the host went away.
        pub fn withdraw(&self, service_type: &str, name: &str) {
            let mut state = self.state.lock();
            if state
                .services
                .remove(&(service_type.to_string(), name.to_string()))
                .is_some()
            {
                state.notify(service_type);
            }
        }
    }

    /// One host's view of a [`MemoryDiscoveryNetwork`].
    pub struct MemoryDiscovery {
        host: IpAddr,
        network: Arc<MemoryDiscoveryNetwork>,
    }

    #[async_trait]
    impl Discovery for MemoryDiscovery {
        async fn advertise(&self, name: &str, service_type: &str, port: u16) -> Result<()> {
            let record = PeerRecord::new(name, vec![self.host], port);
            let mut state = self.network.state.lock();
            state
                .services
                .insert((service_type.to_string(), name.to_string()), record);
            state.notify(service_type);
            Ok(())
        }

        async fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<Vec<PeerRecord>>> {
            let (tx, rx) = mpsc::channel(16);
            let mut state = self.network.state.lock();
            let snapshot = state.snapshot(service_type);
            if !snapshot.is_empty() {
                let _ = tx.try_send(snapshot);
            }
            state.browsers.push((service_type.to_string(), tx));
            Ok(rx)
        }

        async fn resolve(&self, record: &PeerRecord) -> Result<(Vec<IpAddr>, u16)> {
            Ok((record.addresses.clone(), record.port))
        }
    }
}
