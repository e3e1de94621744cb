//! Node configuration and listener setup.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use cloudmesh_sync::{PeerRecord, SyncConfig};

use crate::error::{NodeError, Result};

/// Service type nodes advertise and browse for.
pub const SERVICE_TYPE: &str = "_cloudmesh._tcp";

/// Ports tried when none is configured.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// How many random ports to try before giving up.
const BIND_ATTEMPTS: usize = 32;

/// Configuration for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name advertised to peers. Must be unique on the network.
    pub node_name: String,
    pub service_type: String,
    pub listen_addr: IpAddr,
    /// Listening port; 0 picks a random free port in [`EPHEMERAL_PORTS`].
    pub port: u16,
    /// SQLite database path. Items live in memory when unset.
    pub database: Option<PathBuf>,
    /// Collections created at startup.
    pub collections: Vec<String>,
    /// Peers handed to static discovery.
    pub peers: Vec<PeerRecord>,
    pub sync: SyncConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let suffix: u32 = rand::thread_rng().gen();
        Self {
            node_name: format!("cloudmesh-{suffix:08x}"),
            service_type: SERVICE_TYPE.to_string(),
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            database: None,
            collections: Vec::new(),
            peers: Vec::new(),
            sync: SyncConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Bind the node's listener.
///
/// A non-zero `port` is bound as is. Port 0 tries random ports from
/// [`EPHEMERAL_PORTS`], moving on while they are in use.
pub async fn bind_listener(addr: IpAddr, port: u16) -> Result<TcpListener> {
    if port != 0 {
        return Ok(TcpListener::bind(SocketAddr::new(addr, port)).await?);
    }

    for _ in 0..BIND_ATTEMPTS {
        let candidate = rand::thread_rng().gen_range(EPHEMERAL_PORTS);
        match TcpListener::bind(SocketAddr::new(addr, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(port = candidate, "port in use, trying another");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(NodeError::NoFreePort {
        attempts: BIND_ATTEMPTS,
    })
}
