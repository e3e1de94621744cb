//! Two nodes syncing over loopback TCP.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use cloudmesh::store::{ObjectStore, ObjectStoreExt};
use cloudmesh::sync::{MemoryDiscoveryNetwork, PeerRecord, StaticDiscovery};
use cloudmesh::{Node, NodeConfig};
use cloudmesh_testkit::eventually;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn config(name: &str) -> NodeConfig {
    NodeConfig {
        node_name: name.to_string(),
        listen_addr: LOCALHOST,
        collections: vec!["notes".to_string()],
        ..NodeConfig::default()
    }
}

struct Running {
    store: Arc<dyn ObjectStore>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<cloudmesh::Result<()>>,
}

impl Running {
    fn spawn(node: Node) -> Self {
        let store = node.store();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(node.run(async move {
            let _ = stopped.await;
        }));
        Self { store, stop, task }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_nodes_found_by_discovery_converge() {
    let network = MemoryDiscoveryNetwork::new();

    let a = Node::start(config("a"), Arc::new(network.create(LOCALHOST)))
        .await
        .unwrap();
    let b = Node::start(config("b"), Arc::new(network.create(LOCALHOST)))
        .await
        .unwrap();

    let store_a = a.store();
    let store_b = b.store();
    let note = store_a
        .insert_local("notes", &b"from a"[..], now())
        .await
        .unwrap()
        .id;
    let other = store_b
        .insert_local("notes", &b"from b"[..], now())
        .await
        .unwrap()
        .id;

    let a = Running::spawn(a);
    let b = Running::spawn(b);

    eventually(|| {
        let (sa, sb) = (store_a.clone(), store_b.clone());
        async move {
            sa.get("notes", &other).await.unwrap().is_some()
                && sb.get("notes", &note).await.unwrap().is_some()
        }
    })
    .await;

    // A steady-state delete travels too.
    store_a.remove_local("notes", &[note]).await.unwrap();
    eventually(|| {
        let sb = store_b.clone();
        async move { sb.is_removed("notes", &note).await.unwrap() }
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_static_peer_with_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();

    let server = Node::start(config("server"), Arc::new(StaticDiscovery::default()))
        .await
        .unwrap();
    let server_addr = server.local_addr();
    let item = server
        .store()
        .insert_local("notes", &b"persist me"[..], now())
        .await
        .unwrap();
    let server = Running::spawn(server);

    let client_config = NodeConfig {
        database: Some(dir.path().join("client.db")),
        peers: vec![PeerRecord::new("server", vec![LOCALHOST], server_addr.port())],
        ..config("client")
    };
    let discovery = Arc::new(StaticDiscovery::new(client_config.peers.clone()));
    let client = Running::spawn(Node::start(client_config.clone(), discovery).await.unwrap());

    let id = item.id;
    eventually(|| {
        let store = client.store.clone();
        async move { store.get("notes", &id).await.unwrap().is_some() }
    })
    .await;
    client.shutdown().await;
    server.shutdown().await;

    // The synced item survives a restart.
    let reopened = Node::start(client_config, Arc::new(StaticDiscovery::default()))
        .await
        .unwrap();
    let stored = reopened.store().get("notes", &item.id).await.unwrap();
    assert_eq!(stored.map(|i| i.payload), Some(item.payload));
}

fn now() -> i64 {
    use cloudmesh::core::{Clock, SystemClock};
    SystemClock.now_millis()
}
