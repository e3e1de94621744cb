//! # Cloudmesh
//!
//! A peer-to-peer sync daemon. Each node hosts named collections of items,
//! finds peers through a [`Discovery`] source and keeps every collection
//! (and optionally a shared directory of files) converged with each peer.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cloudmesh::{Node, NodeConfig};
//! use cloudmesh::sync::StaticDiscovery;
//!
//! async fn example() {
//!     let config = NodeConfig {
//!         collections: vec!["notes".into()],
//!         ..NodeConfig::default()
//!     };
//!     let discovery = Arc::new(StaticDiscovery::new(config.peers.clone()));
//!     let node = Node::start(config, discovery).await.unwrap();
//!     node.run(async { let _ = tokio::signal::ctrl_c().await; }).await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `cloudmesh::core` - ids, digests, items and the resolver
//! - `cloudmesh::store` - the object store trait and its implementations
//! - `cloudmesh::sync` - sessions, wire codec, connection manager, discovery
//!
//! [`Discovery`]: cloudmesh_sync::Discovery

pub mod config;
pub mod error;
pub mod node;

pub use config::{bind_listener, NodeConfig, EPHEMERAL_PORTS, SERVICE_TYPE};
pub use error::{NodeError, Result};
pub use node::{preferred_address, Node};

pub use cloudmesh_core as core;
pub use cloudmesh_store as store;
pub use cloudmesh_sync as sync;
