//! # Cloudmesh Testkit
//!
//! Testing utilities for cloudmesh.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: exact wire encodings of representative frames
//! - **Generators**: proptest strategies for ids, items and messages
//! - **Fixtures**: paired sessions over an in-memory pipe, fixed clocks
//!
//! ## Golden Vectors
//!
//! ```rust
//! use cloudmesh_testkit::vectors::{all_vectors, encode_hex};
//!
//! for vector in all_vectors() {
//!     assert_eq!(encode_hex(&vector.message), vector.frame_hex);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use cloudmesh_testkit::generators::message;
//!
//! proptest! {
//!     #[test]
//!     fn frames_decode(msg in message()) {
//!         let decoded = cloudmesh_sync::Message::decode(msg.to_frame()).unwrap();
//!         prop_assert_eq!(decoded, msg);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use cloudmesh_testkit::fixtures::SyncPair;
//!
//! async fn example() {
//!     let pair = SyncPair::start();
//!     pair.wait_converged(&["notes"]).await;
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{eventually, SyncPair, TestNode, FIXED_NOW};
pub use vectors::{all_vectors, encode_hex, verify_all_vectors, WireVector};
