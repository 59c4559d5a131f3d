//! Common test helpers and utilities
//!
//! This module provides shared fixtures for the integration tests: node
//! construction, in-memory links and a way to let connection tasks drain.

#![allow(dead_code)]

use chargemesh::crypto::Identity;
use chargemesh::network::{MemoryLink, MemoryTransport};
use chargemesh::protocol::WireFormat;
use chargemesh::{Node, NodeBuilder, NodeConfig, NodeId, NodeRole};
use std::time::Duration;
use tempfile::TempDir;

/// Parse a node id, panicking on invalid input
pub fn id(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

/// Build a node with the given role preset
pub fn node(name: &str, role: NodeRole) -> Node {
    NodeBuilder::new()
        .with_node_id(id(name))
        .with_role(role)
        .build()
        .unwrap()
}

/// Build a node from an explicit configuration
pub fn node_with_config(name: &str, config: NodeConfig) -> Node {
    NodeBuilder::new()
        .with_config(config)
        .with_node_id(id(name))
        .build()
        .unwrap()
}

/// Link two nodes with the text wire format
pub fn link(a: &Node, b: &Node) -> MemoryLink {
    MemoryTransport::connect(a, b, WireFormat::Text).unwrap()
}

/// Link two nodes with the binary wire format
pub fn link_binary(a: &Node, b: &Node) -> MemoryLink {
    MemoryTransport::connect(a, b, WireFormat::Binary).unwrap()
}

/// Give connection tasks time to process queued frames
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Announce from each node in turn, letting every hop learn before the next
pub async fn announce_chain(nodes: &[&Node]) {
    for node in nodes {
        node.announce_now().unwrap();
        settle().await;
    }
}

/// Create a test identity from a specific seed value
///
/// # Arguments
///
/// * `seed` - A single byte that will be repeated to form the 32-byte seed
pub fn create_test_identity_from_seed(seed: u8) -> Identity {
    Identity::from_seed(&[seed; 32])
}

/// Create a temporary directory for config files
///
/// The directory will be automatically cleaned up when the returned `TempDir` is dropped.
pub fn create_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}
