//! High-level API for chargemesh
//!
//! This module provides the public-facing API applications use to run a
//! node: configuration, the builder, the node itself, lifecycle observers and
//! the capability traits collaborators depend on.

pub mod capabilities;
pub mod config;
pub mod node;
pub mod observers;

// Re-export main types for convenience
pub use capabilities::{Forwards, Receives, Routes, Sends, Signs};
pub use config::{load_config, save_config, NodeConfig, NodeRole};
pub use node::{Node, NodeBuilder, NodeState, NotificationHandler, RequestHandler};
pub use observers::{ObserverCallback, ObserverHandle, ObserverStage, Observers};
