//! Network module
//!
//! This module provides the transport contract the router sends through,
//! the per-node connection pool, and an in-memory transport for linking
//! nodes inside one process. Sockets, TLS and HTTP upgrades live outside
//! the crate behind [`Transport`].

mod connection;
mod handle;
mod memory;
mod transport;

pub use connection::{Connection, ConnectionPool, ConnectionState};
pub use handle::ConnectionHandle;
pub(crate) use handle::Inbound;
pub use memory::{MemoryLink, MemoryTransport};
pub use transport::{ChannelId, Transport};
