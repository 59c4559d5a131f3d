//! Attached connections and the connection pool

use crate::addressing::NodeId;
use crate::error::NetworkError;
use crate::network::{ChannelId, Transport};
use crate::protocol::{Frame, WireFormat};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is active and can send/receive
    Connected,
    /// Connection is closed
    Closed,
}

/// A transport attached to a node, plus the neighbour it leads to
pub struct Connection {
    /// Neighbour on the other end
    peer_id: NodeId,
    /// Underlying channel
    transport: Arc<dyn Transport>,
    /// Current connection state
    state: Mutex<ConnectionState>,
    /// When this connection was attached
    created_at: Instant,
    /// Total bytes sent over this connection
    bytes_sent: AtomicU64,
    /// Total bytes received over this connection
    bytes_received: AtomicU64,
    /// Malformed frames received since the last good one
    decode_errors: AtomicU32,
}

impl Connection {
    /// Wrap an established transport
    pub fn new(transport: Arc<dyn Transport>, peer_id: NodeId) -> Self {
        Self {
            peer_id,
            transport,
            state: Mutex::new(ConnectionState::Connected),
            created_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU32::new(0),
        }
    }

    /// Send a frame to the neighbour
    pub fn send_frame(&self, frame: Frame) -> Result<(), NetworkError> {
        if *self.state.lock() != ConnectionState::Connected {
            return Err(NetworkError::ChannelClosed {
                channel: self.id().to_string(),
            });
        }

        let size = frame.len() as u64;
        self.transport.send(frame)?;
        self.bytes_sent.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Account for an inbound frame
    pub fn record_received(&self, frame: &Frame) {
        self.bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
    }

    /// Count a malformed frame, returning the consecutive total
    pub fn record_decode_error(&self) -> u32 {
        self.decode_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reset the malformed-frame counter after a good frame
    pub fn reset_decode_errors(&self) {
        self.decode_errors.store(0, Ordering::Relaxed);
    }

    /// Close the connection; idempotent
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        drop(state);

        self.transport.close();
        true
    }

    /// Channel identifier
    pub fn id(&self) -> &ChannelId {
        self.transport.id()
    }

    /// Wire variant spoken on this channel
    pub fn wire_format(&self) -> WireFormat {
        self.transport.wire_format()
    }

    /// Get the peer's node ID
    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    /// Get the connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Get total bytes sent
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Get total bytes received
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Get connection age
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel", self.id())
            .field("peer", &self.peer_id)
            .field("format", &self.wire_format())
            .field("state", &self.state())
            .finish()
    }
}

/// All connections attached to one node
pub struct ConnectionPool {
    /// Active connections indexed by channel
    connections: DashMap<ChannelId, Arc<Connection>>,
    /// Most recently attached channel per neighbour
    peers: DashMap<NodeId, ChannelId>,
    /// Maximum number of concurrent connections
    max_connections: usize,
}

impl ConnectionPool {
    /// Create a new connection pool
    ///
    /// # Example
    ///
    /// ```
    /// use chargemesh::network::ConnectionPool;
    ///
    /// let pool = ConnectionPool::new(100);
    /// assert!(pool.is_empty());
    /// ```
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            peers: DashMap::new(),
            max_connections,
        }
    }

    /// Add an attached connection to the pool
    pub fn add_connection(&self, connection: Arc<Connection>) -> Result<(), NetworkError> {
        if self.connections.len() >= self.max_connections {
            return Err(NetworkError::PoolFull {
                max: self.max_connections,
            });
        }

        let channel = connection.id().clone();
        self.peers
            .insert(connection.peer_id().clone(), channel.clone());
        self.connections.insert(channel, connection);
        Ok(())
    }

    /// Get a connection by channel
    pub fn get(&self, channel: &ChannelId) -> Option<Arc<Connection>> {
        self.connections.get(channel).map(|c| Arc::clone(c.value()))
    }

    /// Get the connection leading directly to a neighbour
    pub fn get_by_peer(&self, peer: &NodeId) -> Option<Arc<Connection>> {
        let channel = self.peers.get(peer).map(|c| c.value().clone())?;
        self.get(&channel)
    }

    /// Whether the node is a direct neighbour
    pub fn is_direct_peer(&self, peer: &NodeId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Remove a connection
    pub fn remove(&self, channel: &ChannelId) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(channel)?;
        self.peers
            .remove_if(connection.peer_id(), |_, current| current == channel);
        Some(connection)
    }

    /// Get the number of connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close all connections
    pub fn close_all(&self) {
        for connection in self.connections() {
            connection.close();
        }
        self.connections.clear();
        self.peers.clear();
    }

    /// Snapshot of all connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Get list of connected neighbours
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(1024)
    }
}
