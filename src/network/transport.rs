//! Transport contract
//!
//! The router never touches sockets. A [`Transport`] is one established,
//! message-oriented channel to a direct neighbour that can take an encoded
//! [`Frame`]; inbound frames are pushed into the node through the
//! `ConnectionHandle` returned by `Node::attach`.

use crate::error::NetworkError;
use crate::protocol::{Frame, WireFormat};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of one attached channel, unique within a node
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
    /// Wrap a channel name
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    /// A random id with the given prefix, e.g. `ws-3fa9c2d1`
    pub fn generate(prefix: &str) -> Self {
        let suffix: u32 = rand::thread_rng().gen();
        Self::new(format!("{}-{:08x}", prefix, suffix))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

/// One established channel to a direct neighbour
///
/// Implementations must be cheap to call from any task; `send` must not
/// block on network I/O.
pub trait Transport: Send + Sync {
    /// Channel identifier
    fn id(&self) -> &ChannelId;

    /// Wire variant spoken on this channel
    fn wire_format(&self) -> WireFormat;

    /// Hand one frame to the channel
    fn send(&self, frame: Frame) -> Result<(), NetworkError>;

    /// Close the channel
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_carry_prefix() {
        let a = ChannelId::generate("ws");
        let b = ChannelId::generate("ws");

        assert!(a.as_str().starts_with("ws-"));
        assert_eq!(a.as_str().len(), "ws-".len() + 8);
        assert_ne!(a, b);
    }
}
