//! Node identifiers

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const BROADCAST: &str = "*";
const CONTROLLER: &str = "$controller";

/// Opaque, case-sensitive identifier of a node in the overlay
///
/// Two values are reserved: [`NodeId::broadcast`] addresses every node one
/// hop away, [`NodeId::controller`] addresses whichever node plays the
/// central-controller role.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Create a node id, rejecting empty strings
    pub fn new(id: impl Into<String>) -> Result<Self, ConfigError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConfigError::InvalidNodeId {
                reason: "node id must not be empty".to_string(),
            });
        }
        if id.chars().any(char::is_control) {
            return Err(ConfigError::InvalidNodeId {
                reason: format!("node id {:?} contains control characters", id),
            });
        }
        Ok(Self(Arc::from(id)))
    }

    /// The broadcast address
    pub fn broadcast() -> Self {
        Self(Arc::from(BROADCAST))
    }

    /// The well-known controller address
    pub fn controller() -> Self {
        Self(Arc::from(CONTROLLER))
    }

    /// Whether this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        &*self.0 == BROADCAST
    }

    /// Whether this is the well-known controller address
    pub fn is_controller(&self) -> bool {
        &*self.0 == CONTROLLER
    }

    /// Whether this is one of the reserved addresses
    pub fn is_reserved(&self) -> bool {
        self.is_broadcast() || self.is_controller()
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0.to_string()
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
