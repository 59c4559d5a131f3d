//! Topology announcement payload
//!
//! Nodes periodically tell their direct neighbours which destinations they
//! can reach. Announcements travel exactly one hop and are never relayed.

use crate::addressing::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One destination advertised by a neighbour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncedRoute {
    /// Reachable destination
    pub destination: NodeId,
    /// Announcer's own priority for the destination
    pub priority: u32,
    /// Validity in milliseconds, absent for routes that do not expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl AnnouncedRoute {
    /// Validity as a duration
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// The routes a node advertises to its neighbours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyAnnouncement {
    /// Announcing node
    pub origin: NodeId,
    /// When the announcement was produced
    pub timestamp: DateTime<Utc>,
    /// Advertised destinations
    #[serde(default)]
    pub routes: Vec<AnnouncedRoute>,
}

impl TopologyAnnouncement {
    /// An announcement with no routes
    pub fn new(origin: NodeId, timestamp: DateTime<Utc>) -> Self {
        Self {
            origin,
            timestamp,
            routes: Vec::new(),
        }
    }

    /// Add a route
    pub fn with_route(
        mut self,
        destination: NodeId,
        priority: u32,
        timeout: Option<Duration>,
    ) -> Self {
        self.routes.push(AnnouncedRoute {
            destination,
            priority,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        });
        self
    }
}
