//! Routing subsystem
//!
//! - **RoutingTable**: resolves a destination to exactly one next hop,
//!   static entries first, then priority, then freshness
//! - **Router**: picks the outbound channel for an envelope (routing table or
//!   source route), encodes it with the channel's wire variant and sends it
//!
//! # Route Discovery
//!
//! Routes are learned through:
//! 1. Direct connections to peers
//! 2. Topology announcements from neighbours
//! 3. Static configuration
//!
//! Learned routes carry a validity and are pruned by the maintenance cycle;
//! routes through a channel are dropped when the channel closes.

mod router;
mod routing_table;

pub use router::{OutgoingMessage, RetryQueue, RetryReport, Router, DEFAULT_MAX_RETRIES};
pub use routing_table::{NextHop, Route, RouteOrigin, RoutingTable};
