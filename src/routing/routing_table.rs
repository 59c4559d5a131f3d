//! Routing table management
//!
//! Every destination keeps a small vector of reachability entries, ordered so
//! that the head is always the winner: static entries first, then lowest
//! priority, then the most recent timestamp. Expired entries are pruned
//! lazily when the destination is resolved, and eagerly by the maintenance
//! sweep.

use crate::addressing::NodeId;
use crate::error::RoutingError;
use crate::network::ChannelId;
use crate::protocol::{AnnouncedRoute, TopologyAnnouncement};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bound on relay-to-relay indirections followed while resolving a channel
const MAX_RELAY_DEPTH: usize = 8;

/// Where to send a message next
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NextHop {
    /// An attached channel
    Channel(ChannelId),
    /// Another node, itself resolved through the table
    Relay(NodeId),
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(channel) => write!(f, "channel {}", channel),
            Self::Relay(node) => write!(f, "relay {}", node),
        }
    }
}

/// How an entry got into the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteOrigin {
    /// Configured by an operator
    Static,
    /// Learned from a neighbour's announcement or an attached channel
    Learned,
    /// Synthesized from the default route
    Default,
}

/// One reachability entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination node
    pub destination: NodeId,
    /// Where to send next
    pub next_hop: NextHop,
    /// Lower wins
    pub priority: u32,
    /// When the entry was created or last refreshed
    pub timestamp: DateTime<Utc>,
    /// Validity from `timestamp`, `None` for no expiry
    pub timeout: Option<Duration>,
    /// How the entry got here
    pub origin: RouteOrigin,
}

impl Route {
    /// Point in time after which the entry is ignored
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(self.timeout?).ok()?;
        self.timestamp.checked_add_signed(timeout)
    }

    /// Check if this route is expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(false, |deadline| deadline < now)
    }

    fn rank(&self, other: &Self) -> CmpOrdering {
        self.origin
            .cmp(&other.origin)
            .then(self.priority.cmp(&other.priority))
            .then(other.timestamp.cmp(&self.timestamp))
    }

    /// Equal apart from the timestamp
    fn same_shape(&self, other: &Self) -> bool {
        self.next_hop == other.next_hop
            && self.priority == other.priority
            && self.timeout == other.timeout
            && self.origin == other.origin
    }
}

/// Destination to next-hop resolution
///
/// Reads and writes are safe from any task; each destination is one
/// `DashMap` shard entry, so concurrent updates to different destinations
/// never contend.
pub struct RoutingTable {
    /// This node, never learned as a destination
    local: NodeId,
    /// Entries per destination, head is the winner
    routes: DashMap<NodeId, Vec<Route>>,
    /// Used when nothing else resolves
    default_route: RwLock<Option<NextHop>>,
    /// Validity given to learned routes that carry none
    learned_ttl: Option<Duration>,
    /// Bumped on every material change
    generation: AtomicU64,
}

impl RoutingTable {
    /// Create a new routing table for `local`
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            routes: DashMap::new(),
            default_route: RwLock::new(None),
            learned_ttl: None,
            generation: AtomicU64::new(0),
        }
    }

    /// Give learned routes a validity when the announcement carries none
    pub fn with_learned_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.learned_ttl = ttl;
        self
    }

    /// The local node
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Mutation counter
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Add or refresh a static entry
    ///
    /// Keyed by (destination, next hop): adding the same pair again replaces
    /// the entry in place.
    pub fn add_static_route(
        &self,
        destination: NodeId,
        next_hop: NextHop,
        priority: u32,
        timestamp: DateTime<Utc>,
        timeout: Option<Duration>,
    ) {
        self.upsert(Route {
            destination,
            next_hop,
            priority,
            timestamp,
            timeout,
            origin: RouteOrigin::Static,
        });
    }

    /// Add or refresh a learned entry
    ///
    /// Returns `false` when a static entry with the same key exists; learned
    /// entries never replace static ones.
    pub fn learn_route(
        &self,
        destination: NodeId,
        next_hop: NextHop,
        priority: u32,
        timestamp: DateTime<Utc>,
        timeout: Option<Duration>,
    ) -> bool {
        self.upsert(Route {
            destination,
            next_hop,
            priority,
            timestamp,
            timeout,
            origin: RouteOrigin::Learned,
        })
    }

    fn upsert(&self, route: Route) -> bool {
        let mut entries = self.routes.entry(route.destination.clone()).or_default();

        let changed = match entries.iter().position(|e| e.next_hop == route.next_hop) {
            Some(index) => {
                let existing = &entries[index];
                if existing.origin == RouteOrigin::Static && route.origin == RouteOrigin::Learned {
                    return false;
                }
                let changed = !existing.same_shape(&route);
                entries[index] = route;
                changed
            },
            None => {
                entries.push(route);
                true
            },
        };
        entries.sort_by(Route::rank);
        drop(entries);

        if changed {
            self.bump();
        }
        true
    }

    /// Remove one entry, or every entry for the destination
    ///
    /// Returns the number of entries removed.
    pub fn remove_route(&self, destination: &NodeId, next_hop: Option<&NextHop>) -> usize {
        let removed = match next_hop {
            None => self
                .routes
                .remove(destination)
                .map_or(0, |(_, entries)| entries.len()),
            Some(hop) => {
                let removed = self.routes.get_mut(destination).map_or(0, |mut entries| {
                    let before = entries.len();
                    entries.retain(|e| &e.next_hop != hop);
                    before - entries.len()
                });
                self.routes.remove_if(destination, |_, entries| entries.is_empty());
                removed
            },
        };

        if removed > 0 {
            self.bump();
        }
        removed
    }

    /// Remove every entry going through `next_hop`, e.g. a closed channel
    pub fn remove_next_hop(&self, next_hop: &NextHop) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| &e.next_hop != next_hop);
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            self.bump();
        }
        removed
    }

    /// Drop every expired entry
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| !e.is_expired_at(now));
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            self.bump();
        }
        removed
    }

    /// Set or clear the route used when nothing else resolves
    pub fn set_default_route(&self, next_hop: Option<NextHop>) {
        *self.default_route.write() = next_hop;
        self.bump();
    }

    /// The current default route
    pub fn default_route(&self) -> Option<NextHop> {
        self.default_route.read().clone()
    }

    /// Find the winning entry for a destination
    pub fn resolve(&self, destination: &NodeId) -> Result<Route, RoutingError> {
        self.resolve_at(destination, Utc::now())
    }

    /// Find the winning entry for a destination at a given time
    pub fn resolve_at(
        &self,
        destination: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<Route, RoutingError> {
        let mut pruned = false;
        let head = self.routes.get_mut(destination).and_then(|mut entries| {
            let before = entries.len();
            entries.retain(|e| !e.is_expired_at(now));
            pruned = entries.len() != before;
            entries.first().cloned()
        });

        if pruned {
            self.routes.remove_if(destination, |_, entries| entries.is_empty());
            self.bump();
        }

        if let Some(route) = head {
            return Ok(route);
        }

        match self.default_route() {
            Some(next_hop) => Ok(Route {
                destination: destination.clone(),
                next_hop,
                priority: u32::MAX,
                timestamp: now,
                timeout: None,
                origin: RouteOrigin::Default,
            }),
            None => Err(RoutingError::NotReachable {
                destination: destination.clone(),
            }),
        }
    }

    /// Follow relay entries down to an attached channel
    pub fn resolve_channel_at(
        &self,
        destination: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<ChannelId, RoutingError> {
        let mut target = destination.clone();
        for _ in 0..MAX_RELAY_DEPTH {
            match self.resolve_at(&target, now)?.next_hop {
                NextHop::Channel(channel) => return Ok(channel),
                NextHop::Relay(relay) => target = relay,
            }
        }
        Err(RoutingError::RelayChainTooDeep {
            destination: destination.clone(),
        })
    }

    /// Entries to advertise over `exclude`
    ///
    /// Split horizon: a destination is only announced through a route that
    /// does not lead back over the channel the announcement goes out on.
    pub fn announceable_routes(
        &self,
        exclude: &ChannelId,
        now: DateTime<Utc>,
    ) -> Vec<AnnouncedRoute> {
        let candidates: Vec<Vec<Route>> = self
            .routes
            .iter()
            .filter(|entry| entry.key() != &self.local)
            .map(|entry| entry.value().clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|entries| {
                entries
                    .into_iter()
                    .filter(|route| !route.is_expired_at(now))
                    .find(|route| !self.leads_to(&route.next_hop, exclude, now))
            })
            .map(|route| AnnouncedRoute {
                destination: route.destination,
                priority: route.priority,
                timeout_ms: route.timeout.map(|t| t.as_millis() as u64),
            })
            .collect()
    }

    fn leads_to(&self, next_hop: &NextHop, channel: &ChannelId, now: DateTime<Utc>) -> bool {
        match next_hop {
            NextHop::Channel(c) => c == channel,
            NextHop::Relay(relay) => self
                .resolve_channel_at(relay, now)
                .map_or(false, |c| &c == channel),
        }
    }

    /// Learn the routes a neighbour advertised over `via`
    ///
    /// The announcer is reachable directly at priority 0 for as long as the
    /// channel lives; everything it advertises costs one more than its own
    /// priority and expires after the learned ttl. The local node is
    /// never learned. Returns the number of entries added or refreshed.
    pub fn learn_from_announcement(
        &self,
        announcement: &TopologyAnnouncement,
        via: &ChannelId,
        now: DateTime<Utc>,
    ) -> usize {
        let hop = NextHop::Channel(via.clone());
        let mut learned = 0;

        if announcement.origin != self.local
            && self.learn_route(announcement.origin.clone(), hop.clone(), 0, now, None)
        {
            learned += 1;
        }

        for route in &announcement.routes {
            if route.destination == self.local || route.destination == announcement.origin {
                continue;
            }
            let timeout = route.timeout().or(self.learned_ttl);
            if self.learn_route(
                route.destination.clone(),
                hop.clone(),
                route.priority.saturating_add(1),
                now,
                timeout,
            ) {
                learned += 1;
            }
        }

        learned
    }

    /// All entries for a destination, winner first
    pub fn routes_for(&self, destination: &NodeId) -> Vec<Route> {
        self.routes
            .get(destination)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Get all known routes
    pub fn get_all_routes(&self) -> Vec<Route> {
        self.routes
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    /// Get the number of known routes
    pub fn route_count(&self) -> usize {
        self.routes.iter().map(|entry| entry.value().len()).sum()
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local", &self.local)
            .field("routes", &self.route_count())
            .field("generation", &self.generation())
            .finish()
    }
}
