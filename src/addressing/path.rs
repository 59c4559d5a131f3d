//! Multi-hop path tracking

use super::NodeId;
use serde::{Deserialize, Serialize};

/// Maximum number of hops a path may record before relays drop the message
pub const MAX_PATH_LEN: usize = 32;

/// Ordered hops from the originator to the current relay
///
/// Paths only grow: relays append their own id before re-emitting a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    /// An empty path
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A path starting at the originator
    pub fn starting_at(origin: NodeId) -> Self {
        Self(vec![origin])
    }

    /// Build a path from existing hops
    pub fn from_hops(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }

    /// Append a hop
    pub fn push(&mut self, hop: NodeId) {
        self.0.push(hop);
    }

    /// A copy of this path with one more hop
    pub fn extended(&self, hop: NodeId) -> Self {
        let mut hops = self.0.clone();
        hops.push(hop);
        Self(hops)
    }

    /// Whether the node already appears on the path
    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.iter().any(|hop| hop == node)
    }

    /// The node that created the message
    pub fn originator(&self) -> Option<&NodeId> {
        self.0.first()
    }

    /// The most recent hop
    pub fn last_hop(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// The hop recorded just before `node`, used to walk the reverse path
    pub fn hop_before(&self, node: &NodeId) -> Option<&NodeId> {
        let position = self.0.iter().position(|hop| hop == node)?;
        position.checked_sub(1).and_then(|i| self.0.get(i))
    }

    /// Hops in reverse order, from the current relay back to the originator
    pub fn reversed(&self) -> Self {
        Self(self.0.iter().rev().cloned().collect())
    }

    /// Number of recorded hops
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no hop is recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the hops
    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter()
    }

    /// The hops as a slice
    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }
}

impl FromIterator<NodeId> for NetworkPath {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn test_path_grows_and_detects_membership() {
        let mut path = NetworkPath::starting_at(id("CS-1"));
        path.push(id("HUB-1"));

        assert_eq!(path.len(), 2);
        assert!(path.contains(&id("HUB-1")));
        assert!(!path.contains(&id("HUB-2")));
        assert_eq!(path.originator(), Some(&id("CS-1")));
        assert_eq!(path.last_hop(), Some(&id("HUB-1")));
    }

    #[test]
    fn test_extended_leaves_original_untouched() {
        let path = NetworkPath::starting_at(id("CS-1"));
        let longer = path.extended(id("HUB-1"));

        assert_eq!(path.len(), 1);
        assert_eq!(longer.len(), 2);
    }

    #[test]
    fn test_reverse_path_navigation() {
        let path: NetworkPath = ["CS-1", "HUB-1", "HUB-2"].iter().map(|s| id(s)).collect();

        assert_eq!(path.hop_before(&id("HUB-2")), Some(&id("HUB-1")));
        assert_eq!(path.hop_before(&id("CS-1")), None);
        assert_eq!(path.reversed().originator(), Some(&id("HUB-2")));
    }
}
