//! Request identifiers

use super::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// First id handed out by a [`RequestIdGenerator`]
///
/// Ids below this value are left to peers that issue their own numeric ids.
pub const REQUEST_ID_OFFSET: u64 = 1_000_000_000;

/// Correlation id of a request and every reply to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Monotonic, thread-safe id source owned by one node
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    /// A generator starting at [`REQUEST_ID_OFFSET`]
    pub fn new() -> Self {
        Self::starting_at(REQUEST_ID_OFFSET)
    }

    /// A generator starting at an explicit value
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocate the next id; ids are never handed out twice
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The id the next call will return
    pub fn peek(&self) -> RequestId {
        RequestId(self.next.load(Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Globally unique key for a request once it leaves its originator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Node that issued the id
    pub origin: NodeId,
    /// The id itself
    pub request_id: RequestId,
}

impl CorrelationKey {
    /// Pair an id with its issuer
    pub fn new(origin: NodeId, request_id: RequestId) -> Self {
        Self { origin, request_id }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_generator_starts_above_offset() {
        let ids = RequestIdGenerator::new();
        assert_eq!(ids.next_id().value(), REQUEST_ID_OFFSET);
        assert_eq!(ids.next_id().value(), REQUEST_ID_OFFSET + 1);
        assert_eq!(ids.peek().value(), REQUEST_ID_OFFSET + 2);
    }

    #[test]
    fn test_generator_unique_across_threads() {
        let ids = Arc::new(RequestIdGenerator::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {} handed out twice", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn test_request_id_parse() {
        assert_eq!("42".parse::<RequestId>().unwrap(), RequestId::new(42));
        assert!("abc".parse::<RequestId>().is_err());
    }
}
