//! Request/response correlation
//!
//! Every request this node issues gets a slot keyed by its [`RequestId`].
//! The slot completes exactly once, with whichever of reply, deadline
//! expiry, cancellation or transport failure happens first; anything that
//! arrives afterwards is logged as late and discarded.
//!
//! [`RequestId`]: crate::addressing::RequestId

mod engine;
mod pending;

pub use engine::{CorrelationConfig, CorrelationEngine, DEFAULT_MAX_PENDING};
pub use pending::{CorrelationStats, PendingCall, PendingRequest, StatsSnapshot};

use crate::error::Result;
use crate::protocol::Envelope;

/// Final result of a request
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// A response arrived
    Success(Envelope),
    /// An error reply arrived
    Rejected(Envelope),
    /// No reply before the deadline
    TimedOut,
    /// The caller cancelled the request
    Cancelled,
    /// The request could not be delivered
    TransportFailure(String),
}

impl SendOutcome {
    /// Whether a response arrived
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The reply, if any
    pub fn reply(&self) -> Option<&Envelope> {
        match self {
            Self::Success(envelope) | Self::Rejected(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// Hands outbound requests to the wire
pub trait Transmitter: Send + Sync {
    /// Send now
    fn transmit(&self, envelope: &Envelope) -> Result<()>;

    /// Park for a later attempt; `false` when retries are not supported
    fn defer(&self, envelope: Envelope) -> bool {
        let _ = envelope;
        false
    }
}
