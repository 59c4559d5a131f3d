//! Forwarding decisions and the context they are made in

use crate::addressing::NodeId;
use crate::network::ChannelId;
use crate::protocol::{Envelope, ErrorCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a relay discarded a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The local node is already on the path
    RoutingLoop,
    /// The path has no room for another hop
    PathTooLong,
    /// The destination is on the deny-list
    Denied,
    /// The allow-list is active and does not list the destination
    NotAllowed,
    /// The default policy refused a one-way message
    DefaultPolicy,
    /// A one-way message was refused with this code; no reply can be sent
    Refused(ErrorCode),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoutingLoop => f.write_str("routing loop"),
            Self::PathTooLong => f.write_str("path too long"),
            Self::Denied => f.write_str("destination denied"),
            Self::NotAllowed => f.write_str("destination not allowed"),
            Self::DefaultPolicy => f.write_str("default policy"),
            Self::Refused(code) => write!(f, "refused ({})", code),
        }
    }
}

/// Outcome of the forwarding pipeline for one message
///
/// A reply exists exactly when the decision is `Reject`.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardingDecision {
    /// Forward the message, optionally replaced by a rewritten copy
    Admit {
        /// Replacement envelope, e.g. re-signed or with an altered payload
        rewritten: Option<Envelope>,
    },
    /// Discard silently
    Drop {
        /// Why the message was discarded
        reason: DropReason,
    },
    /// Refuse and answer the sender
    Reject {
        /// Reply sent back toward the originator
        reply: Envelope,
    },
}

impl ForwardingDecision {
    /// Forward unchanged
    pub fn admit() -> Self {
        Self::Admit { rewritten: None }
    }

    /// Discard for `reason`
    pub fn drop(reason: DropReason) -> Self {
        Self::Drop { reason }
    }

    /// Whether the message continues
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Admit { .. } => "admit",
            Self::Drop { .. } => "drop",
            Self::Reject { .. } => "reject",
        }
    }
}

/// What to do with traffic no filter decided on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    /// Forward
    #[default]
    Admit,
    /// Refuse requests with `NotSupported`, discard one-way messages
    Drop,
}

/// Where a message came from and who is deciding
#[derive(Debug, Clone)]
pub struct ForwardingContext {
    /// Channel the message arrived on
    pub connection: ChannelId,
    /// Peer attached to that channel, when known
    pub inbound_peer: Option<NodeId>,
    /// The deciding node
    pub local: NodeId,
    /// Whether the message is addressed to the deciding node
    pub locally_addressed: bool,
}

impl ForwardingContext {
    /// Context for pass-through traffic
    pub fn relay(connection: ChannelId, inbound_peer: Option<NodeId>, local: NodeId) -> Self {
        Self {
            connection,
            inbound_peer,
            local,
            locally_addressed: false,
        }
    }
}
