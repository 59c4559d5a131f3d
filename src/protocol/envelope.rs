//! The wire unit carried between nodes
//!
//! An [`Envelope`] holds one protocol message plus its routing and
//! correlation metadata. The payload itself is opaque to the router.

use crate::addressing::{NetworkPath, NodeId, RequestId};
use crate::protocol::topology::TopologyAnnouncement;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of a protocol action, e.g. `BootNotification`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionKind(String);

impl ActionKind {
    /// Wrap an action name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The action name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Wire kind tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A request expecting exactly one reply
    Request,
    /// Successful reply to a request
    Response,
    /// Error reply to a request
    RequestError,
    /// Error raised while processing a response
    ResponseError,
    /// One-way message, never answered
    Notification,
    /// One-hop topology announcement between neighbours
    Announcement,
}

impl MessageKind {
    /// Numeric tag used on the wire
    pub fn tag(&self) -> i64 {
        match self {
            Self::Request => 2,
            Self::Response => 3,
            Self::RequestError => 4,
            Self::ResponseError => 5,
            Self::Notification => 6,
            Self::Announcement => 7,
        }
    }

    /// Parse a wire tag
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(Self::Request),
            3 => Some(Self::Response),
            4 => Some(Self::RequestError),
            5 => Some(Self::ResponseError),
            6 => Some(Self::Notification),
            7 => Some(Self::Announcement),
            _ => None,
        }
    }

    /// Whether this kind answers a request
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Response | Self::RequestError | Self::ResponseError)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "Request",
            Self::Response => "Response",
            Self::RequestError => "RequestError",
            Self::ResponseError => "ResponseError",
            Self::Notification => "Notification",
            Self::Announcement => "Announcement",
        };
        f.write_str(name)
    }
}

/// Where a message is going
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Resolve the node through the routing table
    Node(NodeId),
    /// Follow the listed hops; the last entry is the final destination
    SourceRoute(Vec<NodeId>),
}

impl Destination {
    /// The node the message is ultimately for
    pub fn final_node(&self) -> Option<&NodeId> {
        match self {
            Self::Node(id) => Some(id),
            Self::SourceRoute(hops) => hops.last(),
        }
    }
}

impl From<NodeId> for Destination {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

/// Message body as seen by the router
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured tree, carried as JSON in text frames
    Structured(serde_json::Value),
    /// Opaque bytes, e.g. a sealed payload
    Raw(Vec<u8>),
}

impl Payload {
    /// An empty structured object
    pub fn empty() -> Self {
        Self::Structured(serde_json::Value::Object(Default::default()))
    }

    /// Encoded size used for the payload cap
    pub fn size(&self) -> usize {
        match self {
            Self::Structured(value) => serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0),
            Self::Raw(bytes) => bytes.len(),
        }
    }

    /// The structured value, if any
    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Raw(_) => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

/// Closed error taxonomy carried by error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Payload is syntactically incorrect
    FormatViolation,
    /// Any other error
    GenericError,
    /// The receiver failed internally
    InternalError,
    /// Unknown message kind
    MessageTypeNotSupported,
    /// Action is recognised but not implemented
    NotImplemented,
    /// Action is not supported
    NotSupported,
    /// Payload misses a required field
    OccurrenceConstraintViolation,
    /// A field value is out of range
    PropertyConstraintViolation,
    /// Payload violates the protocol
    ProtocolError,
    /// Framework-level failure
    RpcFrameworkError,
    /// Security policy violation
    SecurityError,
    /// A field has the wrong type
    TypeConstraintViolation,
    /// No route to the destination
    NotReachable,
    /// The message looped back to a node already on its path
    RoutingLoopDetected,
    /// A relay refused to forward the request
    ForwardingRejected,
    /// Signature verification failed
    SignatureInvalid,
    /// The request timed out downstream
    Timeout,
}

impl ErrorCode {
    /// The wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FormatViolation => "FormatViolation",
            Self::GenericError => "GenericError",
            Self::InternalError => "InternalError",
            Self::MessageTypeNotSupported => "MessageTypeNotSupported",
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::ProtocolError => "ProtocolError",
            Self::RpcFrameworkError => "RpcFrameworkError",
            Self::SecurityError => "SecurityError",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::NotReachable => "NotReachable",
            Self::RoutingLoopDetected => "RoutingLoopDetected",
            Self::ForwardingRejected => "ForwardingRejected",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown error code {:?}", s))
    }
}

/// Body of an error reply
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable description
    pub description: String,
    /// Structured detail, an empty object when there is none
    pub details: serde_json::Value,
}

impl ErrorDetails {
    /// Error details without structured detail
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach structured detail; `null` means none
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = match details {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        self
    }
}

/// One signature attached to an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEntry {
    /// Id of the key that produced the signature
    pub key_id: String,
    /// Signature algorithm
    pub algorithm: String,
    /// Raw signature bytes
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Kind-specific content of an envelope
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    /// Request for an action
    Request {
        /// Requested action
        action: ActionKind,
        /// Request payload
        payload: Payload,
    },
    /// Successful reply
    Response {
        /// Reply payload
        payload: Payload,
    },
    /// Error reply to a request
    RequestError(ErrorDetails),
    /// Error raised on a response
    ResponseError(ErrorDetails),
    /// One-way message
    Notification {
        /// Notified action
        action: ActionKind,
        /// Notification payload
        payload: Payload,
    },
    /// Neighbour topology announcement
    Announcement(TopologyAnnouncement),
}

/// A protocol message with routing and correlation metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Correlation id
    pub id: RequestId,
    /// Target of the message
    pub destination: Destination,
    /// Hops travelled so far, originator first
    pub path: NetworkPath,
    /// Kind-specific content
    pub body: EnvelopeBody,
    /// Attached signatures
    pub signatures: Vec<SignatureEntry>,
}

impl Envelope {
    /// A request originating at `origin`
    pub fn request(
        id: RequestId,
        origin: NodeId,
        destination: impl Into<Destination>,
        action: impl Into<ActionKind>,
        payload: Payload,
    ) -> Self {
        Self {
            id,
            destination: destination.into(),
            path: NetworkPath::starting_at(origin),
            body: EnvelopeBody::Request {
                action: action.into(),
                payload,
            },
            signatures: Vec::new(),
        }
    }

    /// A one-way notification originating at `origin`
    pub fn notification(
        id: RequestId,
        origin: NodeId,
        destination: impl Into<Destination>,
        action: impl Into<ActionKind>,
        payload: Payload,
    ) -> Self {
        Self {
            id,
            destination: destination.into(),
            path: NetworkPath::starting_at(origin),
            body: EnvelopeBody::Notification {
                action: action.into(),
                payload,
            },
            signatures: Vec::new(),
        }
    }

    /// A topology announcement for the direct neighbours of `origin`
    pub fn announcement(id: RequestId, origin: NodeId, announcement: TopologyAnnouncement) -> Self {
        Self {
            id,
            destination: Destination::Node(NodeId::broadcast()),
            path: NetworkPath::starting_at(origin),
            body: EnvelopeBody::Announcement(announcement),
            signatures: Vec::new(),
        }
    }

    /// A successful reply to `request`, sent by `responder`
    pub fn response_to(request: &Envelope, responder: NodeId, payload: Payload) -> Self {
        Self::reply(request, responder, EnvelopeBody::Response { payload })
    }

    /// An error reply to `request`, sent by `responder`
    pub fn error_for(request: &Envelope, responder: NodeId, details: ErrorDetails) -> Self {
        Self::reply(request, responder, EnvelopeBody::RequestError(details))
    }

    /// An error raised while processing `response`
    pub fn response_error_for(
        response: &Envelope,
        responder: NodeId,
        details: ErrorDetails,
    ) -> Self {
        Self::reply(response, responder, EnvelopeBody::ResponseError(details))
    }

    fn reply(to: &Envelope, responder: NodeId, body: EnvelopeBody) -> Self {
        let destination = to
            .originator()
            .cloned()
            .map(Destination::Node)
            .unwrap_or_else(|| Destination::Node(NodeId::broadcast()));

        Self {
            id: to.id,
            destination,
            path: NetworkPath::starting_at(responder),
            body,
            signatures: Vec::new(),
        }
    }

    /// Wire kind of the envelope
    pub fn kind(&self) -> MessageKind {
        match &self.body {
            EnvelopeBody::Request { .. } => MessageKind::Request,
            EnvelopeBody::Response { .. } => MessageKind::Response,
            EnvelopeBody::RequestError(_) => MessageKind::RequestError,
            EnvelopeBody::ResponseError(_) => MessageKind::ResponseError,
            EnvelopeBody::Notification { .. } => MessageKind::Notification,
            EnvelopeBody::Announcement(_) => MessageKind::Announcement,
        }
    }

    /// Action of a request or notification
    pub fn action(&self) -> Option<&ActionKind> {
        match &self.body {
            EnvelopeBody::Request { action, .. } | EnvelopeBody::Notification { action, .. } => {
                Some(action)
            },
            _ => None,
        }
    }

    /// Payload of a request, response or notification
    pub fn payload(&self) -> Option<&Payload> {
        match &self.body {
            EnvelopeBody::Request { payload, .. }
            | EnvelopeBody::Response { payload }
            | EnvelopeBody::Notification { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Mutable payload of a request, response or notification
    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        match &mut self.body {
            EnvelopeBody::Request { payload, .. }
            | EnvelopeBody::Response { payload }
            | EnvelopeBody::Notification { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Error details of an error reply
    pub fn error(&self) -> Option<&ErrorDetails> {
        match &self.body {
            EnvelopeBody::RequestError(details) | EnvelopeBody::ResponseError(details) => {
                Some(details)
            },
            _ => None,
        }
    }

    /// The node that created the message
    pub fn originator(&self) -> Option<&NodeId> {
        self.path.originator()
    }

    /// The node the message is ultimately for
    pub fn final_destination(&self) -> Option<&NodeId> {
        self.destination.final_node()
    }

    /// Whether the envelope answers a request
    pub fn is_reply(&self) -> bool {
        self.kind().is_reply()
    }

    /// A copy with `hop` appended to the path
    pub fn with_hop(&self, hop: NodeId) -> Self {
        let mut next = self.clone();
        next.path.push(hop);
        next
    }
}
