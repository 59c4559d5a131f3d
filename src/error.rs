//! Error types for chargemesh
//!
//! Every subsystem has its own error enum; [`ChargemeshError`] wraps them so
//! that public operations can return a single [`Result`] type.

use crate::addressing::{NodeId, RequestId};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for chargemesh operations
#[derive(Error, Debug)]
pub enum ChargemeshError {
    /// Encoding or envelope construction errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Malformed inbound frames
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Destination resolution errors
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Request/response correlation errors
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// Relay admission errors
    #[error("Forwarding error: {0}")]
    Forwarding(#[from] ForwardingError),

    /// Signature policy errors
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    /// Symmetric encryption errors
    #[error("Cryptography error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChargemeshError {
    /// Whether retrying the same operation later may succeed
    ///
    /// Only missing routes and unavailable channels are transient; everything
    /// else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Routing(RoutingError::NotReachable { .. }) => true,
            Self::Routing(RoutingError::NoChannel { .. }) => true,
            Self::Network(NetworkError::ChannelClosed { .. }) => true,
            Self::Network(NetworkError::SendFailed { .. }) => true,
            _ => false,
        }
    }
}

/// Errors raised while building or encoding envelopes
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Encoding failed
    #[error("Failed to serialize {kind}: {reason}")]
    SerializationFailed {
        /// Envelope kind being encoded
        kind: String,
        /// Underlying reason
        reason: String,
    },

    /// A field holds a value the wire format cannot carry
    #[error("Invalid field {field}: {reason}")]
    InvalidFieldValue {
        /// Field name
        field: String,
        /// Why the value is invalid
        reason: String,
    },

    /// Payload exceeds the configured cap
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The frame variant does not match the codec
    #[error("Frame format mismatch: expected {expected}")]
    FrameMismatch {
        /// Format the codec handles
        expected: String,
    },
}

/// Errors raised while decoding an inbound frame
///
/// Errors that know the offending [`RequestId`] are recoverable: the frame is
/// dropped but a rejection can be returned to the sender. Framing errors are
/// fatal for the connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The frame could not be parsed at all
    #[error("Malformed frame: {reason}")]
    MalformedFrame {
        /// Parser message
        reason: String,
    },

    /// The kind tag is not one of the known message kinds
    #[error("Unknown message kind tag {tag}")]
    UnknownKind {
        /// Offending tag
        tag: i64,
        /// Id of the message, if it could be read
        request_id: Option<RequestId>,
    },

    /// Wrong number of fields for the message kind
    #[error("Wrong field count for kind {tag}: expected {expected}, got {actual}")]
    ArityMismatch {
        /// Kind tag
        tag: i64,
        /// Expected field count
        expected: usize,
        /// Actual field count
        actual: usize,
        /// Id of the message, if it could be read
        request_id: Option<RequestId>,
    },

    /// Payload exceeds the configured cap
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Configured maximum
        max: usize,
        /// Id of the message, if it could be read
        request_id: Option<RequestId>,
    },

    /// A field has the wrong type or an invalid value
    #[error("Invalid field {field}: {reason}")]
    InvalidField {
        /// Field name
        field: String,
        /// Why the value is invalid
        reason: String,
        /// Id of the message, if it could be read
        request_id: Option<RequestId>,
    },
}

impl DecodeError {
    /// Id of the offending message, when it could be recovered
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::MalformedFrame { .. } => None,
            Self::UnknownKind { request_id, .. }
            | Self::ArityMismatch { request_id, .. }
            | Self::PayloadTooLarge { request_id, .. }
            | Self::InvalidField { request_id, .. } => *request_id,
        }
    }

    /// Whether a rejection can be sent back instead of closing the connection
    pub fn is_recoverable(&self) -> bool {
        self.request_id().is_some()
    }
}

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No unexpired route to the destination
    #[error("Destination not reachable: {destination}")]
    NotReachable {
        /// Unreachable destination
        destination: NodeId,
    },

    /// The local node already appears in the message path
    #[error("Routing loop detected at {node}")]
    RoutingLoopDetected {
        /// Node that detected the loop
        node: NodeId,
    },

    /// The path exceeds the hop limit
    #[error("Path too long: {length} hops (max: {max})")]
    PathTooLong {
        /// Current hop count
        length: usize,
        /// Hop limit
        max: usize,
    },

    /// A route resolved to a channel that is not attached
    #[error("No attached channel {channel}")]
    NoChannel {
        /// Missing channel id
        channel: String,
    },

    /// Relay chain resolution exceeded its depth bound
    #[error("Relay chain for {destination} too deep")]
    RelayChainTooDeep {
        /// Destination being resolved
        destination: NodeId,
    },

    /// The destination is not a valid routing target
    #[error("Invalid destination: {reason}")]
    InvalidDestination {
        /// Why the destination is invalid
        reason: String,
    },
}

/// Correlation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// A response arrived for an id with no pending request
    #[error("No pending request for id {request_id} (late or duplicate)")]
    UnknownRequest {
        /// Id of the response
        request_id: RequestId,
    },

    /// The pending request table is full
    #[error("Too many pending requests (max: {max})")]
    TooManyPending {
        /// Configured cap
        max: usize,
    },

    /// A request with the same id is already pending
    #[error("Request id {request_id} is already pending")]
    DuplicateRequest {
        /// The reused id
        request_id: RequestId,
    },

    /// Only requests can be correlated
    #[error("Envelope kind {kind} cannot be sent as a request")]
    NotARequest {
        /// Kind of the offending envelope
        kind: String,
    },
}

/// Forwarding errors raised by filters and the relay pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardingError {
    /// A filter failed while deciding
    #[error("Filter for {action} failed: {reason}")]
    FilterFailed {
        /// Action the filter was registered for
        action: String,
        /// Failure description
        reason: String,
    },

    /// A payload validator rejected the request
    #[error("Payload for {action} is invalid: {reason}")]
    InvalidPayload {
        /// Action being validated
        action: String,
        /// Validation message
        reason: String,
    },

    /// This node does not relay traffic
    #[error("Node {node} does not relay traffic")]
    RelayDisabled {
        /// Local node
        node: NodeId,
    },
}

/// Signature policy errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// No signing key registered under the id
    #[error("Unknown signing key: {key_id}")]
    UnknownSigningKey {
        /// Missing key id
        key_id: String,
    },

    /// Verification failed
    #[error("Signature invalid: {reason}")]
    Invalid {
        /// Why verification failed
        reason: String,
    },

    /// Key bytes could not be parsed
    #[error("Invalid key material: {reason}")]
    InvalidKey {
        /// Parser message
        reason: String,
    },
}

/// Symmetric encryption errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed
    #[error("Encryption failed: {reason}")]
    EncryptionFailed {
        /// Underlying reason
        reason: String,
    },

    /// Decryption or authentication failed
    #[error("Decryption failed: {reason}")]
    DecryptionFailed {
        /// Underlying reason
        reason: String,
    },

    /// Sealed payload framing is invalid
    #[error("Invalid sealed payload: {context}")]
    InvalidSealedPayload {
        /// What was wrong
        context: String,
    },

    /// The key provider has no key for the pair
    #[error("No key {key_id} for {peer}")]
    KeyNotFound {
        /// Peer the key is for
        peer: NodeId,
        /// Requested key id
        key_id: String,
    },
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The channel was closed
    #[error("Channel closed: {channel}")]
    ChannelClosed {
        /// Channel id
        channel: String,
    },

    /// The transport refused the frame
    #[error("Send failed: {reason}")]
    SendFailed {
        /// Underlying reason
        reason: String,
    },

    /// The pool is at capacity
    #[error("Connection pool is full (max: {max})")]
    PoolFull {
        /// Configured cap
        max: usize,
    },

    /// Too many malformed frames on one channel
    #[error("Too many decode errors on {channel}")]
    TooManyDecodeErrors {
        /// Channel id
        channel: String,
    },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required value is missing
    #[error("Missing required field: {field}")]
    MissingRequiredField {
        /// Field name
        field: String,
    },

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Why it is invalid
        reason: String,
    },

    /// Configuration file does not exist
    #[error("Config file not found: {path:?}")]
    FileNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// Configuration could not be (de)serialized
    #[error("Config serialization failed: {reason}")]
    SerializationFailed {
        /// Parser message
        reason: String,
    },

    /// Node identifiers must be non-empty
    #[error("Invalid node id: {reason}")]
    InvalidNodeId {
        /// Why the id is invalid
        reason: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ChargemeshError>;

/// Walk an error's `source()` chain down to the innermost cause
pub fn root_cause<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> &'a (dyn std::error::Error + 'static) {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_errors() {
        let err: ChargemeshError = RoutingError::NotReachable {
            destination: NodeId::new("CS-1").unwrap(),
        }
        .into();

        let cause = root_cause(&err);
        assert_eq!(cause.to_string(), "Destination not reachable: CS-1");
    }

    #[test]
    fn test_root_cause_of_leaf_is_itself() {
        let err = CryptoError::EncryptionFailed {
            reason: "boom".to_string(),
        };
        assert_eq!(root_cause(&err).to_string(), err.to_string());
    }

    #[test]
    fn test_transient_classification() {
        let not_reachable: ChargemeshError = RoutingError::NotReachable {
            destination: NodeId::controller(),
        }
        .into();
        assert!(not_reachable.is_transient());

        let looped: ChargemeshError = RoutingError::RoutingLoopDetected {
            node: NodeId::controller(),
        }
        .into();
        assert!(!looped.is_transient());
    }

    #[test]
    fn test_decode_error_recoverability() {
        let fatal = DecodeError::MalformedFrame {
            reason: "eof".to_string(),
        };
        assert!(!fatal.is_recoverable());

        let recoverable = DecodeError::UnknownKind {
            tag: 9,
            request_id: Some(RequestId::new(7)),
        };
        assert!(recoverable.is_recoverable());
        assert_eq!(recoverable.request_id(), Some(RequestId::new(7)));
    }
}
