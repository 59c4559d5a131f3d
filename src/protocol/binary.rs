//! Protocol Buffers binary frames
//!
//! The message definitions are derived directly with `prost` and mirror the
//! text layout field for field.

use super::envelope::{
    ActionKind, Destination, Envelope, EnvelopeBody, ErrorCode, ErrorDetails, MessageKind,
    Payload, SignatureEntry,
};
use super::topology::TopologyAnnouncement;
use super::{CodecConfig, EnvelopeCodec, Frame, WireFormat};
use crate::addressing::{NetworkPath, NodeId, RequestId};
use crate::error::{DecodeError, ProtocolError};
use prost::Message;

const PAYLOAD_NONE: u32 = 0;
const PAYLOAD_JSON: u32 = 1;
const PAYLOAD_RAW: u32 = 2;

/// Top-level binary frame
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireEnvelope {
    /// Kind tag, same values as the text variant
    #[prost(uint32, tag = "1")]
    pub kind: u32,
    /// Correlation id
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// Target
    #[prost(message, optional, tag = "3")]
    pub destination: Option<WireDestination>,
    /// Hops travelled so far
    #[prost(string, repeated, tag = "4")]
    pub path: Vec<String>,
    /// Action for requests and notifications
    #[prost(string, optional, tag = "5")]
    pub action: Option<String>,
    /// How `payload` is encoded: 0 none, 1 JSON, 2 raw
    #[prost(uint32, tag = "6")]
    pub payload_format: u32,
    /// Payload bytes
    #[prost(bytes = "vec", tag = "7")]
    pub payload: Vec<u8>,
    /// Error body for error kinds
    #[prost(message, optional, tag = "8")]
    pub error: Option<WireError>,
    /// Attached signatures
    #[prost(message, repeated, tag = "9")]
    pub signatures: Vec<WireSignature>,
}

/// Destination of a binary frame
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireDestination {
    /// One node, or the hops of a source route
    #[prost(string, repeated, tag = "1")]
    pub hops: Vec<String>,
    /// Whether `hops` is a source route
    #[prost(bool, tag = "2")]
    pub source_routed: bool,
}

/// Error body of a binary frame
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireError {
    /// Error code name
    #[prost(string, tag = "1")]
    pub code: String,
    /// Human-readable description
    #[prost(string, tag = "2")]
    pub description: String,
    /// JSON-encoded details, empty for none
    #[prost(bytes = "vec", tag = "3")]
    pub details: Vec<u8>,
}

/// Signature of a binary frame
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireSignature {
    /// Signing key id
    #[prost(string, tag = "1")]
    pub key_id: String,
    /// Signature algorithm
    #[prost(string, tag = "2")]
    pub algorithm: String,
    /// Signature bytes
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
}

/// Codec for Protocol Buffers frames
#[derive(Debug, Clone, Default)]
pub struct BinaryCodec {
    config: CodecConfig,
}

fn expected_body_fields(kind: MessageKind) -> usize {
    match kind {
        MessageKind::Request | MessageKind::Notification => 2,
        _ => 1,
    }
}

fn serialization_failed(kind: MessageKind, e: impl ToString) -> ProtocolError {
    ProtocolError::SerializationFailed {
        kind: kind.to_string(),
        reason: e.to_string(),
    }
}

impl BinaryCodec {
    /// Create a codec with the given limits
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    fn encode_payload(
        &self,
        kind: MessageKind,
        payload: &Payload,
    ) -> Result<(u32, Vec<u8>), ProtocolError> {
        let size = payload.size();
        if size > self.config.max_payload_size {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: self.config.max_payload_size,
            });
        }
        match payload {
            Payload::Structured(value) => serde_json::to_vec(value)
                .map(|bytes| (PAYLOAD_JSON, bytes))
                .map_err(|e| serialization_failed(kind, e)),
            Payload::Raw(bytes) => Ok((PAYLOAD_RAW, bytes.clone())),
        }
    }

    fn decode_payload(&self, wire: &WireEnvelope, id: RequestId) -> Result<Payload, DecodeError> {
        if wire.payload.len() > self.config.max_payload_size {
            return Err(DecodeError::PayloadTooLarge {
                size: wire.payload.len(),
                max: self.config.max_payload_size,
                request_id: Some(id),
            });
        }
        match wire.payload_format {
            PAYLOAD_JSON => serde_json::from_slice(&wire.payload)
                .map(Payload::Structured)
                .map_err(|e| invalid("payload", e.to_string(), id)),
            PAYLOAD_RAW => Ok(Payload::Raw(wire.payload.clone())),
            PAYLOAD_NONE => Err(invalid("payload", "payload is missing", id)),
            other => Err(invalid("payload", format!("unknown payload format {}", other), id)),
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>, id: RequestId) -> DecodeError {
    DecodeError::InvalidField {
        field: field.to_string(),
        reason: reason.into(),
        request_id: Some(id),
    }
}

fn node_ids(hops: &[String], field: &str, id: RequestId) -> Result<Vec<NodeId>, DecodeError> {
    hops.iter()
        .map(|hop| NodeId::new(hop.as_str()).map_err(|e| invalid(field, e.to_string(), id)))
        .collect()
}

fn decode_destination(
    destination: Option<&WireDestination>,
    id: RequestId,
) -> Result<Destination, DecodeError> {
    let destination =
        destination.ok_or_else(|| invalid("destination", "destination is missing", id))?;
    let mut hops = node_ids(&destination.hops, "destination", id)?;

    if destination.source_routed {
        if hops.is_empty() {
            return Err(invalid("destination", "source route is empty", id));
        }
        return Ok(Destination::SourceRoute(hops));
    }

    match (hops.pop(), hops.is_empty()) {
        (Some(node), true) => Ok(Destination::Node(node)),
        _ => Err(invalid("destination", "expected exactly one node id", id)),
    }
}

fn decode_error(wire: Option<&WireError>, id: RequestId) -> Result<ErrorDetails, DecodeError> {
    let wire = wire.ok_or_else(|| invalid("error", "error body is missing", id))?;
    let code: ErrorCode = wire.code.parse().map_err(|e: String| invalid("code", e, id))?;
    let details = if wire.details.is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        serde_json::from_slice(&wire.details).map_err(|e| invalid("details", e.to_string(), id))?
    };
    Ok(ErrorDetails {
        code,
        description: wire.description.clone(),
        details,
    })
}

impl EnvelopeCodec for BinaryCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Binary
    }

    fn encode(&self, envelope: &Envelope) -> Result<Frame, ProtocolError> {
        let kind = envelope.kind();
        let destination = match &envelope.destination {
            Destination::Node(node) => WireDestination {
                hops: vec![node.to_string()],
                source_routed: false,
            },
            Destination::SourceRoute(hops) => WireDestination {
                hops: hops.iter().map(ToString::to_string).collect(),
                source_routed: true,
            },
        };

        let mut wire = WireEnvelope {
            kind: kind.tag() as u32,
            request_id: envelope.id.value(),
            destination: Some(destination),
            path: envelope.path.iter().map(ToString::to_string).collect(),
            action: None,
            payload_format: PAYLOAD_NONE,
            payload: Vec::new(),
            error: None,
            signatures: envelope
                .signatures
                .iter()
                .map(|sig| WireSignature {
                    key_id: sig.key_id.clone(),
                    algorithm: sig.algorithm.clone(),
                    value: sig.value.clone(),
                })
                .collect(),
        };

        match &envelope.body {
            EnvelopeBody::Request { action, payload }
            | EnvelopeBody::Notification { action, payload } => {
                wire.action = Some(action.to_string());
                (wire.payload_format, wire.payload) = self.encode_payload(kind, payload)?;
            },
            EnvelopeBody::Response { payload } => {
                (wire.payload_format, wire.payload) = self.encode_payload(kind, payload)?;
            },
            EnvelopeBody::Announcement(announcement) => {
                wire.payload_format = PAYLOAD_JSON;
                wire.payload =
                    serde_json::to_vec(announcement).map_err(|e| serialization_failed(kind, e))?;
            },
            EnvelopeBody::RequestError(details) | EnvelopeBody::ResponseError(details) => {
                wire.error = Some(WireError {
                    code: details.code.as_str().to_string(),
                    description: details.description.clone(),
                    details: serde_json::to_vec(&details.details)
                        .map_err(|e| serialization_failed(kind, e))?,
                });
            },
        }

        Ok(Frame::Binary(wire.encode_to_vec()))
    }

    fn decode(&self, frame: &Frame) -> Result<Envelope, DecodeError> {
        let bytes = match frame {
            Frame::Binary(bytes) => bytes,
            Frame::Text(_) => {
                return Err(DecodeError::MalformedFrame {
                    reason: "text frame handed to the binary codec".to_string(),
                })
            },
        };

        let max_frame = self.config.max_frame_size();
        if bytes.len() > max_frame {
            return Err(DecodeError::MalformedFrame {
                reason: format!("frame of {} bytes exceeds {} bytes", bytes.len(), max_frame),
            });
        }

        let wire = WireEnvelope::decode(bytes.as_slice()).map_err(|e| DecodeError::MalformedFrame {
            reason: e.to_string(),
        })?;

        // proto3 omits zero fields, so an empty or foreign message has no kind
        if wire.kind == 0 {
            return Err(DecodeError::MalformedFrame {
                reason: "frame carries no message kind".to_string(),
            });
        }

        let id = RequestId::new(wire.request_id);
        let tag = i64::from(wire.kind);
        let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownKind {
            tag,
            request_id: Some(id),
        })?;

        let present = usize::from(wire.action.is_some())
            + usize::from(wire.payload_format != PAYLOAD_NONE)
            + usize::from(wire.error.is_some());
        let expected = expected_body_fields(kind);
        if present != expected {
            // Header fields (tag, id, destination, path, signatures) are always counted.
            return Err(DecodeError::ArityMismatch {
                tag,
                expected: expected + 5,
                actual: present + 5,
                request_id: Some(id),
            });
        }

        let destination = decode_destination(wire.destination.as_ref(), id)?;
        if wire.path.is_empty() {
            return Err(invalid("path", "path must name the originator", id));
        }
        let path: NetworkPath = node_ids(&wire.path, "path", id)?.into_iter().collect();

        let action = || match wire.action.as_deref() {
            Some(name) if !name.is_empty() => Ok(ActionKind::new(name)),
            _ => Err(invalid("action", "expected a non-empty action", id)),
        };

        let body = match kind {
            MessageKind::Request => EnvelopeBody::Request {
                action: action()?,
                payload: self.decode_payload(&wire, id)?,
            },
            MessageKind::Notification => EnvelopeBody::Notification {
                action: action()?,
                payload: self.decode_payload(&wire, id)?,
            },
            MessageKind::Response => EnvelopeBody::Response {
                payload: self.decode_payload(&wire, id)?,
            },
            MessageKind::Announcement => {
                if wire.payload_format != PAYLOAD_JSON {
                    return Err(invalid("payload", "announcement must be JSON", id));
                }
                let announcement: TopologyAnnouncement = serde_json::from_slice(&wire.payload)
                    .map_err(|e| invalid("payload", e.to_string(), id))?;
                EnvelopeBody::Announcement(announcement)
            },
            MessageKind::RequestError => {
                EnvelopeBody::RequestError(decode_error(wire.error.as_ref(), id)?)
            },
            MessageKind::ResponseError => {
                EnvelopeBody::ResponseError(decode_error(wire.error.as_ref(), id)?)
            },
        };

        let signatures = wire
            .signatures
            .into_iter()
            .map(|sig| SignatureEntry {
                key_id: sig.key_id,
                algorithm: sig.algorithm,
                value: sig.value,
            })
            .collect();

        Ok(Envelope {
            id,
            destination,
            path,
            body,
            signatures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TextCodec;
    use serde_json::json;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn request() -> Envelope {
        Envelope::request(
            RequestId::new(1_000_000_042),
            id("CS-7"),
            NodeId::controller(),
            "Authorize",
            Payload::Structured(json!({"idTag": "ABC123"})),
        )
        .with_hop(id("HUB-2"))
    }

    #[test]
    fn test_every_kind_survives_a_roundtrip() {
        let codec = BinaryCodec::default();
        let request = request();
        let envelopes = vec![
            request.clone(),
            Envelope::response_to(
                &request,
                id("CSMS"),
                Payload::Structured(json!({"status": "Accepted"})),
            ),
            Envelope::response_to(&request, id("CSMS"), Payload::Raw(vec![9; 40])),
            Envelope::error_for(
                &request,
                id("HUB-2"),
                ErrorDetails::new(ErrorCode::Timeout, "late"),
            ),
            Envelope::response_error_for(
                &request,
                id("CS-7"),
                ErrorDetails::new(ErrorCode::ProtocolError, "x").with_details(json!({"field": 1})),
            ),
            Envelope::notification(
                RequestId::new(2),
                id("CSMS"),
                Destination::SourceRoute(vec![id("HUB-2"), id("CS-7")]),
                "Reset",
                Payload::empty(),
            ),
            Envelope::announcement(
                RequestId::new(3),
                id("HUB-2"),
                TopologyAnnouncement::new(id("HUB-2"), chrono::Utc::now()).with_route(
                    id("CS-7"),
                    1,
                    Some(std::time::Duration::from_secs(60)),
                ),
            ),
        ];

        for envelope in envelopes {
            let frame = codec.encode(&envelope).unwrap();
            assert_eq!(codec.decode(&frame).unwrap(), envelope, "kind {}", envelope.kind());
        }
    }

    #[test]
    fn test_variants_carry_identical_fields() {
        let text = TextCodec::default();
        let binary = BinaryCodec::default();
        let envelope = request();

        let via_text = text.decode(&text.encode(&envelope).unwrap()).unwrap();
        let via_binary = binary.decode(&binary.encode(&via_text).unwrap()).unwrap();
        assert_eq!(via_binary, envelope);
    }

    #[test]
    fn test_unknown_kind_keeps_the_id() {
        let wire = WireEnvelope {
            kind: 42,
            request_id: 17,
            ..Default::default()
        };
        let err = BinaryCodec::default()
            .decode(&Frame::Binary(wire.encode_to_vec()))
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownKind {
                tag: 42,
                request_id: Some(RequestId::new(17)),
            }
        );
    }

    #[test]
    fn test_missing_action_is_arity_mismatch() {
        let mut wire = WireEnvelope::decode(
            match BinaryCodec::default().encode(&request()).unwrap() {
                Frame::Binary(bytes) => bytes,
                Frame::Text(_) => unreachable!(),
            }
            .as_slice(),
        )
        .unwrap();
        wire.action = None;

        let err = BinaryCodec::default()
            .decode(&Frame::Binary(wire.encode_to_vec()))
            .unwrap_err();
        assert!(matches!(err, DecodeError::ArityMismatch { expected: 7, actual: 6, .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_garbage_is_fatal() {
        let err = BinaryCodec::default()
            .decode(&Frame::Binary(vec![0xff, 0xff, 0xff, 0xff]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame { .. }));
    }

    #[test]
    fn test_empty_frame_is_fatal() {
        let err = BinaryCodec::default().decode(&Frame::Binary(Vec::new())).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame { .. }));
        assert_eq!(err.request_id(), None);
    }

    #[test]
    fn test_null_details_survive_a_roundtrip() {
        let codec = BinaryCodec::default();
        let details = ErrorDetails::new(ErrorCode::InternalError, "x");
        let mut envelope = Envelope::error_for(&request(), id("CSMS"), details);
        if let EnvelopeBody::RequestError(details) = &mut envelope.body {
            details.details = serde_json::Value::Null;
        }

        let frame = codec.encode(&envelope).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let codec = BinaryCodec::new(CodecConfig { max_payload_size: 0 });
        let err = codec
            .decode(&Frame::Binary(vec![0; super::super::FRAME_OVERHEAD + 1]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame { .. }));
    }
}
