//! JSON-array text frames
//!
//! Layout by kind:
//!
//! ```text
//! Request, Notification:        [tag, id, destination, path, action, payload, signatures]
//! Response, Announcement:       [tag, id, destination, path, payload, signatures]
//! RequestError, ResponseError:  [tag, id, destination, path, code, description, details,
//!                                 signatures]
//! ```
//!
//! The id is a decimal string. The destination is a node id string, or an
//! array of node ids for a source route. Raw payloads are written as
//! `{"$raw": "<hex>"}`.

use super::envelope::{
    ActionKind, Destination, Envelope, EnvelopeBody, ErrorCode, ErrorDetails, MessageKind,
    Payload, SignatureEntry,
};
use super::topology::TopologyAnnouncement;
use super::{CodecConfig, EnvelopeCodec, Frame, WireFormat, RAW_PAYLOAD_KEY};
use crate::addressing::{NetworkPath, NodeId, RequestId};
use crate::error::{DecodeError, ProtocolError};
use serde_json::{json, Value};

/// Codec for JSON-array text frames
#[derive(Debug, Clone, Default)]
pub struct TextCodec {
    config: CodecConfig,
}

/// Number of array elements for a kind
fn arity(kind: MessageKind) -> usize {
    match kind {
        MessageKind::Request | MessageKind::Notification => 7,
        MessageKind::Response | MessageKind::Announcement => 6,
        MessageKind::RequestError | MessageKind::ResponseError => 8,
    }
}

impl TextCodec {
    /// Create a codec with the given limits
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    fn encode_payload(&self, payload: &Payload) -> Result<Value, ProtocolError> {
        let size = payload.size();
        if size > self.config.max_payload_size {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: self.config.max_payload_size,
            });
        }

        match payload {
            Payload::Structured(value) => {
                if is_raw_marker(value) {
                    return Err(ProtocolError::InvalidFieldValue {
                        field: "payload".to_string(),
                        reason: format!(
                            "structured payload collides with the {} marker",
                            RAW_PAYLOAD_KEY
                        ),
                    });
                }
                Ok(value.clone())
            },
            Payload::Raw(bytes) => Ok(json!({ RAW_PAYLOAD_KEY: hex::encode(bytes) })),
        }
    }

    fn decode_payload(&self, value: Value, id: RequestId) -> Result<Payload, DecodeError> {
        let payload = match raw_marker_hex(&value) {
            Some(hex_str) => {
                let bytes = hex::decode(hex_str).map_err(|e| DecodeError::InvalidField {
                    field: "payload".to_string(),
                    reason: format!("raw payload is not valid hex: {}", e),
                    request_id: Some(id),
                })?;
                Payload::Raw(bytes)
            },
            None => Payload::Structured(value),
        };

        let size = payload.size();
        if size > self.config.max_payload_size {
            return Err(DecodeError::PayloadTooLarge {
                size,
                max: self.config.max_payload_size,
                request_id: Some(id),
            });
        }
        Ok(payload)
    }
}

fn is_raw_marker(value: &Value) -> bool {
    raw_marker_hex(value).is_some()
}

fn raw_marker_hex(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get(RAW_PAYLOAD_KEY)?.as_str()
}

fn encode_destination(destination: &Destination) -> Value {
    match destination {
        Destination::Node(id) => Value::String(id.to_string()),
        Destination::SourceRoute(hops) => {
            Value::Array(hops.iter().map(|hop| Value::String(hop.to_string())).collect())
        },
    }
}

fn encode_path(path: &NetworkPath) -> Value {
    Value::Array(path.iter().map(|hop| Value::String(hop.to_string())).collect())
}

fn encode_signatures(signatures: &[SignatureEntry]) -> Result<Value, ProtocolError> {
    serde_json::to_value(signatures).map_err(|e| ProtocolError::SerializationFailed {
        kind: "signatures".to_string(),
        reason: e.to_string(),
    })
}

fn invalid(field: &str, reason: impl Into<String>, id: Option<RequestId>) -> DecodeError {
    DecodeError::InvalidField {
        field: field.to_string(),
        reason: reason.into(),
        request_id: id,
    }
}

fn node_id(value: &Value, field: &str, id: RequestId) -> Result<NodeId, DecodeError> {
    let s = value
        .as_str()
        .ok_or_else(|| invalid(field, "expected a node id string", Some(id)))?;
    NodeId::new(s).map_err(|e| invalid(field, e.to_string(), Some(id)))
}

fn decode_destination(value: &Value, id: RequestId) -> Result<Destination, DecodeError> {
    match value {
        Value::String(_) => Ok(Destination::Node(node_id(value, "destination", id)?)),
        Value::Array(hops) if !hops.is_empty() => hops
            .iter()
            .map(|hop| node_id(hop, "destination", id))
            .collect::<Result<Vec<_>, _>>()
            .map(Destination::SourceRoute),
        _ => Err(invalid(
            "destination",
            "expected a node id or a non-empty array of node ids",
            Some(id),
        )),
    }
}

fn decode_path(value: &Value, id: RequestId) -> Result<NetworkPath, DecodeError> {
    let hops = value
        .as_array()
        .ok_or_else(|| invalid("path", "expected an array of node ids", Some(id)))?;
    if hops.is_empty() {
        return Err(invalid("path", "path must name the originator", Some(id)));
    }
    hops.iter()
        .map(|hop| node_id(hop, "path", id))
        .collect::<Result<NetworkPath, _>>()
}

fn decode_action(value: &Value, id: RequestId) -> Result<ActionKind, DecodeError> {
    match value.as_str() {
        Some(name) if !name.is_empty() => Ok(ActionKind::new(name)),
        _ => Err(invalid("action", "expected a non-empty string", Some(id))),
    }
}

fn decode_signatures(value: Value, id: RequestId) -> Result<Vec<SignatureEntry>, DecodeError> {
    serde_json::from_value(value).map_err(|e| invalid("signatures", e.to_string(), Some(id)))
}

fn decode_error_details(
    code: &Value,
    description: &Value,
    details: Value,
    id: RequestId,
) -> Result<ErrorDetails, DecodeError> {
    let code: ErrorCode = code
        .as_str()
        .ok_or_else(|| invalid("code", "expected a string", Some(id)))?
        .parse()
        .map_err(|e: String| invalid("code", e, Some(id)))?;
    let description = description
        .as_str()
        .ok_or_else(|| invalid("description", "expected a string", Some(id)))?;
    Ok(ErrorDetails {
        code,
        description: description.to_string(),
        details,
    })
}

/// Read the id before anything else so later failures can name it
fn peek_request_id(fields: &[Value]) -> Option<RequestId> {
    match fields.get(1)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().map(RequestId::new),
        _ => None,
    }
}

impl EnvelopeCodec for TextCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Text
    }

    fn encode(&self, envelope: &Envelope) -> Result<Frame, ProtocolError> {
        let kind = envelope.kind();
        let mut fields = vec![
            json!(kind.tag()),
            Value::String(envelope.id.to_string()),
            encode_destination(&envelope.destination),
            encode_path(&envelope.path),
        ];

        match &envelope.body {
            EnvelopeBody::Request { action, payload }
            | EnvelopeBody::Notification { action, payload } => {
                fields.push(Value::String(action.to_string()));
                fields.push(self.encode_payload(payload)?);
            },
            EnvelopeBody::Response { payload } => {
                fields.push(self.encode_payload(payload)?);
            },
            EnvelopeBody::Announcement(announcement) => {
                let value = serde_json::to_value(announcement).map_err(|e| {
                    ProtocolError::SerializationFailed {
                        kind: kind.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                fields.push(value);
            },
            EnvelopeBody::RequestError(details) | EnvelopeBody::ResponseError(details) => {
                fields.push(Value::String(details.code.as_str().to_string()));
                fields.push(Value::String(details.description.clone()));
                fields.push(details.details.clone());
            },
        }

        fields.push(encode_signatures(&envelope.signatures)?);

        serde_json::to_string(&Value::Array(fields))
            .map(Frame::Text)
            .map_err(|e| ProtocolError::SerializationFailed {
                kind: kind.to_string(),
                reason: e.to_string(),
            })
    }

    fn decode(&self, frame: &Frame) -> Result<Envelope, DecodeError> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => {
                return Err(DecodeError::MalformedFrame {
                    reason: "binary frame handed to the text codec".to_string(),
                })
            },
        };

        let max_frame = self.config.max_frame_size();
        if text.len() > max_frame {
            return Err(DecodeError::MalformedFrame {
                reason: format!("frame of {} bytes exceeds {} bytes", text.len(), max_frame),
            });
        }

        let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::MalformedFrame {
            reason: e.to_string(),
        })?;
        let mut fields = match value {
            Value::Array(fields) if !fields.is_empty() => fields,
            _ => {
                return Err(DecodeError::MalformedFrame {
                    reason: "expected a non-empty JSON array".to_string(),
                })
            },
        };

        let request_id = peek_request_id(&fields);
        let tag = fields[0]
            .as_i64()
            .ok_or_else(|| invalid("kind", "expected an integer tag", request_id))?;
        let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownKind { tag, request_id })?;

        let expected = arity(kind);
        if fields.len() != expected {
            return Err(DecodeError::ArityMismatch {
                tag,
                expected,
                actual: fields.len(),
                request_id,
            });
        }

        let id = request_id.ok_or_else(|| invalid("id", "expected a decimal id string", None))?;
        let destination = decode_destination(&fields[2], id)?;
        let path = decode_path(&fields[3], id)?;

        // Fields are consumed from the back so values can be moved out.
        let signatures = decode_signatures(fields.pop().unwrap_or(Value::Null), id)?;

        let body = match kind {
            MessageKind::Request | MessageKind::Notification => {
                let payload = self.decode_payload(fields.pop().unwrap_or(Value::Null), id)?;
                let action = decode_action(&fields[4], id)?;
                if kind == MessageKind::Request {
                    EnvelopeBody::Request { action, payload }
                } else {
                    EnvelopeBody::Notification { action, payload }
                }
            },
            MessageKind::Response => EnvelopeBody::Response {
                payload: self.decode_payload(fields.pop().unwrap_or(Value::Null), id)?,
            },
            MessageKind::Announcement => {
                let value = fields.pop().unwrap_or(Value::Null);
                let announcement: TopologyAnnouncement = serde_json::from_value(value)
                    .map_err(|e| invalid("payload", e.to_string(), Some(id)))?;
                EnvelopeBody::Announcement(announcement)
            },
            MessageKind::RequestError | MessageKind::ResponseError => {
                let details = fields.pop().unwrap_or(Value::Null);
                let details = decode_error_details(&fields[4], &fields[5], details, id)?;
                if kind == MessageKind::RequestError {
                    EnvelopeBody::RequestError(details)
                } else {
                    EnvelopeBody::ResponseError(details)
                }
            },
        };

        Ok(Envelope {
            id,
            destination,
            path,
            body,
            signatures,
        })
    }
}
