//! Digital signature operations using Ed25519
//!
//! Envelopes are signed over the Blake3 digest of their canonical content:
//! kind, id, action, destination and payload or error body. The path is
//! left out because relays extend it.

use super::keys::{Identity, PublicKey};
use crate::error::SignatureError;
use crate::protocol::{
    Destination, Envelope, EnvelopeBody, Payload, SignatureEntry, RAW_PAYLOAD_KEY,
};
use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier};
use serde_json::{json, Value};

/// Algorithm name carried in [`SignatureEntry::algorithm`]
pub const ED25519: &str = "ed25519";

/// A digital signature (64 bytes)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Ed25519Signature);

impl Signature {
    /// Convert signature to bytes
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }

    /// Create signature from bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        Ed25519Signature::from_slice(bytes)
            .map(Signature)
            .map_err(|e| SignatureError::Invalid {
                reason: e.to_string(),
            })
    }
}

/// Sign a message with an identity's signing key
pub fn sign_message(identity: &Identity, message: &[u8]) -> Signature {
    Signature(identity.signing_keypair().sign(message))
}

/// Verify a signature on a message
///
/// Returns `true` if the signature is valid, `false` otherwise.
pub fn verify_signature(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    public_key
        .verifying_key()
        .verify(message, &signature.0)
        .is_ok()
}

fn payload_value(payload: &Payload) -> Value {
    match payload {
        Payload::Structured(value) => value.clone(),
        Payload::Raw(bytes) => json!({ RAW_PAYLOAD_KEY: hex::encode(bytes) }),
    }
}

/// Blake3 digest of the signed content of an envelope
///
/// `serde_json` maps are ordered by key, so the JSON text is canonical.
pub fn canonical_digest(envelope: &Envelope) -> [u8; 32] {
    let destination = match &envelope.destination {
        Destination::Node(node) => json!(node.as_str()),
        Destination::SourceRoute(hops) => {
            json!(hops.iter().map(|h| h.as_str()).collect::<Vec<_>>())
        },
    };

    let body = match &envelope.body {
        EnvelopeBody::Request { action, payload }
        | EnvelopeBody::Notification { action, payload } => {
            json!({ "action": action.as_str(), "payload": payload_value(payload) })
        },
        EnvelopeBody::Response { payload } => json!({ "payload": payload_value(payload) }),
        EnvelopeBody::RequestError(details) | EnvelopeBody::ResponseError(details) => json!({
            "code": details.code.as_str(),
            "description": details.description,
            "details": details.details,
        }),
        EnvelopeBody::Announcement(announcement) => {
            json!({ "announcement": serde_json::to_value(announcement).unwrap_or(Value::Null) })
        },
    };

    let canonical = json!({
        "kind": envelope.kind().tag(),
        "id": envelope.id.to_string(),
        "destination": destination,
        "body": body,
    });

    *blake3::hash(canonical.to_string().as_bytes()).as_bytes()
}

/// Produce a signature entry for an envelope
pub fn sign_envelope(identity: &Identity, key_id: &str, envelope: &Envelope) -> SignatureEntry {
    let digest = canonical_digest(envelope);
    SignatureEntry {
        key_id: key_id.to_string(),
        algorithm: ED25519.to_string(),
        value: sign_message(identity, &digest).to_bytes().to_vec(),
    }
}

/// Check one signature entry against an envelope
pub fn verify_entry(
    public_key: &PublicKey,
    entry: &SignatureEntry,
    envelope: &Envelope,
) -> Result<(), SignatureError> {
    if entry.algorithm != ED25519 {
        return Err(SignatureError::Invalid {
            reason: format!("unsupported algorithm {}", entry.algorithm),
        });
    }

    let signature = Signature::from_slice(&entry.value)?;
    if verify_signature(public_key, &canonical_digest(envelope), &signature) {
        Ok(())
    } else {
        Err(SignatureError::Invalid {
            reason: format!("signature by {} does not match", entry.key_id),
        })
    }
}
