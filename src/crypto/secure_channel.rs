//! Payload encryption between two nodes using ChaCha20-Poly1305 AEAD
//!
//! Keys are pre-shared per `(peer, key id)` and handed out by a
//! [`KeyProvider`]. Each sealed message uses the base nonce XORed with a
//! per-key counter, so a key never encrypts twice under the same nonce.
//! The first plaintext byte records whether the payload was structured or
//! raw, so it is authenticated along with the body.

use crate::addressing::NodeId;
use crate::error::CryptoError;
use crate::protocol::Payload;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload as AeadPayload},
    ChaCha20Poly1305, Key, Nonce,
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Current sealed payload layout
pub const SEALED_PAYLOAD_VERSION: u8 = 2;

const CONTENT_STRUCTURED: u8 = 1;
const CONTENT_RAW: u8 = 2;

fn effective_nonce(nonce: &[u8; 12], counter: u64) -> [u8; 12] {
    let mut effective = *nonce;
    for (byte, c) in effective[4..].iter_mut().zip(counter.to_be_bytes()) {
        *byte ^= c;
    }
    effective
}

fn associated_data(parameter: &[u8], key_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(parameter.len() + key_id.len());
    aad.extend_from_slice(parameter);
    aad.extend_from_slice(key_id.as_bytes());
    aad
}

/// Encrypt `data`, authenticating `parameter` and `key_id` alongside it
pub fn encrypt(
    parameter: &[u8],
    key_id: &str,
    key: &[u8; 32],
    nonce: &[u8; 12],
    counter: u64,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = effective_nonce(nonce, counter);
    let aad = associated_data(parameter, key_id);

    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            AeadPayload {
                msg: data,
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed {
            reason: format!("ChaCha20-Poly1305 encryption failed: {}", e),
        })
}

/// Decrypt data produced by [`encrypt`] with the same inputs
pub fn decrypt(
    parameter: &[u8],
    key_id: &str,
    key: &[u8; 32],
    nonce: &[u8; 12],
    counter: u64,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = effective_nonce(nonce, counter);
    let aad = associated_data(parameter, key_id);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            AeadPayload {
                msg: data,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed {
            reason: "ChaCha20-Poly1305 decryption failed (authentication tag mismatch)".to_string(),
        })
}

/// Key material for one direction of a channel
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey {
    /// Symmetric key
    pub key: [u8; 32],
    /// Base nonce
    pub nonce: [u8; 12],
    /// Counter to use for this message
    pub counter: u64,
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Resolves pre-shared keys and owns counter monotonicity
pub trait KeyProvider: Send + Sync {
    /// Key for sealing a message to `peer`; advances the send counter
    fn sealing_key(&self, peer: &NodeId, key_id: &str) -> Result<ChannelKey, CryptoError>;

    /// Key for opening a message from `peer` sealed with `counter`
    ///
    /// Implementations reject counters that were already seen, without
    /// recording `counter`; that waits for [`KeyProvider::commit_received`].
    fn opening_key(
        &self,
        peer: &NodeId,
        key_id: &str,
        counter: u64,
    ) -> Result<ChannelKey, CryptoError>;

    /// Record `counter` as seen once its message has been authenticated
    ///
    /// Fails if the counter was committed in the meantime.
    fn commit_received(
        &self,
        peer: &NodeId,
        key_id: &str,
        counter: u64,
    ) -> Result<(), CryptoError>;
}

struct KeySlot {
    key: [u8; 32],
    nonce: [u8; 12],
    next_send: u64,
    highest_received: Option<u64>,
}

impl Drop for KeySlot {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// In-memory [`KeyProvider`]
#[derive(Default)]
pub struct MemoryKeyProvider {
    slots: DashMap<(NodeId, String), KeySlot>,
}

impl MemoryKeyProvider {
    /// Empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a pre-shared key for a peer
    pub fn insert(&self, peer: NodeId, key_id: impl Into<String>, key: [u8; 32], nonce: [u8; 12]) {
        self.slots.insert(
            (peer, key_id.into()),
            KeySlot {
                key,
                nonce,
                next_send: 0,
                highest_received: None,
            },
        );
    }

    fn replayed(slot: &KeySlot, key_id: &str, counter: u64) -> Result<(), CryptoError> {
        if slot.highest_received.is_some_and(|highest| counter <= highest) {
            return Err(CryptoError::DecryptionFailed {
                reason: format!("replayed counter {} for key {}", counter, key_id),
            });
        }
        Ok(())
    }

    fn missing(peer: &NodeId, key_id: &str) -> CryptoError {
        CryptoError::KeyNotFound {
            peer: peer.clone(),
            key_id: key_id.to_string(),
        }
    }
}

impl KeyProvider for MemoryKeyProvider {
    fn sealing_key(&self, peer: &NodeId, key_id: &str) -> Result<ChannelKey, CryptoError> {
        let mut slot = self
            .slots
            .get_mut(&(peer.clone(), key_id.to_string()))
            .ok_or_else(|| Self::missing(peer, key_id))?;

        let counter = slot.next_send;
        slot.next_send = counter.checked_add(1).ok_or_else(|| CryptoError::EncryptionFailed {
            reason: format!("counter exhausted for key {}", key_id),
        })?;

        Ok(ChannelKey {
            key: slot.key,
            nonce: slot.nonce,
            counter,
        })
    }

    fn opening_key(
        &self,
        peer: &NodeId,
        key_id: &str,
        counter: u64,
    ) -> Result<ChannelKey, CryptoError> {
        let slot = self
            .slots
            .get(&(peer.clone(), key_id.to_string()))
            .ok_or_else(|| Self::missing(peer, key_id))?;
        Self::replayed(&slot, key_id, counter)?;

        Ok(ChannelKey {
            key: slot.key,
            nonce: slot.nonce,
            counter,
        })
    }

    fn commit_received(
        &self,
        peer: &NodeId,
        key_id: &str,
        counter: u64,
    ) -> Result<(), CryptoError> {
        let mut slot = self
            .slots
            .get_mut(&(peer.clone(), key_id.to_string()))
            .ok_or_else(|| Self::missing(peer, key_id))?;
        Self::replayed(&slot, key_id, counter)?;
        slot.highest_received = Some(counter);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyProvider")
            .field("keys", &self.slots.len())
            .finish()
    }
}

/// Encrypted payload with the metadata needed to open it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedPayload {
    /// Key id used for sealing
    pub key_id: String,
    /// Counter mixed into the nonce
    pub counter: u64,
    /// Ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl SealedPayload {
    /// Serialize to bytes
    ///
    /// Format: \[version (1)\]\[key_id_len (1)\]\[key_id\]\[counter (8, BE)\]\[ciphertext\]
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let key_id_len =
            u8::try_from(self.key_id.len()).map_err(|_| CryptoError::InvalidSealedPayload {
                context: "Key id longer than 255 bytes".to_string(),
            })?;

        let mut bytes = Vec::with_capacity(2 + self.key_id.len() + 8 + self.ciphertext.len());
        bytes.push(SEALED_PAYLOAD_VERSION);
        bytes.push(key_id_len);
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(&self.counter.to_be_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        Ok(bytes)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < 2 {
            return Err(CryptoError::InvalidSealedPayload {
                context: "Sealed payload too short".to_string(),
            });
        }
        if data[0] != SEALED_PAYLOAD_VERSION {
            return Err(CryptoError::InvalidSealedPayload {
                context: format!("Unsupported version {}", data[0]),
            });
        }

        let key_id_end = 2 + data[1] as usize;
        let counter_end = key_id_end + 8;
        if data.len() < counter_end {
            return Err(CryptoError::InvalidSealedPayload {
                context: "Incomplete header".to_string(),
            });
        }

        let key_id = std::str::from_utf8(&data[2..key_id_end])
            .map_err(|_| CryptoError::InvalidSealedPayload {
                context: "Key id is not UTF-8".to_string(),
            })?
            .to_string();

        let mut counter = [0u8; 8];
        counter.copy_from_slice(&data[key_id_end..counter_end]);

        Ok(Self {
            key_id,
            counter: u64::from_be_bytes(counter),
            ciphertext: data[counter_end..].to_vec(),
        })
    }
}

/// Seals and opens envelope payloads for a peer
#[derive(Clone)]
pub struct SecureChannel {
    provider: Arc<dyn KeyProvider>,
    parameter: Vec<u8>,
}

impl SecureChannel {
    /// Channel over a key provider; `parameter` is bound into every tag
    pub fn new(provider: Arc<dyn KeyProvider>, parameter: impl Into<Vec<u8>>) -> Self {
        Self {
            provider,
            parameter: parameter.into(),
        }
    }

    /// Encrypt a payload for `peer`
    pub fn seal(
        &self,
        peer: &NodeId,
        key_id: &str,
        payload: &Payload,
    ) -> Result<Payload, CryptoError> {
        let mut plaintext = match payload {
            Payload::Structured(value) => {
                let mut plaintext = vec![CONTENT_STRUCTURED];
                serde_json::to_writer(&mut plaintext, value).map_err(|e| {
                    CryptoError::EncryptionFailed {
                        reason: e.to_string(),
                    }
                })?;
                plaintext
            },
            Payload::Raw(bytes) => {
                let mut plaintext = Vec::with_capacity(1 + bytes.len());
                plaintext.push(CONTENT_RAW);
                plaintext.extend_from_slice(bytes);
                plaintext
            },
        };

        let channel_key = self.provider.sealing_key(peer, key_id)?;
        let ciphertext = encrypt(
            &self.parameter,
            key_id,
            &channel_key.key,
            &channel_key.nonce,
            channel_key.counter,
            &plaintext,
        );
        plaintext.zeroize();
        let ciphertext = ciphertext?;

        debug!(peer = %peer, key_id, counter = channel_key.counter, "Sealed payload");
        let sealed = SealedPayload {
            key_id: key_id.to_string(),
            counter: channel_key.counter,
            ciphertext,
        };
        Ok(Payload::Raw(sealed.to_bytes()?))
    }

    /// Decrypt a payload sealed by `peer`
    ///
    /// The payload comes back in the form it was sealed in. Its counter is
    /// only recorded as seen once the ciphertext has been authenticated.
    pub fn open(&self, peer: &NodeId, payload: &Payload) -> Result<Payload, CryptoError> {
        let Payload::Raw(bytes) = payload else {
            return Err(CryptoError::InvalidSealedPayload {
                context: "Structured payload is not sealed".to_string(),
            });
        };

        let sealed = SealedPayload::from_bytes(bytes)?;
        let channel_key = self.provider.opening_key(peer, &sealed.key_id, sealed.counter)?;
        let mut plaintext = decrypt(
            &self.parameter,
            &sealed.key_id,
            &channel_key.key,
            &channel_key.nonce,
            sealed.counter,
            &sealed.ciphertext,
        )?;
        if let Err(e) = self.provider.commit_received(peer, &sealed.key_id, sealed.counter) {
            plaintext.zeroize();
            return Err(e);
        }

        let opened = match plaintext.split_first() {
            Some((&CONTENT_STRUCTURED, body)) => serde_json::from_slice(body)
                .map(Payload::Structured)
                .map_err(|e| CryptoError::InvalidSealedPayload {
                    context: format!("Structured content is not JSON: {}", e),
                }),
            Some((&CONTENT_RAW, body)) => Ok(Payload::Raw(body.to_vec())),
            _ => Err(CryptoError::InvalidSealedPayload {
                context: "Unknown content kind".to_string(),
            }),
        };
        plaintext.zeroize();
        opened
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("parameter", &hex::encode(&self.parameter))
            .finish_non_exhaustive()
    }
}
