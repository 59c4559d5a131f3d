//! Cryptography module
//!
//! This module provides the cryptographic layer for chargemesh:
//! - Ed25519 envelope signatures over a Blake3 digest
//! - Ordered per-action signature policy with a keyring
//! - ChaCha20-Poly1305 payload sealing with pre-shared keys
//!
//! All implementations use audited crates from the RustCrypto and dalek projects.

pub mod keys;
pub mod policy;
pub mod secure_channel;
pub mod signing;

// Re-export main types
pub use keys::{Identity, PublicKey};
pub use policy::{
    ActionPattern, KeyId, KeySelector, Keyring, SignaturePolicy, SignatureRule, Verification,
};
pub use secure_channel::{
    decrypt, encrypt, ChannelKey, KeyProvider, MemoryKeyProvider, SealedPayload, SecureChannel,
};
pub use signing::{
    canonical_digest, sign_envelope, sign_message, verify_entry, verify_signature, Signature,
};
