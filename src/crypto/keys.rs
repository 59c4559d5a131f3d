//! Signing identities and public keys

use crate::error::SignatureError;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An Ed25519 signing identity
///
/// Holds secret key material and wipes it on drop. Must be kept secure.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_keypair: SigningKey,
}

impl Identity {
    /// Generate a new random identity
    ///
    /// Uses the system's cryptographically secure random number generator.
    ///
    /// # Example
    ///
    /// ```
    /// use chargemesh::crypto::Identity;
    ///
    /// let identity = Identity::generate();
    /// let public_key = identity.public_key();
    /// ```
    pub fn generate() -> Self {
        Self {
            signing_keypair: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic identity from a 32-byte seed
    ///
    /// Useful for tests and for keys provisioned out of band.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_keypair: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a hex-encoded 32-byte secret
    pub fn from_hex(secret: &str) -> Result<Self, SignatureError> {
        let mut bytes = hex::decode(secret).map_err(|e| SignatureError::InvalidKey {
            reason: e.to_string(),
        })?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| SignatureError::InvalidKey {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
        bytes.zeroize();
        Ok(Self::from_seed(&seed))
    }

    /// Extract the public key portion that can be safely shared
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_keypair.verifying_key())
    }

    pub(crate) fn signing_keypair(&self) -> &SigningKey {
        &self.signing_keypair
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// An Ed25519 verifying key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse 32 raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| SignatureError::InvalidKey {
                reason: e.to_string(),
            })
    }

    /// Parse a hex-encoded key
    pub fn from_hex(key: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(key).map_err(|e| SignatureError::InvalidKey {
            reason: e.to_string(),
        })?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| SignatureError::InvalidKey {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Raw key bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Hex-encoded key
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Short Blake3 fingerprint, handy as a default key id
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.to_bytes());
        hex::encode(&hash.as_bytes()[..8])
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_identity_is_deterministic() {
        let a = Identity::from_seed(&[7u8; 32]);
        let b = Identity::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), Identity::generate().public_key());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = Identity::generate().public_key();
        assert_eq!(PublicKey::from_hex(&key.to_hex()).unwrap(), key);
        assert_eq!(key.fingerprint().len(), 16);
    }

    #[test]
    fn test_invalid_key_material() {
        assert!(Identity::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }
}
