//! Per-action signature policy
//!
//! Rules are checked in order and the first one whose pattern matches the
//! envelope's action wins; a default rule covers everything else, including
//! replies, which carry no action.

use super::keys::{Identity, PublicKey};
use super::signing::{sign_envelope, verify_entry};
use crate::error::SignatureError;
use crate::protocol::{ActionKind, Envelope};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Identifier of a signing or verifying key
pub type KeyId = String;

/// Which actions a rule applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPattern {
    /// Every envelope
    Any,
    /// One action
    Exact(ActionKind),
    /// Actions starting with a prefix
    Prefix(String),
}

impl ActionPattern {
    /// Whether the pattern covers an envelope with this action
    pub fn matches(&self, action: Option<&ActionKind>) -> bool {
        match (self, action) {
            (Self::Any, _) => true,
            (Self::Exact(expected), Some(action)) => expected == action,
            (Self::Prefix(prefix), Some(action)) => action.as_str().starts_with(prefix.as_str()),
            _ => false,
        }
    }
}

/// Which key signs outbound envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    /// Do not sign
    None,
    /// The node's own key
    Local,
    /// A named key from the keyring
    Named(KeyId),
}

/// One policy rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRule {
    /// Actions covered
    pub pattern: ActionPattern,
    /// Inbound envelopes must carry a valid trusted signature
    pub required: bool,
    /// Key used for outbound envelopes
    pub key: KeySelector,
}

impl SignatureRule {
    /// Rule that neither signs nor requires signatures
    pub fn unsigned(pattern: ActionPattern) -> Self {
        Self {
            pattern,
            required: false,
            key: KeySelector::None,
        }
    }

    /// Rule that signs with the local key and requires signatures
    pub fn signed(pattern: ActionPattern) -> Self {
        Self {
            pattern,
            required: true,
            key: KeySelector::Local,
        }
    }
}

/// Result of checking an inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Acceptable
    Ok,
    /// Must be rejected
    Invalid(String),
}

impl Verification {
    /// Whether the envelope is acceptable
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Signing identities and trusted keys
#[derive(Default)]
pub struct Keyring {
    local: Option<KeyId>,
    signers: HashMap<KeyId, Arc<Identity>>,
    trusted: HashMap<KeyId, PublicKey>,
}

impl Keyring {
    /// Empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the node's own key; it is trusted for verification too
    pub fn set_local(&mut self, key_id: impl Into<KeyId>, identity: Identity) {
        let key_id = key_id.into();
        self.trusted.insert(key_id.clone(), identity.public_key());
        self.signers.insert(key_id.clone(), Arc::new(identity));
        self.local = Some(key_id);
    }

    /// Add an extra signing identity
    pub fn add_signer(&mut self, key_id: impl Into<KeyId>, identity: Identity) {
        let key_id = key_id.into();
        self.trusted.insert(key_id.clone(), identity.public_key());
        self.signers.insert(key_id, Arc::new(identity));
    }

    /// Trust a peer's verifying key
    pub fn trust(&mut self, key_id: impl Into<KeyId>, key: PublicKey) {
        self.trusted.insert(key_id.into(), key);
    }

    /// Stop trusting a key
    pub fn revoke(&mut self, key_id: &str) -> bool {
        self.trusted.remove(key_id).is_some()
    }

    /// Id of the local key
    pub fn local_key_id(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// Trusted key by id
    pub fn trusted(&self, key_id: &str) -> Option<&PublicKey> {
        self.trusted.get(key_id)
    }

    fn signer(
        &self,
        selector: &KeySelector,
    ) -> Result<Option<(KeyId, Arc<Identity>)>, SignatureError> {
        let key_id = match selector {
            KeySelector::None => return Ok(None),
            KeySelector::Local => {
                self.local.clone().ok_or_else(|| SignatureError::UnknownSigningKey {
                    key_id: "<local>".to_string(),
                })?
            },
            KeySelector::Named(key_id) => key_id.clone(),
        };

        let identity = self
            .signers
            .get(&key_id)
            .cloned()
            .ok_or_else(|| SignatureError::UnknownSigningKey {
                key_id: key_id.clone(),
            })?;
        Ok(Some((key_id, identity)))
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("local", &self.local)
            .field("signers", &self.signers.len())
            .field("trusted", &self.trusted.len())
            .finish()
    }
}

/// Ordered signing/verification rules plus the keys they use
#[derive(Debug)]
pub struct SignaturePolicy {
    rules: RwLock<Vec<SignatureRule>>,
    default_rule: RwLock<SignatureRule>,
    keyring: RwLock<Keyring>,
}

impl SignaturePolicy {
    /// A policy whose default rule neither signs nor requires signatures
    pub fn new() -> Self {
        Self::with_default(SignatureRule::unsigned(ActionPattern::Any))
    }

    /// A policy with an explicit default rule
    pub fn with_default(default_rule: SignatureRule) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_rule: RwLock::new(default_rule),
            keyring: RwLock::new(Keyring::new()),
        }
    }

    /// Append a rule; earlier rules take precedence
    pub fn add_rule(&self, rule: SignatureRule) {
        self.rules.write().push(rule);
    }

    /// Replace the default rule
    pub fn set_default_rule(&self, rule: SignatureRule) {
        *self.default_rule.write() = rule;
    }

    /// Mutate the keyring
    pub fn keyring_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Keyring> {
        self.keyring.write()
    }

    /// The rule governing an action
    pub fn rule_for(&self, action: Option<&ActionKind>) -> SignatureRule {
        self.rules
            .read()
            .iter()
            .find(|rule| rule.pattern.matches(action))
            .cloned()
            .unwrap_or_else(|| self.default_rule.read().clone())
    }

    /// Sign an outbound envelope as the governing rule demands
    pub fn apply(&self, mut envelope: Envelope) -> Result<Envelope, SignatureError> {
        let rule = self.rule_for(envelope.action());
        if let Some((key_id, identity)) = self.keyring.read().signer(&rule.key)? {
            let entry = sign_envelope(&identity, &key_id, &envelope);
            envelope.signatures.push(entry);
        }
        Ok(envelope)
    }

    /// Check an inbound envelope
    ///
    /// Any present signature from a trusted key must verify. If the governing
    /// rule is `required`, at least one such signature must be present.
    pub fn verify(&self, envelope: &Envelope) -> Verification {
        let rule = self.rule_for(envelope.action());
        let keyring = self.keyring.read();
        let mut verified = 0;

        for entry in &envelope.signatures {
            let Some(key) = keyring.trusted(&entry.key_id) else {
                debug!(key_id = %entry.key_id, "Ignoring signature from untrusted key");
                continue;
            };
            if let Err(e) = verify_entry(key, entry, envelope) {
                return Verification::Invalid(e.to_string());
            }
            verified += 1;
        }

        if rule.required && verified == 0 {
            return Verification::Invalid("missing required signature".to_string());
        }
        Verification::Ok
    }
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{NodeId, RequestId};
    use crate::protocol::Payload;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn request(action: &str) -> Envelope {
        Envelope::request(RequestId::new(3), node("CS-1"), node("CSMS"), action, Payload::empty())
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = SignaturePolicy::new();
        policy.add_rule(SignatureRule::signed(ActionPattern::Exact("Reset".into())));
        policy.add_rule(SignatureRule::unsigned(ActionPattern::Prefix("Re".to_string())));

        assert!(policy.rule_for(Some(&"Reset".into())).required);
        assert!(!policy.rule_for(Some(&"RemoteStart".into())).required);
        assert_eq!(policy.rule_for(None).pattern, ActionPattern::Any);
    }

    #[test]
    fn test_apply_signs_with_local_key() {
        let sender = SignaturePolicy::with_default(SignatureRule::signed(ActionPattern::Any));
        let identity = Identity::from_seed(&[1u8; 32]);
        let public = identity.public_key();
        sender.keyring_mut().set_local("cs-1", identity);

        let signed = sender.apply(request("Reset")).unwrap();
        assert_eq!(signed.signatures.len(), 1);
        assert_eq!(signed.signatures[0].key_id, "cs-1");

        let receiver = SignaturePolicy::with_default(SignatureRule::signed(ActionPattern::Any));
        assert!(!receiver.verify(&signed).is_ok());

        receiver.keyring_mut().trust("cs-1", public);
        assert!(receiver.verify(&signed).is_ok());
    }

    #[test]
    fn test_required_signature_missing() {
        let policy = SignaturePolicy::new();
        policy.add_rule(SignatureRule::signed(ActionPattern::Exact("Reset".into())));

        assert_eq!(
            policy.verify(&request("Reset")),
            Verification::Invalid("missing required signature".to_string())
        );
        assert!(policy.verify(&request("Heartbeat")).is_ok());
    }

    #[test]
    fn test_tampered_signature_is_invalid_even_when_optional() {
        let policy = SignaturePolicy::new();
        policy
            .keyring_mut()
            .add_signer("ops", Identity::from_seed(&[2u8; 32]));
        policy.add_rule(SignatureRule {
            pattern: ActionPattern::Any,
            required: false,
            key: KeySelector::Named("ops".to_string()),
        });

        let mut signed = policy.apply(request("Heartbeat")).unwrap();
        signed.signatures[0].value[0] ^= 0xff;
        assert!(!policy.verify(&signed).is_ok());
    }

    #[test]
    fn test_unknown_signing_key() {
        let policy = SignaturePolicy::with_default(SignatureRule {
            pattern: ActionPattern::Any,
            required: false,
            key: KeySelector::Named("missing".to_string()),
        });
        assert_eq!(
            policy.apply(request("Heartbeat")).unwrap_err(),
            SignatureError::UnknownSigningKey {
                key_id: "missing".to_string()
            }
        );
    }
}
