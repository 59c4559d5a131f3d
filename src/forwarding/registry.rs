//! Per-action handlers consulted by the forwarding pipeline

use super::decision::{ForwardingContext, ForwardingDecision};
use crate::addressing::NodeId;
use crate::error::Result;
use crate::protocol::{ActionKind, Envelope, ErrorDetails, Payload};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Decides on a message for one action
pub type ForwardingFilter =
    Arc<dyn Fn(&Envelope, &ForwardingContext) -> Result<ForwardingDecision> + Send + Sync>;

/// Checks a payload before filters run; the error text becomes the reply description
pub type PayloadValidator = Arc<dyn Fn(&Payload) -> std::result::Result<(), String> + Send + Sync>;

/// Builds the reply for a refused request: `(request, responder, error)`
pub type ResponseSynthesizer =
    Arc<dyn Fn(&Envelope, &NodeId, ErrorDetails) -> Envelope + Send + Sync>;

/// Handlers registered for one action
#[derive(Clone, Default)]
pub struct ActionEntry {
    /// Admission filter
    pub filter: Option<ForwardingFilter>,
    /// Payload validator
    pub validator: Option<PayloadValidator>,
    /// Reply builder for rejections
    pub synthesizer: Option<ResponseSynthesizer>,
}

impl ActionEntry {
    /// Entry with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Envelope, &ForwardingContext) -> Result<ForwardingDecision> + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Set the validator
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Payload) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Set the synthesizer
    pub fn with_synthesizer<F>(mut self, synthesizer: F) -> Self
    where
        F: Fn(&Envelope, &NodeId, ErrorDetails) -> Envelope + Send + Sync + 'static,
    {
        self.synthesizer = Some(Arc::new(synthesizer));
        self
    }

    /// Build the reply for a refused request
    pub fn synthesize(
        &self,
        request: &Envelope,
        responder: &NodeId,
        error: ErrorDetails,
    ) -> Envelope {
        match &self.synthesizer {
            Some(synthesizer) => synthesizer(request, responder, error),
            None => Envelope::error_for(request, responder.clone(), error),
        }
    }
}

impl fmt::Debug for ActionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionEntry")
            .field("filter", &self.filter.is_some())
            .field("validator", &self.validator.is_some())
            .field("synthesizer", &self.synthesizer.is_some())
            .finish()
    }
}

/// Maps action names to their handlers, with an explicit default entry
#[derive(Default)]
pub struct ActionRegistry {
    entries: RwLock<HashMap<ActionKind, ActionEntry>>,
    default_entry: RwLock<ActionEntry>,
}

impl ActionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole entry for an action
    pub fn register(&self, action: impl Into<ActionKind>, entry: ActionEntry) {
        self.entries.write().insert(action.into(), entry);
    }

    /// Set only the filter for an action
    pub fn register_filter<F>(&self, action: impl Into<ActionKind>, filter: F)
    where
        F: Fn(&Envelope, &ForwardingContext) -> Result<ForwardingDecision> + Send + Sync + 'static,
    {
        self.set_filter(action, Arc::new(filter));
    }

    /// Set the filter for an action, keeping its validator and synthesizer
    pub fn set_filter(&self, action: impl Into<ActionKind>, filter: ForwardingFilter) {
        self.entries.write().entry(action.into()).or_default().filter = Some(filter);
    }

    /// Set only the validator for an action
    pub fn register_validator<F>(&self, action: impl Into<ActionKind>, validator: F)
    where
        F: Fn(&Payload) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        entries.entry(action.into()).or_default().validator = Some(Arc::new(validator));
    }

    /// Set only the synthesizer for an action
    pub fn register_synthesizer<F>(&self, action: impl Into<ActionKind>, synthesizer: F)
    where
        F: Fn(&Envelope, &NodeId, ErrorDetails) -> Envelope + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        entries.entry(action.into()).or_default().synthesizer = Some(Arc::new(synthesizer));
    }

    /// Replace the entry used for unregistered actions
    pub fn set_default(&self, entry: ActionEntry) {
        *self.default_entry.write() = entry;
    }

    /// Remove an action's entry
    pub fn unregister(&self, action: &ActionKind) -> bool {
        self.entries.write().remove(action).is_some()
    }

    /// Whether an action has its own entry
    pub fn contains(&self, action: &ActionKind) -> bool {
        self.entries.read().contains_key(action)
    }

    /// The entry for an action, or the default entry
    pub fn entry_for(&self, action: Option<&ActionKind>) -> ActionEntry {
        action
            .and_then(|action| self.entries.read().get(action).cloned())
            .unwrap_or_else(|| self.default_entry.read().clone())
    }

    /// Number of registered actions
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no action is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut actions: Vec<String> = self.entries.read().keys().map(|a| a.to_string()).collect();
        actions.sort();
        f.debug_struct("ActionRegistry").field("actions", &actions).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::RequestId;
    use crate::protocol::ErrorCode;

    #[test]
    fn test_lookup_falls_back_to_default_entry() {
        let registry = ActionRegistry::new();
        registry.register_validator("Authorize", |_| Ok(()));
        registry
            .set_default(ActionEntry::new().with_filter(|_, _| Ok(ForwardingDecision::admit())));

        let authorize = registry.entry_for(Some(&"Authorize".into()));
        assert!(authorize.validator.is_some());
        assert!(authorize.filter.is_none());

        let other = registry.entry_for(Some(&"Heartbeat".into()));
        assert!(other.filter.is_some());
        assert!(registry.entry_for(None).filter.is_some());
    }

    #[test]
    fn test_partial_registration_merges() {
        let registry = ActionRegistry::new();
        registry.register_filter("Reset", |_, _| Ok(ForwardingDecision::admit()));
        registry.register_synthesizer("Reset", |request, responder, error| {
            Envelope::error_for(request, responder.clone(), error)
        });

        let entry = registry.entry_for(Some(&"Reset".into()));
        assert!(entry.filter.is_some());
        assert!(entry.synthesizer.is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&"Reset".into()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_filter_keeps_other_handlers() {
        let registry = Arc::new(ActionRegistry::new());
        registry.register_validator("Reset", |_| Ok(()));

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        let filter: ForwardingFilter = Arc::new(
                            |_: &Envelope, _: &ForwardingContext| Ok(ForwardingDecision::admit()),
                        );
                        registry.set_filter("Reset", filter);
                    } else {
                        registry.register_synthesizer("Reset", |request, responder, error| {
                            Envelope::error_for(request, responder.clone(), error)
                        });
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let entry = registry.entry_for(Some(&"Reset".into()));
        assert!(entry.validator.is_some());
        assert!(entry.filter.is_some());
        assert!(entry.synthesizer.is_some());
    }

    #[test]
    fn test_default_synthesis() {
        let cs = NodeId::new("CS-1").unwrap();
        let hub = NodeId::new("HUB-1").unwrap();
        let request = Envelope::request(
            RequestId::new(4),
            cs.clone(),
            NodeId::controller(),
            "Foo",
            Payload::empty(),
        );

        let error = ErrorDetails::new(ErrorCode::NotSupported, "no");
        let reply = ActionEntry::new().synthesize(&request, &hub, error);
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.error().unwrap().code, ErrorCode::NotSupported);
        assert_eq!(reply.originator(), Some(&hub));
    }
}
