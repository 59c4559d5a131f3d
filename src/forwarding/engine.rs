//! The admission pipeline run for every message a relay is asked to forward

use super::decision::{DefaultPolicy, DropReason, ForwardingContext, ForwardingDecision};
use super::registry::{ActionEntry, ActionRegistry};
use crate::addressing::{NodeId, MAX_PATH_LEN};
use crate::error::{panic_message, root_cause, ForwardingError};
use crate::protocol::{Envelope, ErrorCode, ErrorDetails, MessageKind};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Callback invoked with every decision before it is executed
pub type DecisionHook =
    Arc<dyn Fn(&Envelope, &ForwardingContext, &ForwardingDecision) + Send + Sync>;

/// Handle for removing a decision hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

/// Admit/drop/reject pipeline for relayed traffic
///
/// Stages run in a fixed order and the first one that decides wins:
/// loop protection, path length, deny-list, allow-list, payload validator,
/// per-action filter, default policy.
pub struct ForwardingEngine {
    registry: ActionRegistry,
    default_policy: RwLock<DefaultPolicy>,
    deny: RwLock<HashSet<NodeId>>,
    allow: RwLock<HashSet<NodeId>>,
    max_path_len: usize,
    hooks: RwLock<Vec<(HookHandle, DecisionHook)>>,
    next_hook: AtomicU64,
}

impl ForwardingEngine {
    /// Engine with the given default policy and the decision log hook installed
    pub fn new(default_policy: DefaultPolicy) -> Self {
        let engine = Self {
            registry: ActionRegistry::new(),
            default_policy: RwLock::new(default_policy),
            deny: RwLock::new(HashSet::new()),
            allow: RwLock::new(HashSet::new()),
            max_path_len: MAX_PATH_LEN,
            hooks: RwLock::new(Vec::new()),
            next_hook: AtomicU64::new(0),
        };
        engine.add_hook(log_decision);
        engine
    }

    /// Override the hop limit
    pub fn with_max_path_len(mut self, max_path_len: usize) -> Self {
        self.max_path_len = max_path_len;
        self
    }

    /// Per-action handlers
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Current default policy
    pub fn default_policy(&self) -> DefaultPolicy {
        *self.default_policy.read()
    }

    /// Change the default policy
    pub fn set_default_policy(&self, policy: DefaultPolicy) {
        *self.default_policy.write() = policy;
    }

    /// Never forward to `destination`
    pub fn deny(&self, destination: NodeId) {
        self.deny.write().insert(destination);
    }

    /// Lift a deny entry
    pub fn remove_deny(&self, destination: &NodeId) -> bool {
        self.deny.write().remove(destination)
    }

    /// Add to the allow-list; once non-empty only listed destinations pass
    pub fn allow(&self, destination: NodeId) {
        self.allow.write().insert(destination);
    }

    /// Remove from the allow-list
    pub fn remove_allow(&self, destination: &NodeId) -> bool {
        self.allow.write().remove(destination)
    }

    /// Append a decision hook; hooks run in registration order
    pub fn add_hook<F>(&self, hook: F) -> HookHandle
    where
        F: Fn(&Envelope, &ForwardingContext, &ForwardingDecision) + Send + Sync + 'static,
    {
        let handle = HookHandle(self.next_hook.fetch_add(1, Ordering::Relaxed));
        self.hooks.write().push((handle, Arc::new(hook)));
        handle
    }

    /// Remove a decision hook
    pub fn remove_hook(&self, handle: HookHandle) {
        self.hooks.write().retain(|(h, _)| *h != handle);
    }

    /// Run the pipeline and the decision hooks
    pub fn decide(&self, envelope: &Envelope, context: &ForwardingContext) -> ForwardingDecision {
        let decision = self.evaluate(envelope, context);
        self.run_hooks(envelope, context, &decision);
        decision
    }

    fn evaluate(&self, envelope: &Envelope, context: &ForwardingContext) -> ForwardingDecision {
        if !matches!(envelope.kind(), MessageKind::Request | MessageKind::Notification) {
            return ForwardingDecision::admit();
        }

        if envelope.path.contains(&context.local) {
            return ForwardingDecision::drop(DropReason::RoutingLoop);
        }

        // no room left for the local hop
        if envelope.path.len() >= self.max_path_len {
            return ForwardingDecision::drop(DropReason::PathTooLong);
        }

        if !context.locally_addressed {
            if let Some(destination) = envelope.final_destination() {
                if self.deny.read().contains(destination) {
                    return ForwardingDecision::drop(DropReason::Denied);
                }
                let allow = self.allow.read();
                if !allow.is_empty() && !allow.contains(destination) {
                    return ForwardingDecision::drop(DropReason::NotAllowed);
                }
            }
        }

        let entry = self.registry.entry_for(envelope.action());
        let action = envelope.action().map(|a| a.to_string()).unwrap_or_default();

        if let (Some(validator), Some(payload)) = (&entry.validator, envelope.payload()) {
            if let Err(reason) = validator(payload) {
                let err = ForwardingError::InvalidPayload { action, reason };
                warn!(request_id = %envelope.id, "{}", err);
                return refuse(
                    envelope,
                    context,
                    &entry,
                    ErrorDetails::new(ErrorCode::FormatViolation, err.to_string()),
                );
            }
        }

        if let Some(filter) = &entry.filter {
            return match catch_unwind(AssertUnwindSafe(|| filter(envelope, context))) {
                Ok(Ok(decision)) => normalize(envelope, decision),
                Ok(Err(e)) => {
                    let err = ForwardingError::FilterFailed {
                        action,
                        reason: root_cause(&e).to_string(),
                    };
                    error!(request_id = %envelope.id, "{}", err);
                    refuse(
                        envelope,
                        context,
                        &entry,
                        ErrorDetails::new(ErrorCode::InternalError, err.to_string()),
                    )
                },
                Err(panic) => {
                    let err = ForwardingError::FilterFailed {
                        action,
                        reason: format!("panicked: {}", panic_message(panic.as_ref())),
                    };
                    error!(request_id = %envelope.id, "{}", err);
                    refuse(
                        envelope,
                        context,
                        &entry,
                        ErrorDetails::new(ErrorCode::InternalError, err.to_string()),
                    )
                },
            };
        }

        match self.default_policy() {
            DefaultPolicy::Admit => ForwardingDecision::admit(),
            DefaultPolicy::Drop if context.locally_addressed => ForwardingDecision::admit(),
            DefaultPolicy::Drop if envelope.kind() == MessageKind::Request => refuse(
                envelope,
                context,
                &entry,
                ErrorDetails::new(
                    ErrorCode::NotSupported,
                    format!("{} is not forwarded by {}", action, context.local),
                ),
            ),
            DefaultPolicy::Drop => ForwardingDecision::drop(DropReason::DefaultPolicy),
        }
    }

    fn run_hooks(
        &self,
        envelope: &Envelope,
        context: &ForwardingContext,
        decision: &ForwardingDecision,
    ) {
        let hooks = self.hooks.read().clone();
        for (handle, hook) in hooks {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook(envelope, context, decision)));
            if let Err(panic) = outcome {
                error!("Decision hook {:?} panicked: {}", handle, panic_message(panic.as_ref()));
            }
        }
    }
}

impl Default for ForwardingEngine {
    fn default() -> Self {
        Self::new(DefaultPolicy::default())
    }
}

impl fmt::Debug for ForwardingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("default_policy", &self.default_policy())
            .field("deny", &self.deny.read().len())
            .field("allow", &self.allow.read().len())
            .field("max_path_len", &self.max_path_len)
            .field("registry", &self.registry)
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

fn refuse(
    envelope: &Envelope,
    context: &ForwardingContext,
    entry: &ActionEntry,
    error: ErrorDetails,
) -> ForwardingDecision {
    if envelope.kind() == MessageKind::Request {
        ForwardingDecision::Reject {
            reply: entry.synthesize(envelope, &context.local, error),
        }
    } else {
        ForwardingDecision::drop(DropReason::Refused(error.code))
    }
}

/// One-way messages cannot be answered, so a filter's rejection becomes a drop
fn normalize(envelope: &Envelope, decision: ForwardingDecision) -> ForwardingDecision {
    match decision {
        ForwardingDecision::Reject { reply } if envelope.kind() != MessageKind::Request => {
            let code = reply.error().map(|e| e.code).unwrap_or(ErrorCode::ForwardingRejected);
            ForwardingDecision::drop(DropReason::Refused(code))
        },
        other => other,
    }
}

fn log_decision(envelope: &Envelope, context: &ForwardingContext, decision: &ForwardingDecision) {
    let action = envelope.action().map(|a| a.as_str()).unwrap_or("-");
    let destination = envelope
        .final_destination()
        .map(|d| d.to_string())
        .unwrap_or_default();

    match decision {
        ForwardingDecision::Admit { rewritten } => debug!(
            request_id = %envelope.id,
            action,
            destination = %destination,
            channel = %context.connection,
            rewritten = rewritten.is_some(),
            "Admitted"
        ),
        ForwardingDecision::Drop { reason } => info!(
            request_id = %envelope.id,
            action,
            destination = %destination,
            channel = %context.connection,
            "Dropped: {}",
            reason
        ),
        ForwardingDecision::Reject { reply } => info!(
            request_id = %envelope.id,
            action,
            destination = %destination,
            channel = %context.connection,
            code = reply.error().map(|e| e.code.as_str()).unwrap_or("-"),
            "Rejected"
        ),
    }
}
