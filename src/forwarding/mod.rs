//! Relay admission control
//!
//! Every request or notification a node is asked to pass on goes through
//! [`ForwardingEngine::decide`], which answers admit, drop, or reject with a
//! synthesized reply. Per-action behaviour lives in the [`ActionRegistry`].

mod decision;
mod engine;
mod registry;

pub use decision::{DefaultPolicy, DropReason, ForwardingContext, ForwardingDecision};
pub use engine::{DecisionHook, ForwardingEngine, HookHandle};
pub use registry::{
    ActionEntry, ActionRegistry, ForwardingFilter, PayloadValidator, ResponseSynthesizer,
};
