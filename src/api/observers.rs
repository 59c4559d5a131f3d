//! Message lifecycle observers
//!
//! Applications hook into a node's traffic by registering callbacks per
//! lifecycle stage, optionally narrowed to one action kind. Callbacks run
//! synchronously, in registration order; a panicking callback is logged and
//! the remaining ones still run.

use crate::error::panic_message;
use crate::protocol::{ActionKind, Envelope};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point in a message's life at which observers fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverStage {
    /// A request addressed to this node arrived
    RequestReceived,
    /// This node answered a request
    ResponseSent,
    /// This node issued a request
    RequestSent,
    /// A reply to one of this node's requests arrived
    ResponseReceived,
    /// A notification addressed to this node arrived
    NotificationReceived,
}

/// Handle for removing an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

/// Type alias for observer callbacks
pub type ObserverCallback = Arc<dyn Fn(&Envelope) + Send + Sync + 'static>;

struct Registration {
    handle: ObserverHandle,
    stage: ObserverStage,
    action: Option<ActionKind>,
    callback: ObserverCallback,
}

/// Ordered observer registry
#[derive(Default)]
pub struct Observers {
    entries: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Observers {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    ///
    /// With `action` set, the callback only fires for that action kind. For
    /// replies the action is that of the request they answer.
    pub fn observe<F>(
        &self,
        stage: ObserverStage,
        action: Option<ActionKind>,
        callback: F,
    ) -> ObserverHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let handle = ObserverHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(Registration {
            handle,
            stage,
            action,
            callback: Arc::new(callback),
        });
        handle
    }

    /// Remove a callback; unknown handles are ignored
    pub fn remove(&self, handle: ObserverHandle) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.handle != handle);
        entries.len() != before
    }

    /// Run every matching callback
    pub fn notify(&self, stage: ObserverStage, action: Option<&ActionKind>, envelope: &Envelope) {
        // callbacks may register observers themselves
        let matching: Vec<(ObserverHandle, ObserverCallback)> = self
            .entries
            .read()
            .iter()
            .filter(|entry| entry.stage == stage)
            .filter(|entry| entry.action.is_none() || entry.action.as_ref() == action)
            .map(|entry| (entry.handle, Arc::clone(&entry.callback)))
            .collect();

        for (handle, callback) in matching {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(envelope);
            })) {
                tracing::error!(
                    observer = ?handle,
                    stage = ?stage,
                    request_id = %envelope.id,
                    "Observer panicked: {}",
                    panic_message(e.as_ref())
                );
            }
        }
    }

    /// Number of registered callbacks
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("count", &self.count()).finish()
    }
}
