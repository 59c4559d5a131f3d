//! In-process transport linking two nodes
//!
//! Used by tests and simulations. Each side of a link is a
//! [`MemoryTransport`] whose `send` delivers straight into the other node's
//! connection queue.

use crate::addressing::NodeId;
use crate::api::Node;
use crate::error::{NetworkError, Result};
use crate::network::{ChannelId, ConnectionHandle, Transport};
use crate::protocol::{Frame, WireFormat};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::trace;

struct Inner {
    id: ChannelId,
    format: WireFormat,
    remote: OnceLock<ConnectionHandle>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    frames_sent: AtomicU64,
}

/// One side of an in-memory link
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    /// Unbound transport speaking `format`
    pub fn new(format: WireFormat) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ChannelId::generate("mem"),
                format,
                remote: OnceLock::new(),
                closed: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Point the transport at the receiving side; only the first call binds
    pub fn bind(&self, remote: ConnectionHandle) -> bool {
        self.inner.remote.set(remote).is_ok()
    }

    /// Make every send fail until cleared
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Frames handed to the other side so far
    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::SeqCst)
    }

    /// Whether the link was closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Attach `a` and `b` to each other over a fresh link
    pub fn connect(a: &Node, b: &Node, format: WireFormat) -> Result<MemoryLink> {
        let a_transport = Self::new(format);
        let b_transport = Self::new(format);

        let a_handle = a.attach(Arc::new(a_transport.clone()), b.node_id().clone())?;
        let b_handle = b.attach(Arc::new(b_transport.clone()), a.node_id().clone())?;

        a_transport.bind(b_handle.clone());
        b_transport.bind(a_handle.clone());

        Ok(MemoryLink {
            a: a.node_id().clone(),
            b: b.node_id().clone(),
            a_handle,
            b_handle,
            a_transport,
            b_transport,
        })
    }
}

impl Transport for MemoryTransport {
    fn id(&self) -> &ChannelId {
        &self.inner.id
    }

    fn wire_format(&self) -> WireFormat {
        self.inner.format
    }

    fn send(&self, frame: Frame) -> std::result::Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::ChannelClosed {
                channel: self.inner.id.to_string(),
            });
        }
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(NetworkError::SendFailed {
                reason: "send failure injected".to_string(),
            });
        }

        let remote = self.inner.remote.get().ok_or_else(|| NetworkError::SendFailed {
            reason: format!("{} is not bound", self.inner.id),
        })?;
        remote.deliver(frame)?;
        self.inner.frames_sent.fetch_add(1, Ordering::SeqCst);
        trace!(channel = %self.inner.id, "Memory frame delivered");
        Ok(())
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            if let Some(remote) = self.inner.remote.get() {
                remote.disconnect();
            }
        }
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.inner.id)
            .field("format", &self.inner.format)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Both ends of a link made by [`MemoryTransport::connect`]
#[derive(Debug, Clone)]
pub struct MemoryLink {
    /// First node
    pub a: NodeId,
    /// Second node
    pub b: NodeId,
    /// Inbound queue of `a`'s connection to `b`
    pub a_handle: ConnectionHandle,
    /// Inbound queue of `b`'s connection to `a`
    pub b_handle: ConnectionHandle,
    /// Transport `a` sends on
    pub a_transport: MemoryTransport,
    /// Transport `b` sends on
    pub b_transport: MemoryTransport,
}

impl MemoryLink {
    /// Channel id of the link as seen by `a`
    pub fn a_channel(&self) -> &ChannelId {
        self.a_handle.channel()
    }

    /// Channel id of the link as seen by `b`
    pub fn b_channel(&self) -> &ChannelId {
        self.b_handle.channel()
    }

    /// Tear the link down from `a`'s side; `b` is told through its queue
    pub fn close(&self) {
        self.a_transport.close();
        self.a_handle.disconnect();
    }
}
