//! Outbound dispatch
//!
//! The [`Router`] turns an envelope into a frame on the right channel: it
//! resolves the next hop (source route or routing table), encodes with the
//! wire variant of the chosen channel and hands the frame to the transport.
//! Transient failures can be parked in the [`RetryQueue`] and replayed by
//! the maintenance cycle.

use crate::addressing::NodeId;
use crate::error::{ChargemeshError, Result, RoutingError};
use crate::network::{ChannelId, ConnectionPool};
use crate::protocol::{CodecSet, Destination, Envelope};
use crate::routing::routing_table::RoutingTable;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default retry limit for message delivery
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Message parked for a later delivery attempt
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// The message to send
    pub envelope: Envelope,
    /// Number of retry attempts so far
    pub retry_count: u32,
}

/// Sends that failed transiently, replayed oldest first
#[derive(Debug)]
pub struct RetryQueue {
    queue: Mutex<VecDeque<OutgoingMessage>>,
    max_retries: u32,
}

impl RetryQueue {
    /// Create an empty queue
    pub fn new(max_retries: u32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_retries,
        }
    }

    /// Park a message
    pub fn push(&self, envelope: Envelope) {
        self.queue.lock().push_back(OutgoingMessage {
            envelope,
            retry_count: 0,
        });
    }

    /// Take every parked message
    pub fn drain(&self) -> Vec<OutgoingMessage> {
        self.queue.lock().drain(..).collect()
    }

    /// Put a message back after another failed attempt
    ///
    /// Returns the message when it has used up its retries.
    pub fn requeue(&self, mut message: OutgoingMessage) -> Option<OutgoingMessage> {
        message.retry_count += 1;
        if message.retry_count >= self.max_retries {
            return Some(message);
        }
        self.queue.lock().push_back(message);
        None
    }

    /// Number of parked messages
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Result of one pass over the retry queue
#[derive(Debug, Default)]
pub struct RetryReport {
    /// Messages delivered on this pass
    pub delivered: usize,
    /// Messages put back for another pass
    pub requeued: usize,
    /// Messages that used up their retries or failed permanently
    pub abandoned: Vec<(Envelope, ChargemeshError)>,
}

/// Main router for message delivery
pub struct Router {
    /// This node
    local: NodeId,
    /// Routing table
    routing_table: Arc<RoutingTable>,
    /// Attached channels
    connection_pool: Arc<ConnectionPool>,
    /// Encoders for both wire variants
    codecs: CodecSet,
    /// Parked sends
    retries: RetryQueue,
}

impl Router {
    /// Create a new router
    pub fn new(
        local: NodeId,
        routing_table: Arc<RoutingTable>,
        connection_pool: Arc<ConnectionPool>,
        codecs: CodecSet,
        max_retries: u32,
    ) -> Self {
        Self {
            local,
            routing_table,
            connection_pool,
            codecs,
            retries: RetryQueue::new(max_retries),
        }
    }

    /// Get the routing table
    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    /// Get the connection pool
    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.connection_pool
    }

    /// Get the codecs
    pub fn codecs(&self) -> &CodecSet {
        &self.codecs
    }

    /// Get the retry queue
    pub fn retries(&self) -> &RetryQueue {
        &self.retries
    }

    /// Pick the channel an envelope leaves on
    pub fn next_channel(&self, envelope: &Envelope) -> Result<ChannelId> {
        match &envelope.destination {
            Destination::SourceRoute(hops) => self.next_source_hop(hops),
            Destination::Node(destination) => {
                if destination.is_broadcast() {
                    return Err(RoutingError::InvalidDestination {
                        reason: "broadcast messages are sent per channel".to_string(),
                    }
                    .into());
                }
                if destination == &self.local {
                    return Err(RoutingError::InvalidDestination {
                        reason: "cannot route message to self".to_string(),
                    }
                    .into());
                }
                Ok(self
                    .routing_table
                    .resolve_channel_at(destination, Utc::now())?)
            },
        }
    }

    /// Source routing: the hop after the local node, which must be attached
    fn next_source_hop(&self, hops: &[NodeId]) -> Result<ChannelId> {
        let next = match hops.iter().position(|hop| hop == &self.local) {
            Some(index) => hops.get(index + 1),
            None => hops.first(),
        };

        let next = next.ok_or_else(|| RoutingError::InvalidDestination {
            reason: "source route ends at this node".to_string(),
        })?;

        self.connection_pool
            .get_by_peer(next)
            .map(|conn| conn.id().clone())
            .ok_or_else(|| {
                RoutingError::NotReachable {
                    destination: next.clone(),
                }
                .into()
            })
    }

    /// Route and send an envelope, returning the channel used
    pub fn dispatch(&self, envelope: &Envelope) -> Result<ChannelId> {
        let channel = self.next_channel(envelope)?;
        self.send_on(&channel, envelope)?;
        Ok(channel)
    }

    /// Encode for and send on a specific channel
    pub fn send_on(&self, channel: &ChannelId, envelope: &Envelope) -> Result<()> {
        let connection = self
            .connection_pool
            .get(channel)
            .ok_or_else(|| RoutingError::NoChannel {
                channel: channel.to_string(),
            })?;

        let frame = self.codecs.encode(connection.wire_format(), envelope)?;
        connection.send_frame(frame)?;

        trace!(
            request_id = %envelope.id,
            kind = %envelope.kind(),
            channel = %channel,
            "Frame sent"
        );
        Ok(())
    }

    /// Park an envelope for a later attempt
    pub fn queue_retry(&self, envelope: Envelope) {
        debug!(request_id = %envelope.id, "Queued for retry");
        self.retries.push(envelope);
    }

    /// Replay every parked envelope once
    pub fn retry_queued(&self) -> RetryReport {
        let mut report = RetryReport::default();

        for message in self.retries.drain() {
            match self.dispatch(&message.envelope) {
                Ok(_) => report.delivered += 1,
                Err(e) if e.is_transient() => match self.retries.requeue(message) {
                    None => report.requeued += 1,
                    Some(exhausted) => {
                        warn!(
                            request_id = %exhausted.envelope.id,
                            retries = exhausted.retry_count,
                            "Giving up on delivery"
                        );
                        report.abandoned.push((exhausted.envelope, e));
                    },
                },
                Err(e) => report.abandoned.push((message.envelope, e)),
            }
        }

        report
    }

    /// Get this router's node ID
    pub fn node_id(&self) -> &NodeId {
        &self.local
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local)
            .field("connections", &self.connection_pool.len())
            .field("retries", &self.retries.len())
            .finish()
    }
}
