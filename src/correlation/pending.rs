//! Pending request slots

use crate::addressing::RequestId;
use crate::correlation::SendOutcome;
use crate::error::CorrelationError;
use crate::protocol::{ActionKind, Destination, Envelope, MessageKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// How a pending request ended
#[derive(Debug)]
pub(crate) enum Completion {
    /// A response or error reply arrived
    Reply(Envelope),
    /// The deadline passed first
    TimedOut,
    /// The caller gave up
    Cancelled,
    /// The request never left, or was abandoned by the retry queue
    TransportFailure(String),
}

impl Completion {
    pub(crate) fn into_outcome(self) -> SendOutcome {
        match self {
            Self::Reply(envelope) if envelope.kind() == MessageKind::Response => {
                SendOutcome::Success(envelope)
            },
            Self::Reply(envelope) => SendOutcome::Rejected(envelope),
            Self::TimedOut => SendOutcome::TimedOut,
            Self::Cancelled => SendOutcome::Cancelled,
            Self::TransportFailure(reason) => SendOutcome::TransportFailure(reason),
        }
    }
}

/// One request waiting for its reply
#[derive(Debug)]
pub struct PendingRequest {
    /// Correlation id
    pub id: RequestId,
    /// Where the request went
    pub sent_to: Destination,
    /// Requested action
    pub action: Option<ActionKind>,
    /// When the request was registered
    pub sent_at: Instant,
    /// When it times out
    pub deadline: Instant,
    slot: oneshot::Sender<Completion>,
}

impl PendingRequest {
    pub(crate) fn new(
        envelope: &Envelope,
        deadline: Instant,
        slot: oneshot::Sender<Completion>,
    ) -> Self {
        Self {
            id: envelope.id,
            sent_to: envelope.destination.clone(),
            action: envelope.action().cloned(),
            sent_at: Instant::now(),
            deadline,
            slot,
        }
    }

    /// Fill the completion slot; a waiter that already left is ignored
    pub(crate) fn complete(self, completion: Completion) {
        let _ = self.slot.send(completion);
    }
}

/// Counters kept by the correlation engine
#[derive(Debug, Default)]
pub struct CorrelationStats {
    sent: AtomicU64,
    matched: AtomicU64,
    late: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    transport_failures: AtomicU64,
}

/// Point-in-time copy of [`CorrelationStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests registered
    pub sent: u64,
    /// Replies matched to a pending request
    pub matched: u64,
    /// Replies with no pending request (late or duplicate)
    pub late: u64,
    /// Requests that hit their deadline
    pub timed_out: u64,
    /// Requests cancelled or abandoned by the caller
    pub cancelled: u64,
    /// Requests that could not be transmitted
    pub transport_failures: u64,
}

impl CorrelationStats {
    /// Copy the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }
}

/// Pending requests keyed by id
///
/// Removal from the map is the single point of truth: whoever removes an
/// entry owns its completion, so every request completes exactly once.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: DashMap<RequestId, PendingRequest>,
    /// Reserved slots; reserved before insertion so the cap holds under races
    occupied: AtomicUsize,
    pub(crate) stats: CorrelationStats,
}

impl PendingTable {
    /// Insert a request unless the table is full or its id is taken
    pub(crate) fn try_insert(
        &self,
        request: PendingRequest,
        max: usize,
    ) -> Result<(), CorrelationError> {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| CorrelationError::TooManyPending { max })?;

        let id = request.id;
        match self.entries.entry(id) {
            Entry::Occupied(_) => {
                self.occupied.fetch_sub(1, Ordering::AcqRel);
                Err(CorrelationError::DuplicateRequest { request_id: id })
            },
            Entry::Vacant(slot) => {
                slot.insert(request);
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    /// Complete a request if it is still pending
    pub(crate) fn complete(&self, id: &RequestId, completion: Completion) -> bool {
        let Some((_, request)) = self.entries.remove(id) else {
            if matches!(completion, Completion::Reply(_)) {
                self.stats.late.fetch_add(1, Ordering::Relaxed);
            }
            return false;
        };
        self.occupied.fetch_sub(1, Ordering::AcqRel);

        let counter = match &completion {
            Completion::Reply(_) => &self.stats.matched,
            Completion::TimedOut => &self.stats.timed_out,
            Completion::Cancelled => &self.stats.cancelled,
            Completion::TransportFailure(_) => &self.stats.transport_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        request.complete(completion);
        true
    }

    /// Time out every request whose deadline has passed
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter(|id| self.complete(id, Completion::TimedOut))
            .inspect(|id| debug!(request_id = %id, "Pending request expired"))
            .count()
    }
}

/// Handle on one in-flight request
///
/// Await the reply with [`PendingCall::wait`]. Dropping the handle without
/// waiting releases the slot.
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    deadline: Instant,
    rx: Option<oneshot::Receiver<Completion>>,
    table: Arc<PendingTable>,
}

impl PendingCall {
    pub(crate) fn new(
        id: RequestId,
        deadline: Instant,
        rx: oneshot::Receiver<Completion>,
        table: Arc<PendingTable>,
    ) -> Self {
        Self {
            id,
            deadline,
            rx: Some(rx),
            table,
        }
    }

    /// Correlation id of the request
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// When the request times out
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the request to complete
    pub async fn wait(mut self) -> SendOutcome {
        let Some(mut rx) = self.rx.take() else {
            return SendOutcome::Cancelled;
        };

        match tokio::time::timeout_at(self.deadline, &mut rx).await {
            Ok(Ok(completion)) => completion.into_outcome(),
            Ok(Err(_)) => SendOutcome::Cancelled,
            Err(_) => {
                if self.table.complete(&self.id, Completion::TimedOut) {
                    debug!(request_id = %self.id, "Request timed out");
                }
                // Either our own TimedOut or a completion that won the race.
                match rx.await {
                    Ok(completion) => completion.into_outcome(),
                    Err(_) => SendOutcome::TimedOut,
                }
            },
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.table.complete(&self.id, Completion::Cancelled);
        }
    }
}
