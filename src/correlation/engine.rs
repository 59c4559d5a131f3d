//! The correlation engine

use super::pending::{Completion, PendingCall, PendingRequest, PendingTable, StatsSnapshot};
use super::{SendOutcome, Transmitter};
use crate::addressing::{RequestId, RequestIdGenerator};
use crate::error::CorrelationError;
use crate::protocol::{Envelope, MessageKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default cap on concurrently pending requests
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Correlation engine settings
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Cap on concurrently pending requests
    pub max_pending: usize,
    /// Park transiently failed sends instead of failing the call
    pub retry_transient: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            retry_transient: false,
        }
    }
}

/// Matches replies to the requests this node issued
pub struct CorrelationEngine {
    ids: RequestIdGenerator,
    table: Arc<PendingTable>,
    transmitter: Arc<dyn Transmitter>,
    config: CorrelationConfig,
}

impl CorrelationEngine {
    /// Create an engine sending through `transmitter`
    pub fn new(transmitter: Arc<dyn Transmitter>, config: CorrelationConfig) -> Self {
        Self {
            ids: RequestIdGenerator::new(),
            table: Arc::new(PendingTable::default()),
            transmitter,
            config,
        }
    }

    /// Allocate a fresh request id
    pub fn next_request_id(&self) -> RequestId {
        self.ids.next_id()
    }

    /// Register and transmit a request
    ///
    /// The returned call completes exactly once. A transmit failure does not
    /// make this fail; it completes the call with
    /// [`SendOutcome::TransportFailure`] unless the failure is transient and
    /// retries are enabled.
    pub fn begin(
        &self,
        request: Envelope,
        timeout: Duration,
    ) -> Result<PendingCall, CorrelationError> {
        if request.kind() != MessageKind::Request {
            return Err(CorrelationError::NotARequest {
                kind: request.kind().to_string(),
            });
        }
        let id = request.id;
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.table
            .try_insert(PendingRequest::new(&request, deadline, tx), self.config.max_pending)?;
        let call = PendingCall::new(id, deadline, rx, Arc::clone(&self.table));

        if let Err(e) = self.transmitter.transmit(&request) {
            if e.is_transient() && self.config.retry_transient && self.transmitter.defer(request) {
                debug!(request_id = %id, error = %e, "Transmit deferred");
            } else {
                warn!(request_id = %id, error = %e, "Transmit failed");
                self.table
                    .complete(&id, Completion::TransportFailure(e.to_string()));
            }
        }

        Ok(call)
    }

    /// Send a request and wait for its outcome
    pub async fn send(
        &self,
        request: Envelope,
        timeout: Duration,
    ) -> Result<SendOutcome, CorrelationError> {
        Ok(self.begin(request, timeout)?.wait().await)
    }

    /// Deliver a reply; returns `false` for late or duplicate replies
    pub fn on_response_arrived(&self, reply: Envelope) -> bool {
        if !reply.is_reply() {
            return false;
        }

        let id = reply.id;
        let matched = self.table.complete(&id, Completion::Reply(reply));
        if !matched {
            debug!(request_id = %id, "Dropping late or duplicate reply");
        }
        matched
    }

    /// Cancel a pending request
    pub fn cancel(&self, id: RequestId) -> bool {
        self.table.complete(&id, Completion::Cancelled)
    }

    /// Fail a pending request whose transmission was abandoned
    pub fn fail(&self, id: RequestId, reason: impl Into<String>) -> bool {
        self.table
            .complete(&id, Completion::TransportFailure(reason.into()))
    }

    /// Time out every request whose deadline has passed
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.table.sweep(now)
    }

    /// Whether a request is still waiting
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.table.contains(&id)
    }

    /// Number of pending requests
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.table.stats.snapshot()
    }
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("pending", &self.pending_count())
            .field("next_id", &self.ids.peek())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::NodeId;
    use crate::error::{ChargemeshError, NetworkError, Result};
    use crate::protocol::{ErrorCode, ErrorDetails, Payload};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeTransmitter {
        sent: Mutex<Vec<Envelope>>,
        deferred: Mutex<Vec<Envelope>>,
        fail: AtomicBool,
    }

    impl Transmitter for FakeTransmitter {
        fn transmit(&self, envelope: &Envelope) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChargemeshError::Network(NetworkError::SendFailed {
                    reason: "link down".to_string(),
                }));
            }
            self.sent.lock().push(envelope.clone());
            Ok(())
        }

        fn defer(&self, envelope: Envelope) -> bool {
            self.deferred.lock().push(envelope);
            true
        }
    }

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn engine(transmitter: Arc<FakeTransmitter>) -> CorrelationEngine {
        CorrelationEngine::new(transmitter, CorrelationConfig::default())
    }

    fn request(engine: &CorrelationEngine) -> Envelope {
        Envelope::request(
            engine.next_request_id(),
            node("CS-1"),
            node("CSMS"),
            "Heartbeat",
            Payload::empty(),
        )
    }

    #[tokio::test]
    async fn test_response_completes_call() {
        let transmitter = Arc::new(FakeTransmitter::default());
        let engine = engine(transmitter.clone());
        let request = request(&engine);

        let call = engine.begin(request.clone(), Duration::from_secs(5)).unwrap();
        assert_eq!(transmitter.sent.lock().len(), 1);

        let reply = Envelope::response_to(&request, node("CSMS"), Payload::empty());
        assert!(engine.on_response_arrived(reply.clone()));

        match call.wait().await {
            SendOutcome::Success(envelope) => assert_eq!(envelope, reply),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_reply_completes_once() {
        let engine = engine(Arc::new(FakeTransmitter::default()));
        let request = request(&engine);
        let call = engine.begin(request.clone(), Duration::from_secs(5)).unwrap();

        let reply = Envelope::response_to(&request, node("CSMS"), Payload::empty());
        assert!(engine.on_response_arrived(reply.clone()));
        assert!(!engine.on_response_arrived(reply));

        assert!(matches!(call.wait().await, SendOutcome::Success(_)));
        let stats = engine.stats();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.late, 1);
    }

    #[tokio::test]
    async fn test_error_reply_is_rejected() {
        let engine = engine(Arc::new(FakeTransmitter::default()));
        let request = request(&engine);
        let call = engine.begin(request.clone(), Duration::from_secs(5)).unwrap();

        engine.on_response_arrived(Envelope::error_for(
            &request,
            node("HUB-1"),
            ErrorDetails::new(ErrorCode::NotSupported, "no"),
        ));

        match call.wait().await {
            SendOutcome::Rejected(reply) => {
                assert_eq!(reply.error().unwrap().code, ErrorCode::NotSupported)
            },
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply() {
        let engine = engine(Arc::new(FakeTransmitter::default()));
        let request = request(&engine);

        let started = Instant::now();
        let outcome = engine
            .send(request.clone(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::TimedOut));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed <= Duration::from_millis(101));

        let late = Envelope::response_to(&request, node("CSMS"), Payload::empty());
        assert!(!engine.on_response_arrived(late));
        assert_eq!(engine.stats().timed_out, 1);
        assert_eq!(engine.stats().late, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_before_waiter() {
        let engine = engine(Arc::new(FakeTransmitter::default()));
        let call = engine.begin(request(&engine), Duration::from_millis(50)).unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(engine.sweep_expired(Instant::now()), 1);
        assert!(matches!(call.wait().await, SendOutcome::TimedOut));
        assert_eq!(engine.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let engine = engine(Arc::new(FakeTransmitter::default()));
        let call = engine.begin(request(&engine), Duration::from_secs(5)).unwrap();

        assert!(engine.cancel(call.id()));
        assert!(!engine.cancel(call.id()));
        assert!(matches!(call.wait().await, SendOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_dropping_call_frees_slot() {
        let engine = engine(Arc::new(FakeTransmitter::default()));
        let call = engine.begin(request(&engine), Duration::from_secs(5)).unwrap();
        let id = call.id();

        assert!(engine.is_pending(id));
        drop(call);
        assert!(!engine.is_pending(id));
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let transmitter = Arc::new(FakeTransmitter::default());
        transmitter.fail.store(true, Ordering::SeqCst);
        let engine = engine(transmitter);

        let outcome = engine
            .send(request(&engine), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::TransportFailure(_)));
    }

    #[tokio::test]
    async fn test_transient_failure_is_deferred_when_enabled() {
        let transmitter = Arc::new(FakeTransmitter::default());
        transmitter.fail.store(true, Ordering::SeqCst);
        let engine = CorrelationEngine::new(
            transmitter.clone(),
            CorrelationConfig {
                retry_transient: true,
                ..Default::default()
            },
        );

        let call = engine.begin(request(&engine), Duration::from_secs(5)).unwrap();
        assert!(engine.is_pending(call.id()));
        assert_eq!(transmitter.deferred.lock().len(), 1);

        assert!(engine.fail(call.id(), "gave up"));
        assert!(matches!(call.wait().await, SendOutcome::TransportFailure(_)));
    }

    #[tokio::test]
    async fn test_pending_cap() {
        let engine = CorrelationEngine::new(
            Arc::new(FakeTransmitter::default()),
            CorrelationConfig {
                max_pending: 1,
                ..Default::default()
            },
        );

        let _first = engine.begin(request(&engine), Duration::from_secs(5)).unwrap();
        assert_eq!(
            engine.begin(request(&engine), Duration::from_secs(5)).unwrap_err(),
            CorrelationError::TooManyPending { max: 1 }
        );
    }

    #[tokio::test]
    async fn test_duplicate_id_is_refused() {
        let engine = engine(Arc::new(FakeTransmitter::default()));
        let request = request(&engine);
        let call = engine.begin(request.clone(), Duration::from_secs(5)).unwrap();

        assert_eq!(
            engine.begin(request.clone(), Duration::from_secs(5)).unwrap_err(),
            CorrelationError::DuplicateRequest { request_id: request.id }
        );
        assert_eq!(engine.pending_count(), 1);

        // the first waiter is untouched
        let reply = Envelope::response_to(&request, node("CSMS"), Payload::empty());
        assert!(engine.on_response_arrived(reply));
        assert!(matches!(call.wait().await, SendOutcome::Success(_)));
        assert_eq!(engine.stats().sent, 1);
    }

    #[test]
    fn test_pending_cap_holds_under_concurrent_begins() {
        let engine = Arc::new(CorrelationEngine::new(
            Arc::new(FakeTransmitter::default()),
            CorrelationConfig {
                max_pending: 8,
                ..Default::default()
            },
        ));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    engine.begin(request(&engine), Duration::from_secs(5)).ok()
                })
            })
            .collect();
        let calls: Vec<PendingCall> =
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.len(), 8);
        assert_eq!(engine.pending_count(), 8);
    }

    #[tokio::test]
    async fn test_only_requests_are_correlated() {
        let engine = engine(Arc::new(FakeTransmitter::default()));
        let notification = Envelope::notification(
            engine.next_request_id(),
            node("CS-1"),
            node("CSMS"),
            "MeterValues",
            Payload::empty(),
        );
        assert!(matches!(
            engine.begin(notification, Duration::from_secs(1)),
            Err(CorrelationError::NotARequest { .. })
        ));
    }
}
