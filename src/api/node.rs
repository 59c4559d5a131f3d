//! Node implementation - the main entry point for chargemesh
//!
//! This module provides the `Node` and `NodeBuilder` types. A node wires the
//! routing table, router, correlation engine, forwarding engine, signature
//! policy and maintenance scheduler together, and runs one task per attached
//! connection that feeds inbound frames through the pipeline:
//!
//! decode → verify signatures → local delivery (handlers, correlation) or
//! relay (forwarding decision, path extension, re-encode, send).

use crate::addressing::{CorrelationKey, NetworkPath, NodeId};
use crate::api::config::{NodeConfig, NodeRole};
use crate::api::observers::{ObserverHandle, ObserverStage, Observers};
use crate::correlation::{
    CorrelationConfig, CorrelationEngine, PendingCall, SendOutcome, Transmitter,
};
use crate::crypto::{Identity, KeyId, KeyProvider, SecureChannel, SignaturePolicy, Verification};
use crate::error::{
    panic_message, root_cause, ChargemeshError, ConfigError, DecodeError, ForwardingError, Result,
};
use crate::forwarding::{DropReason, ForwardingContext, ForwardingDecision, ForwardingEngine};
use crate::maintenance::{
    CycleFuture, DebounceGate, Maintainable, MaintenanceHandle, MaintenanceScheduler,
    MaintenanceStats, TickOutcome,
};
use crate::network::{ChannelId, Connection, ConnectionHandle, ConnectionPool, Inbound, Transport};
use crate::protocol::{
    ActionKind, CodecConfig, CodecSet, Destination, Envelope, EnvelopeBody, ErrorCode,
    ErrorDetails, MessageKind, Payload, TopologyAnnouncement,
};
use crate::routing::{NextHop, Router, RoutingTable};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Business logic answering requests addressed to this node
pub type RequestHandler =
    Arc<dyn Fn(&Envelope) -> std::result::Result<Payload, ErrorDetails> + Send + Sync>;

/// Business logic consuming notifications addressed to this node
pub type NotificationHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Current operational state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Node has been created but not started
    Created,
    /// Maintenance is running
    Running,
    /// Node has stopped and its connections are closed
    Stopped,
}

/// Builder for creating Node instances with progressive configuration
///
/// # Examples
///
/// ```no_run
/// use chargemesh::api::{NodeBuilder, NodeRole};
/// use chargemesh::NodeId;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let node = NodeBuilder::new()
///     .with_node_id(NodeId::new("HUB-1")?)
///     .with_role(NodeRole::Hub)
///     .build()?;
///
/// node.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct NodeBuilder {
    config: NodeConfig,
    identity: Option<(KeyId, Identity)>,
    key_provider: Option<Arc<dyn KeyProvider>>,
}

impl NodeBuilder {
    /// Create a new NodeBuilder with default settings
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            identity: None,
            key_provider: None,
        }
    }

    /// Set the node's identifier
    ///
    /// Required; `build` fails without one.
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.config.node_id = Some(node_id);
        self
    }

    /// Set the role preset
    ///
    /// This configures relaying and the default forwarding policy at once.
    /// Call it before any `with_*` method that overrides those settings.
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.config.set_role(role);
        self
    }

    /// Replace the whole configuration, e.g. one read with `load_config`
    ///
    /// A node id set earlier survives if the new configuration has none.
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        let node_id = self.config.node_id.take();
        self.config = config;
        if self.config.node_id.is_none() {
            self.config.node_id = node_id;
        }
        self
    }

    /// Install the signing identity used by `KeySelector::Local` rules
    ///
    /// # Arguments
    ///
    /// * `key_id` - Id peers know this key under
    /// * `identity` - The Ed25519 identity
    pub fn with_identity(mut self, key_id: impl Into<KeyId>, identity: Identity) -> Self {
        self.identity = Some((key_id.into(), identity));
        self
    }

    /// Enable the secure channel with keys from `provider`
    pub fn with_key_provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.key_provider = Some(provider);
        self
    }

    /// Default timeout for requests this node issues
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Interval between maintenance cycles
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Run the forwarding pipeline on requests addressed to this node too
    pub fn filter_local_requests(mut self, enabled: bool) -> Self {
        self.config.filter_local_requests = enabled;
        self
    }

    /// Build the Node instance
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or has no node id.
    pub fn build(self) -> Result<Node> {
        self.config.validate()?;
        let id = self
            .config
            .node_id
            .clone()
            .ok_or_else(|| ConfigError::MissingRequiredField {
                field: "node_id".to_string(),
            })?;
        let config = self.config;

        let routing_table =
            Arc::new(RoutingTable::new(id.clone()).with_learned_ttl(config.learned_route_ttl()));
        let pool = Arc::new(ConnectionPool::new(config.max_connections));
        let codecs = CodecSet::new(CodecConfig {
            max_payload_size: config.max_payload_size,
        });
        let router = Arc::new(Router::new(
            id.clone(),
            Arc::clone(&routing_table),
            Arc::clone(&pool),
            codecs,
            config.max_retries,
        ));

        let correlation = CorrelationEngine::new(
            Arc::new(RouterTransmitter(Arc::clone(&router))),
            CorrelationConfig {
                max_pending: config.max_pending_requests,
                retry_transient: config.retry_transient_failures,
            },
        );

        let forwarding = ForwardingEngine::new(config.default_policy);
        for destination in &config.deny_list {
            forwarding.deny(destination.clone());
        }
        for destination in &config.allow_list {
            forwarding.allow(destination.clone());
        }

        let signatures = SignaturePolicy::new();
        if let Some((key_id, identity)) = self.identity {
            signatures.keyring_mut().set_local(key_id, identity);
        }

        let secure_channel = self.key_provider.map(|provider| {
            Arc::new(SecureChannel::new(
                provider,
                config.secure_channel_parameter.as_bytes().to_vec(),
            ))
        });

        let debounce =
            DebounceGate::with_refresh(config.announce_debounce(), config.announce_refresh());
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            id,
            config,
            routing_table,
            pool,
            router,
            correlation,
            forwarding,
            signatures,
            secure_channel,
            observers: Observers::new(),
            handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            relayed: DashMap::new(),
            debounce,
            shutdown,
        });

        let scheduler = MaintenanceScheduler::new(
            Arc::clone(&inner) as Arc<dyn Maintainable>,
            inner.config.maintenance_interval(),
        );

        Ok(Node {
            inner,
            scheduler,
            state: RwLock::new(NodeState::Created),
            maintenance: Mutex::new(None),
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands correlated requests to the router
struct RouterTransmitter(Arc<Router>);

impl Transmitter for RouterTransmitter {
    fn transmit(&self, envelope: &Envelope) -> Result<()> {
        self.0.dispatch(envelope).map(|_| ())
    }

    fn defer(&self, envelope: Envelope) -> bool {
        self.0.queue_retry(envelope);
        true
    }
}

/// Where a relayed request came from, so its reply can go back the same way
#[derive(Debug, Clone)]
struct RelayedRequest {
    inbound: ChannelId,
    deadline: Instant,
}

/// State shared by the node handle, its connection tasks and maintenance
struct NodeInner {
    id: NodeId,
    config: NodeConfig,
    routing_table: Arc<RoutingTable>,
    pool: Arc<ConnectionPool>,
    router: Arc<Router>,
    correlation: CorrelationEngine,
    forwarding: ForwardingEngine,
    signatures: SignaturePolicy,
    secure_channel: Option<Arc<SecureChannel>>,
    observers: Observers,
    handlers: RwLock<HashMap<ActionKind, RequestHandler>>,
    notification_handlers: RwLock<HashMap<ActionKind, NotificationHandler>>,
    relayed: DashMap<CorrelationKey, RelayedRequest>,
    debounce: DebounceGate,
    shutdown: watch::Sender<bool>,
}

/// A participant in the overlay: endpoint and, depending on its role, relay
///
/// # Examples
///
/// ```no_run
/// use chargemesh::api::{NodeBuilder, NodeRole};
/// use chargemesh::protocol::{Payload, WireFormat};
/// use chargemesh::network::MemoryTransport;
/// use chargemesh::NodeId;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let controller = NodeBuilder::new()
///     .with_node_id(NodeId::new("CSMS")?)
///     .with_role(NodeRole::Controller)
///     .build()?;
/// let station = NodeBuilder::new().with_node_id(NodeId::new("CS-1")?).build()?;
///
/// controller.on_request("Heartbeat", |_request| Ok(Payload::empty()));
/// MemoryTransport::connect(&station, &controller, WireFormat::Text)?;
///
/// let outcome = station
///     .send(NodeId::new("CSMS")?, "Heartbeat", Payload::empty(), Duration::from_secs(5))
///     .await?;
/// assert!(outcome.is_success());
/// # Ok(())
/// # }
/// ```
pub struct Node {
    inner: Arc<NodeInner>,
    scheduler: MaintenanceScheduler,
    state: RwLock<NodeState>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl Node {
    // ========================================================================
    // Lifecycle Methods
    // ========================================================================

    /// Start the maintenance loop
    ///
    /// # Errors
    ///
    /// Returns an error if the node is already running.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state == NodeState::Running {
                return Err(ConfigError::InvalidValue {
                    field: "state".to_string(),
                    reason: "node is already running".to_string(),
                }
                .into());
            }
            *state = NodeState::Running;
        }

        self.inner.shutdown.send_replace(false);
        *self.maintenance.lock() = Some(self.scheduler.clone().start());

        info!(node = %self.inner.id, role = ?self.inner.config.role, "Node started");
        Ok(())
    }

    /// Stop maintenance and close every connection
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not running.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Running {
                return Err(ConfigError::InvalidValue {
                    field: "state".to_string(),
                    reason: "node is not running".to_string(),
                }
                .into());
            }
            *state = NodeState::Stopped;
        }

        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        self.inner.shutdown.send_replace(true);
        self.inner.pool.close_all();

        info!(node = %self.inner.id, "Node stopped");
        Ok(())
    }

    /// Get the current operational state
    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// This node's identifier
    pub fn node_id(&self) -> &NodeId {
        &self.inner.id
    }

    /// This node's role
    pub fn role(&self) -> NodeRole {
        self.inner.config.role
    }

    /// The configuration the node was built with
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// The routing table
    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.inner.routing_table
    }

    /// Attached connections
    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    /// The forwarding engine, for deny/allow lists and decision hooks
    pub fn forwarding(&self) -> &ForwardingEngine {
        &self.inner.forwarding
    }

    /// The signature policy, for rules and keys
    pub fn signatures(&self) -> &SignaturePolicy {
        &self.inner.signatures
    }

    /// The correlation engine
    pub fn correlation(&self) -> &CorrelationEngine {
        &self.inner.correlation
    }

    /// The secure channel, when a key provider was configured
    pub fn secure_channel(&self) -> Option<&Arc<SecureChannel>> {
        self.inner.secure_channel.as_ref()
    }

    /// Number of relayed requests still waiting for their reply
    pub fn relayed_count(&self) -> usize {
        self.inner.relayed.len()
    }

    /// Maintenance counters
    pub fn maintenance_stats(&self) -> MaintenanceStats {
        self.scheduler.stats()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Attach an established channel to `peer`
    ///
    /// The peer becomes reachable over the channel at priority 0. Inbound
    /// frames are pushed through the returned handle and processed in order
    /// by a task spawned on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection pool is full.
    pub fn attach(&self, transport: Arc<dyn Transport>, peer: NodeId) -> Result<ConnectionHandle> {
        let connection = Arc::new(Connection::new(transport, peer.clone()));
        let channel = connection.id().clone();

        self.inner.pool.add_connection(Arc::clone(&connection))?;
        self.inner
            .routing_table
            .learn_route(peer.clone(), NextHop::Channel(channel.clone()), 0, Utc::now(), None);

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run_connection(connection, rx));

        info!(node = %self.inner.id, channel = %channel, peer = %peer, "Connection attached");
        Ok(ConnectionHandle::new(channel, tx))
    }

    // ========================================================================
    // Routes
    // ========================================================================

    /// Add or refresh a static route
    pub fn add_static_route(
        &self,
        destination: NodeId,
        next_hop: NextHop,
        priority: u32,
        timeout: Option<Duration>,
    ) {
        self.inner
            .routing_table
            .add_static_route(destination, next_hop, priority, Utc::now(), timeout);
    }

    /// Remove one route, or every route for the destination
    pub fn remove_route(&self, destination: &NodeId, next_hop: Option<&NextHop>) -> usize {
        self.inner.routing_table.remove_route(destination, next_hop)
    }

    /// Route used for destinations nothing else resolves
    pub fn set_default_route(&self, next_hop: Option<NextHop>) {
        self.inner.routing_table.set_default_route(next_hop);
    }

    // ========================================================================
    // Handlers and Observers
    // ========================================================================

    /// Answer requests for `action` addressed to this node
    ///
    /// Returning `Err` sends a RequestError with the given details. A
    /// panicking handler is answered with `InternalError`.
    pub fn on_request<F>(&self, action: impl Into<ActionKind>, handler: F)
    where
        F: Fn(&Envelope) -> std::result::Result<Payload, ErrorDetails> + Send + Sync + 'static,
    {
        self.inner.handlers.write().insert(action.into(), Arc::new(handler));
    }

    /// Consume notifications for `action` addressed to this node
    pub fn on_notification<F>(&self, action: impl Into<ActionKind>, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner
            .notification_handlers
            .write()
            .insert(action.into(), Arc::new(handler));
    }

    /// Observe a lifecycle stage, optionally for one action only
    pub fn observe<F>(
        &self,
        stage: ObserverStage,
        action: Option<ActionKind>,
        callback: F,
    ) -> ObserverHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.observers.observe(stage, action, callback)
    }

    /// Remove an observer
    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.inner.observers.remove(handle)
    }

    // ========================================================================
    // Outbound Traffic
    // ========================================================================

    /// Issue a request without waiting for the reply
    ///
    /// Await the reply with [`PendingCall::wait`], cancel it with
    /// [`Node::cancel`] and the call's id.
    pub fn begin_request(
        &self,
        destination: impl Into<Destination>,
        action: impl Into<ActionKind>,
        payload: Payload,
        timeout: Duration,
    ) -> Result<PendingCall> {
        let inner = &self.inner;
        let request = Envelope::request(
            inner.correlation.next_request_id(),
            inner.id.clone(),
            destination,
            action,
            payload,
        );
        let request = inner.signatures.apply(request)?;

        debug!(
            request_id = %request.id,
            action = ?request.action(),
            destination = ?request.final_destination(),
            "Sending request"
        );
        inner
            .observers
            .notify(ObserverStage::RequestSent, request.action(), &request);
        Ok(inner.correlation.begin(request, timeout)?)
    }

    /// Send a request and wait for its outcome
    ///
    /// Routing and transport failures are reported as
    /// [`SendOutcome::TransportFailure`], not as `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be signed or too many requests
    /// are pending.
    pub async fn send(
        &self,
        destination: impl Into<Destination>,
        action: impl Into<ActionKind>,
        payload: Payload,
        timeout: Duration,
    ) -> Result<SendOutcome> {
        let action = action.into();
        let call = self.begin_request(destination, action.clone(), payload, timeout)?;
        let outcome = call.wait().await;

        if let Some(reply) = outcome.reply() {
            self.inner
                .observers
                .notify(ObserverStage::ResponseReceived, Some(&action), reply);
        }
        Ok(outcome)
    }

    /// Cancel a pending request
    pub fn cancel(&self, call_id: crate::addressing::RequestId) -> bool {
        self.inner.correlation.cancel(call_id)
    }

    /// Send a one-way notification
    ///
    /// Broadcast notifications go to every direct neighbour.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails or the destination is unreachable.
    pub fn send_notification(
        &self,
        destination: impl Into<Destination>,
        action: impl Into<ActionKind>,
        payload: Payload,
    ) -> Result<()> {
        let inner = &self.inner;
        let notification = Envelope::notification(
            inner.correlation.next_request_id(),
            inner.id.clone(),
            destination,
            action,
            payload,
        );
        let notification = inner.signatures.apply(notification)?;

        if notification.final_destination().map_or(false, NodeId::is_broadcast) {
            for connection in inner.pool.connections() {
                if let Err(e) = inner.router.send_on(connection.id(), &notification) {
                    warn!(channel = %connection.id(), error = %e, "Broadcast send failed");
                }
            }
            return Ok(());
        }

        inner.router.dispatch(&notification)?;
        Ok(())
    }

    /// Seal a payload for `peer` with the secure channel
    ///
    /// # Errors
    ///
    /// Returns an error if no key provider is configured or sealing fails.
    pub fn seal(&self, peer: &NodeId, key_id: &str, payload: &Payload) -> Result<Payload> {
        Ok(self.require_secure_channel()?.seal(peer, key_id, payload)?)
    }

    /// Open a payload sealed by `peer`
    ///
    /// # Errors
    ///
    /// Returns an error if no key provider is configured or opening fails.
    pub fn open(&self, peer: &NodeId, payload: &Payload) -> Result<Payload> {
        Ok(self.require_secure_channel()?.open(peer, payload)?)
    }

    fn require_secure_channel(&self) -> Result<&Arc<SecureChannel>> {
        self.inner.secure_channel.as_ref().ok_or_else(|| {
            ConfigError::MissingRequiredField {
                field: "key_provider".to_string(),
            }
            .into()
        })
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run one maintenance cycle now, or skip if one is in progress
    pub async fn maintain(&self) -> TickOutcome {
        self.scheduler.tick().await
    }

    /// Announce the routing table to every neighbour, bypassing the debounce
    ///
    /// # Errors
    ///
    /// Returns the first send failure; the other channels are still served.
    pub fn announce_now(&self) -> Result<()> {
        self.inner.announce()
    }

    #[cfg(test)]
    pub(crate) fn request_handler(&self, action: &ActionKind) -> Option<RequestHandler> {
        self.inner.handlers.read().get(action).cloned()
    }

    pub(crate) fn set_request_handler(&self, action: ActionKind, handler: RequestHandler) {
        self.inner.handlers.write().insert(action, handler);
    }

    pub(crate) fn set_notification_handler(
        &self,
        action: ActionKind,
        handler: NotificationHandler,
    ) {
        self.inner.notification_handlers.write().insert(action, handler);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("role", &self.inner.config.role)
            .field("state", &self.state())
            .field("connections", &self.inner.pool.len())
            .field("routes", &self.inner.routing_table.route_count())
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // connection tasks hold the shared state; let them exit
        self.inner.shutdown.send_replace(true);
    }
}

// ============================================================================
// Inbound Pipeline
// ============================================================================

impl NodeInner {
    async fn run_connection(
        self: Arc<Self>,
        connection: Arc<Connection>,
        mut rx: mpsc::UnboundedReceiver<Inbound>,
    ) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Inbound::Frame(frame)) => {
                        if !self.handle_frame(&connection, frame) {
                            break;
                        }
                    },
                    Some(Inbound::Disconnect) | None => break,
                },
                _ = async {
                    let _ = shutdown.wait_for(|stopped| *stopped).await;
                } => break,
            }
        }

        self.detach(&connection);
    }

    fn detach(&self, connection: &Arc<Connection>) {
        let channel = connection.id().clone();
        self.pool.remove(&channel);
        connection.close();

        let routes = self.routing_table.remove_next_hop(&NextHop::Channel(channel.clone()));
        self.relayed.retain(|_, record| record.inbound != channel);

        info!(
            node = %self.id,
            channel = %channel,
            peer = %connection.peer_id(),
            routes,
            "Connection detached"
        );
    }

    /// Process one frame; `false` closes the connection
    fn handle_frame(&self, connection: &Arc<Connection>, frame: crate::protocol::Frame) -> bool {
        connection.record_received(&frame);

        match self.router.codecs().decode(&frame) {
            Ok(envelope) => {
                connection.reset_decode_errors();
                self.handle_envelope(connection, envelope);
                true
            },
            Err(e) => self.on_decode_error(connection, e),
        }
    }

    fn on_decode_error(&self, connection: &Arc<Connection>, e: DecodeError) -> bool {
        let channel = connection.id();
        let errors = connection.record_decode_error();
        warn!(channel = %channel, error = %e, errors, "Dropping malformed frame");

        let Some(request_id) = e.request_id() else {
            error!(channel = %channel, "Unrecoverable framing error, closing connection");
            return false;
        };

        let code = match e {
            DecodeError::UnknownKind { .. } => ErrorCode::MessageTypeNotSupported,
            _ => ErrorCode::FormatViolation,
        };
        let rejection = Envelope {
            id: request_id,
            destination: Destination::Node(connection.peer_id().clone()),
            path: NetworkPath::starting_at(self.id.clone()),
            body: EnvelopeBody::RequestError(ErrorDetails::new(code, e.to_string())),
            signatures: Vec::new(),
        };
        self.send_reply_on(channel, rejection);

        if errors >= self.config.max_decode_errors {
            let err = crate::error::NetworkError::TooManyDecodeErrors {
                channel: channel.to_string(),
            };
            error!(channel = %channel, "{}", err);
            return false;
        }
        true
    }

    fn handle_envelope(&self, connection: &Arc<Connection>, envelope: Envelope) {
        let channel = connection.id();
        trace!(
            request_id = %envelope.id,
            kind = %envelope.kind(),
            channel = %channel,
            "Envelope received"
        );

        if let EnvelopeBody::Announcement(announcement) = &envelope.body {
            let learned = self
                .routing_table
                .learn_from_announcement(announcement, channel, Utc::now());
            debug!(
                channel = %channel,
                origin = %announcement.origin,
                learned,
                "Topology announcement received"
            );
            return;
        }

        if let Verification::Invalid(reason) = self.signatures.verify(&envelope) {
            warn!(
                request_id = %envelope.id,
                channel = %channel,
                reason = %reason,
                "Signature check failed"
            );
            if envelope.kind() == MessageKind::Request {
                let reply = Envelope::error_for(
                    &envelope,
                    self.id.clone(),
                    ErrorDetails::new(ErrorCode::SignatureInvalid, reason),
                );
                self.send_reply_on(channel, reply);
            }
            return;
        }

        let local = self.is_locally_addressed(&envelope);
        match (envelope.kind(), local) {
            (MessageKind::Request, true) => self.handle_local_request(connection, envelope),
            (MessageKind::Notification, true) => self.handle_local_notification(envelope),
            (_, true) => {
                self.correlation.on_response_arrived(envelope);
            },
            (MessageKind::Request, false) => self.relay_request(connection, envelope),
            (MessageKind::Notification, false) => self.relay_notification(connection, envelope),
            (_, false) => self.relay_reply(envelope),
        }
    }

    fn is_locally_addressed(&self, envelope: &Envelope) -> bool {
        match &envelope.destination {
            Destination::Node(id) => {
                id == &self.id
                    || id.is_broadcast()
                    || (id.is_controller() && self.config.role.is_controller())
            },
            Destination::SourceRoute(hops) => hops.last() == Some(&self.id),
        }
    }

    fn handle_local_request(&self, connection: &Arc<Connection>, mut envelope: Envelope) {
        let channel = connection.id();

        if self.config.filter_local_requests {
            let context = ForwardingContext {
                connection: channel.clone(),
                inbound_peer: Some(connection.peer_id().clone()),
                local: self.id.clone(),
                locally_addressed: true,
            };
            match self.forwarding.decide(&envelope, &context) {
                ForwardingDecision::Admit { rewritten } => {
                    if let Some(rewritten) = rewritten {
                        envelope = rewritten;
                    }
                },
                ForwardingDecision::Reject { reply } => {
                    self.send_reply_on(channel, reply);
                    return;
                },
                ForwardingDecision::Drop { reason } => {
                    if let Some(reply) = self.drop_reply(&envelope, &reason) {
                        self.send_reply_on(channel, reply);
                    }
                    return;
                },
            }
        }

        self.observers
            .notify(ObserverStage::RequestReceived, envelope.action(), &envelope);

        let handler = envelope
            .action()
            .and_then(|action| self.handlers.read().get(action).cloned());
        let action = envelope.action().map(ToString::to_string).unwrap_or_default();

        let result = match handler {
            None => Err(ErrorDetails::new(
                ErrorCode::NotImplemented,
                format!("{} is not handled by {}", action, self.id),
            )),
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref()).to_string();
                    error!(
                        request_id = %envelope.id,
                        action = %action,
                        "Request handler panicked: {}",
                        message
                    );
                    Err(ErrorDetails::new(
                        ErrorCode::InternalError,
                        format!("handler for {} panicked: {}", action, message),
                    ))
                },
            },
        };

        let reply = match result {
            Ok(payload) => Envelope::response_to(&envelope, self.id.clone(), payload),
            Err(details) => Envelope::error_for(&envelope, self.id.clone(), details),
        };

        self.observers
            .notify(ObserverStage::ResponseSent, envelope.action(), &reply);
        self.send_reply_on(channel, reply);
    }

    fn handle_local_notification(&self, envelope: Envelope) {
        self.observers
            .notify(ObserverStage::NotificationReceived, envelope.action(), &envelope);

        let handler = envelope
            .action()
            .and_then(|action| self.notification_handlers.read().get(action).cloned());
        if let Some(handler) = handler {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                error!(
                    request_id = %envelope.id,
                    "Notification handler panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    fn relay_request(&self, connection: &Arc<Connection>, envelope: Envelope) {
        let channel = connection.id();

        if !self.config.relays() {
            let err = ForwardingError::RelayDisabled { node: self.id.clone() };
            debug!(request_id = %envelope.id, "{}", err);
            let reply = Envelope::error_for(
                &envelope,
                self.id.clone(),
                ErrorDetails::new(ErrorCode::ForwardingRejected, err.to_string()),
            );
            self.send_reply_on(channel, reply);
            return;
        }

        let context = ForwardingContext::relay(
            channel.clone(),
            Some(connection.peer_id().clone()),
            self.id.clone(),
        );
        let mut outbound = match self.forwarding.decide(&envelope, &context) {
            ForwardingDecision::Admit { rewritten } => rewritten.unwrap_or(envelope),
            ForwardingDecision::Reject { reply } => {
                self.send_reply_on(channel, reply);
                return;
            },
            ForwardingDecision::Drop { reason } => {
                if let Some(reply) = self.drop_reply(&envelope, &reason) {
                    self.send_reply_on(channel, reply);
                }
                return;
            },
        };
        outbound.path.push(self.id.clone());

        let key = outbound
            .originator()
            .map(|origin| CorrelationKey::new(origin.clone(), outbound.id));
        if let Some(key) = &key {
            self.relayed.insert(
                key.clone(),
                RelayedRequest {
                    inbound: channel.clone(),
                    deadline: Instant::now() + self.config.relay_timeout(),
                },
            );
        }

        match self.router.dispatch(&outbound) {
            Ok(next) => {
                debug!(request_id = %outbound.id, from = %channel, to = %next, "Request relayed");
            },
            Err(e) => {
                if let Some(key) = &key {
                    self.relayed.remove(key);
                }
                let cause = root_cause(&e).to_string();
                warn!(request_id = %outbound.id, error = %cause, "Relay failed");
                let reply = Envelope::error_for(
                    &outbound,
                    self.id.clone(),
                    ErrorDetails::new(ErrorCode::NotReachable, cause),
                );
                self.send_reply_on(channel, reply);
            },
        }
    }

    fn relay_notification(&self, connection: &Arc<Connection>, envelope: Envelope) {
        if !self.config.relays() {
            debug!(request_id = %envelope.id, "Not relaying notification");
            return;
        }

        let context = ForwardingContext::relay(
            connection.id().clone(),
            Some(connection.peer_id().clone()),
            self.id.clone(),
        );
        let mut outbound = match self.forwarding.decide(&envelope, &context) {
            ForwardingDecision::Admit { rewritten } => rewritten.unwrap_or(envelope),
            _ => return,
        };
        outbound.path.push(self.id.clone());

        if let Err(e) = self.router.dispatch(&outbound) {
            warn!(request_id = %outbound.id, error = %root_cause(&e), "Notification relay failed");
        }
    }

    fn relay_reply(&self, mut envelope: Envelope) {
        let Some(destination) = envelope.final_destination().cloned() else {
            return;
        };

        // replies retrace the request's hops; unrecorded ones are routed
        let key = CorrelationKey::new(destination, envelope.id);
        let result = match self.relayed.remove(&key) {
            Some((_, record)) => {
                envelope.path.push(self.id.clone());
                self.router.send_on(&record.inbound, &envelope)
            },
            None if envelope.path.contains(&self.id) => {
                debug!(request_id = %envelope.id, "Dropping looping reply");
                return;
            },
            None => {
                envelope.path.push(self.id.clone());
                self.router.dispatch(&envelope).map(|_| ())
            },
        };

        if let Err(e) = result {
            warn!(request_id = %envelope.id, error = %root_cause(&e), "Reply could not be relayed");
        }
    }

    /// Reply owed to the sender of a dropped request
    fn drop_reply(&self, envelope: &Envelope, reason: &DropReason) -> Option<Envelope> {
        if envelope.kind() != MessageKind::Request || *reason != DropReason::RoutingLoop {
            return None;
        }
        Some(Envelope::error_for(
            envelope,
            self.id.clone(),
            ErrorDetails::new(
                ErrorCode::RoutingLoopDetected,
                format!("{} is already on the path", self.id),
            ),
        ))
    }

    fn send_reply_on(&self, channel: &ChannelId, reply: Envelope) {
        let reply = match self.signatures.apply(reply) {
            Ok(reply) => reply,
            Err(e) => {
                error!(channel = %channel, error = %e, "Could not sign reply");
                return;
            },
        };

        if let Err(e) = self.router.send_on(channel, &reply) {
            warn!(
                request_id = %reply.id,
                channel = %channel,
                error = %root_cause(&e),
                "Reply lost"
            );
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    fn maintain(&self) -> Result<()> {
        let now = Instant::now();

        let timed_out = self.correlation.sweep_expired(now);
        let before = self.relayed.len();
        self.relayed.retain(|_, record| record.deadline > now);
        let relays_expired = before.saturating_sub(self.relayed.len());
        let pruned = self.routing_table.prune_expired(Utc::now());

        let announced = self.announce_if_due(now);

        let report = self.router.retry_queued();
        for (envelope, e) in &report.abandoned {
            if envelope.kind() == MessageKind::Request && envelope.originator() == Some(&self.id) {
                self.correlation.fail(envelope.id, root_cause(e).to_string());
            } else {
                warn!(
                    request_id = %envelope.id,
                    error = %root_cause(e),
                    "Dropping undeliverable message"
                );
            }
        }

        debug!(
            node = %self.id,
            timed_out,
            relays_expired,
            pruned,
            delivered = report.delivered,
            requeued = report.requeued,
            abandoned = report.abandoned.len(),
            "Maintenance cycle finished"
        );
        announced
    }

    fn announce_if_due(&self, now: Instant) -> Result<()> {
        if self.pool.is_empty() {
            return Ok(());
        }
        if !self.debounce.try_fire(now, self.routing_table.generation()) {
            return Ok(());
        }
        self.announce()
    }

    fn announce(&self) -> Result<()> {
        let now = Utc::now();
        let mut first_error: Option<ChargemeshError> = None;

        for connection in self.pool.connections() {
            let channel = connection.id();
            let mut announcement = TopologyAnnouncement::new(self.id.clone(), now);
            announcement.routes = self.routing_table.announceable_routes(channel, now);
            if self.config.role.is_controller() {
                announcement = announcement.with_route(NodeId::controller(), 0, None);
            }

            let routes = announcement.routes.len();
            let envelope = Envelope::announcement(
                self.correlation.next_request_id(),
                self.id.clone(),
                announcement,
            );
            match self.router.send_on(channel, &envelope) {
                Ok(()) => trace!(channel = %channel, routes, "Topology announced"),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Announcement failed");
                    first_error.get_or_insert(e);
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Maintainable for NodeInner {
    fn run_cycle(&self) -> CycleFuture<'_> {
        Box::pin(async move { self.maintain() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryTransport;
    use crate::protocol::WireFormat;
    use serde_json::json;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn node(name: &str, role: NodeRole) -> Node {
        NodeBuilder::new()
            .with_node_id(id(name))
            .with_role(role)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_node_id() {
        let result = NodeBuilder::new().build();
        assert!(matches!(
            result,
            Err(ChargemeshError::Config(ConfigError::MissingRequiredField { .. }))
        ));
    }

    #[test]
    fn test_builder_role_preset() {
        let hub = node("HUB-1", NodeRole::Hub);
        assert_eq!(hub.role(), NodeRole::Hub);
        assert!(hub.config().relays());
        assert_eq!(hub.state(), NodeState::Created);
    }

    #[test]
    fn test_with_config_keeps_earlier_node_id() {
        let node = NodeBuilder::new()
            .with_node_id(id("CS-1"))
            .with_config(NodeConfig::for_role(NodeRole::Hub))
            .build()
            .unwrap();
        assert_eq!(node.node_id(), &id("CS-1"));
        assert_eq!(node.role(), NodeRole::Hub);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let node = node("CS-1", NodeRole::Leaf);

        node.start().await.unwrap();
        assert_eq!(node.state(), NodeState::Running);
        assert!(node.start().await.is_err());

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_direct_request_response() {
        let station = node("CS-1", NodeRole::Leaf);
        let controller = node("CSMS", NodeRole::Controller);
        controller.on_request("Heartbeat", |_| {
            Ok(Payload::Structured(json!({"currentTime": "now"})))
        });

        MemoryTransport::connect(&station, &controller, WireFormat::Text).unwrap();

        let outcome = station
            .send(id("CSMS"), "Heartbeat", Payload::empty(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(
            outcome.reply().and_then(|r| r.payload()),
            Some(&Payload::Structured(json!({"currentTime": "now"})))
        );
    }

    #[tokio::test]
    async fn test_missing_handler_is_not_implemented() {
        let station = node("CS-1", NodeRole::Leaf);
        let controller = node("CSMS", NodeRole::Controller);
        MemoryTransport::connect(&station, &controller, WireFormat::Binary).unwrap();

        let outcome = station
            .send(id("CSMS"), "DataTransfer", Payload::empty(), Duration::from_secs(1))
            .await
            .unwrap();
        let SendOutcome::Rejected(reply) = outcome else {
            panic!("expected a rejection, got {:?}", outcome);
        };
        assert_eq!(reply.error().unwrap().code, ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn test_panicking_handler_gets_internal_error() {
        let station = node("CS-1", NodeRole::Leaf);
        let controller = node("CSMS", NodeRole::Controller);
        controller.on_request("Reset", |_| panic!("reset exploded"));
        MemoryTransport::connect(&station, &controller, WireFormat::Text).unwrap();

        let outcome = station
            .send(id("CSMS"), "Reset", Payload::empty(), Duration::from_secs(1))
            .await
            .unwrap();
        let SendOutcome::Rejected(reply) = outcome else {
            panic!("expected a rejection, got {:?}", outcome);
        };
        let details = reply.error().unwrap();
        assert_eq!(details.code, ErrorCode::InternalError);
        assert!(details.description.contains("reset exploded"));
    }

    #[tokio::test]
    async fn test_leaf_refuses_to_relay() {
        let a = node("CS-1", NodeRole::Leaf);
        let leaf = node("CS-2", NodeRole::Leaf);
        MemoryTransport::connect(&a, &leaf, WireFormat::Text).unwrap();
        a.add_static_route(id("CSMS"), NextHop::Relay(id("CS-2")), 0, None);

        let outcome = a
            .send(id("CSMS"), "Heartbeat", Payload::empty(), Duration::from_secs(1))
            .await
            .unwrap();
        let SendOutcome::Rejected(reply) = outcome else {
            panic!("expected a rejection, got {:?}", outcome);
        };
        assert_eq!(reply.error().unwrap().code, ErrorCode::ForwardingRejected);
    }

    #[tokio::test]
    async fn test_detach_removes_routes() {
        let station = node("CS-1", NodeRole::Leaf);
        let hub = node("HUB-1", NodeRole::Hub);
        let link = MemoryTransport::connect(&station, &hub, WireFormat::Text).unwrap();
        assert!(station.routing_table().resolve(&id("HUB-1")).is_ok());

        link.close();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(station.routing_table().resolve(&id("HUB-1")).is_err());
        assert!(hub.connection_pool().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_notification_reaches_neighbours() {
        let hub = node("HUB-1", NodeRole::Hub);
        let a = node("CS-1", NodeRole::Leaf);
        let b = node("CS-2", NodeRole::Leaf);
        MemoryTransport::connect(&hub, &a, WireFormat::Text).unwrap();
        MemoryTransport::connect(&hub, &b, WireFormat::Binary).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for leaf in [&a, &b] {
            let seen = Arc::clone(&seen);
            let name = leaf.node_id().clone();
            leaf.on_notification("TriggerMessage", move |_| seen.lock().push(name.clone()));
        }

        hub.send_notification(NodeId::broadcast(), "TriggerMessage", Payload::empty())
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![id("CS-1"), id("CS-2")]);
    }

    #[tokio::test]
    async fn test_malformed_frames_close_connection() {
        let station = node("CS-1", NodeRole::Leaf);
        let hub = node("HUB-1", NodeRole::Hub);
        let link = MemoryTransport::connect(&station, &hub, WireFormat::Text).unwrap();

        // unknown kind tag with a readable id: recoverable, answered
        for _ in 0..3 {
            link.b_handle
                .deliver(crate::protocol::Frame::Text(r#"[9,"42","HUB-1",["CS-1"]]"#.to_string()))
                .unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(hub.connection_pool().is_empty());
        assert!(link.b_transport.frames_sent() >= 2);
    }

    #[tokio::test]
    async fn test_fatal_frame_closes_connection() {
        let station = node("CS-1", NodeRole::Leaf);
        let hub = node("HUB-1", NodeRole::Hub);
        let link = MemoryTransport::connect(&station, &hub, WireFormat::Text).unwrap();

        link.b_handle
            .deliver(crate::protocol::Frame::Text("{not json".to_string()))
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(hub.connection_pool().is_empty());
    }

    #[tokio::test]
    async fn test_announce_now_teaches_neighbours() {
        let controller = node("CSMS", NodeRole::Controller);
        let hub = node("HUB-1", NodeRole::Hub);
        MemoryTransport::connect(&hub, &controller, WireFormat::Text).unwrap();

        controller.announce_now().unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let route = hub.routing_table().resolve(&NodeId::controller()).unwrap();
        assert_eq!(route.priority, 1);
    }
}
