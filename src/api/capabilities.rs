//! Capability traits
//!
//! Collaborators that only need part of a node depend on the matching trait
//! instead of on [`Node`]. Every trait is implemented by `Node`.

use crate::addressing::NodeId;
use crate::api::node::{Node, NotificationHandler, RequestHandler};
use crate::correlation::SendOutcome;
use crate::crypto::{SignatureRule, Verification};
use crate::error::{Result, RoutingError, SignatureError};
use crate::forwarding::{ActionEntry, ForwardingContext, ForwardingDecision, ForwardingFilter};
use crate::protocol::{ActionKind, Destination, Envelope, Payload};
use crate::routing::{NextHop, Route};
use std::future::Future;
use std::time::Duration;

/// Originates traffic
pub trait Sends {
    /// Send a request and wait for its outcome
    fn send_request(
        &self,
        destination: Destination,
        action: ActionKind,
        payload: Payload,
        timeout: Duration,
    ) -> impl Future<Output = Result<SendOutcome>> + Send;

    /// Send a one-way notification
    fn send_notification(
        &self,
        destination: Destination,
        action: ActionKind,
        payload: Payload,
    ) -> Result<()>;
}

/// Answers traffic addressed to the local node
pub trait Receives {
    /// Install the handler for requests of `action`
    fn on_request(&self, action: ActionKind, handler: RequestHandler);

    /// Install the handler for notifications of `action`
    fn on_notification(&self, action: ActionKind, handler: NotificationHandler);
}

/// Maintains routes
pub trait Routes {
    /// Add or refresh a static route
    fn add_static_route(
        &self,
        destination: NodeId,
        next_hop: NextHop,
        priority: u32,
        timeout: Option<Duration>,
    );

    /// Remove one route, or all routes for `destination`
    fn remove_route(&self, destination: &NodeId, next_hop: Option<&NextHop>) -> usize;

    /// Best live route for `destination`
    fn resolve(&self, destination: &NodeId) -> std::result::Result<Route, RoutingError>;
}

/// Decides what gets relayed
pub trait Forwards {
    /// Install a filter for `action`
    fn register_filter(&self, action: ActionKind, filter: ForwardingFilter);

    /// Install a complete action entry
    fn register_action(&self, action: ActionKind, entry: ActionEntry);

    /// Run the forwarding pipeline
    fn decide(&self, envelope: &Envelope, context: &ForwardingContext) -> ForwardingDecision;
}

/// Signs outbound and verifies inbound envelopes
pub trait Signs {
    /// Add a signature rule; the first matching rule governs
    fn add_signature_rule(&self, rule: SignatureRule);

    /// Apply the matching rule to an outbound envelope
    fn sign(&self, envelope: Envelope) -> std::result::Result<Envelope, SignatureError>;

    /// Check an inbound envelope
    fn verify(&self, envelope: &Envelope) -> Verification;
}

impl Sends for Node {
    fn send_request(
        &self,
        destination: Destination,
        action: ActionKind,
        payload: Payload,
        timeout: Duration,
    ) -> impl Future<Output = Result<SendOutcome>> + Send {
        self.send(destination, action, payload, timeout)
    }

    fn send_notification(
        &self,
        destination: Destination,
        action: ActionKind,
        payload: Payload,
    ) -> Result<()> {
        Node::send_notification(self, destination, action, payload)
    }
}

impl Receives for Node {
    fn on_request(&self, action: ActionKind, handler: RequestHandler) {
        self.set_request_handler(action, handler);
    }

    fn on_notification(&self, action: ActionKind, handler: NotificationHandler) {
        self.set_notification_handler(action, handler);
    }
}

impl Routes for Node {
    fn add_static_route(
        &self,
        destination: NodeId,
        next_hop: NextHop,
        priority: u32,
        timeout: Option<Duration>,
    ) {
        Node::add_static_route(self, destination, next_hop, priority, timeout);
    }

    fn remove_route(&self, destination: &NodeId, next_hop: Option<&NextHop>) -> usize {
        Node::remove_route(self, destination, next_hop)
    }

    fn resolve(&self, destination: &NodeId) -> std::result::Result<Route, RoutingError> {
        self.routing_table().resolve(destination)
    }
}

impl Forwards for Node {
    fn register_filter(&self, action: ActionKind, filter: ForwardingFilter) {
        self.forwarding().registry().set_filter(action, filter);
    }

    fn register_action(&self, action: ActionKind, entry: ActionEntry) {
        self.forwarding().registry().register(action, entry);
    }

    fn decide(&self, envelope: &Envelope, context: &ForwardingContext) -> ForwardingDecision {
        self.forwarding().decide(envelope, context)
    }
}

impl Signs for Node {
    fn add_signature_rule(&self, rule: SignatureRule) {
        self.signatures().add_rule(rule);
    }

    fn sign(&self, envelope: Envelope) -> std::result::Result<Envelope, SignatureError> {
        self.signatures().apply(envelope)
    }

    fn verify(&self, envelope: &Envelope) -> Verification {
        self.signatures().verify(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{NodeBuilder, NodeRole};
    use crate::forwarding::DefaultPolicy;
    use crate::network::ChannelId;
    use std::sync::Arc;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn hub() -> Node {
        NodeBuilder::new()
            .with_node_id(id("HUB-1"))
            .with_role(NodeRole::Hub)
            .build()
            .unwrap()
    }

    fn add_route<R: Routes>(routes: &R) {
        routes.add_static_route(id("CSMS"), NextHop::Channel(ChannelId::new("uplink")), 0, None);
    }

    #[test]
    fn test_routes_through_trait() {
        let node = hub();
        add_route(&node);

        let route = Routes::resolve(&node, &id("CSMS")).unwrap();
        assert_eq!(route.next_hop, NextHop::Channel(ChannelId::new("uplink")));
        assert_eq!(Routes::remove_route(&node, &id("CSMS"), None), 1);
    }

    #[test]
    fn test_register_filter_through_trait() {
        let node = hub();
        node.forwarding().set_default_policy(DefaultPolicy::Drop);

        node.forwarding().registry().register_validator("Foo", |_| Ok(()));

        let filter: ForwardingFilter =
            Arc::new(|_: &Envelope, _: &ForwardingContext| Ok(ForwardingDecision::admit()));
        Forwards::register_filter(&node, ActionKind::new("Foo"), filter);
        let entry = node.forwarding().registry().entry_for(Some(&ActionKind::new("Foo")));
        assert!(entry.filter.is_some());
        assert!(entry.validator.is_some());

        let request = Envelope::request(
            crate::addressing::RequestId::new(1),
            id("CS-1"),
            id("CSMS"),
            "Foo",
            Payload::empty(),
        );
        let context =
            ForwardingContext::relay(ChannelId::new("down"), Some(id("CS-1")), id("HUB-1"));
        assert!(Forwards::decide(&node, &request, &context).is_admit());
    }

    #[test]
    fn test_receives_through_trait() {
        let node = hub();
        let handler: RequestHandler = Arc::new(|_: &Envelope| Ok(Payload::empty()));
        Receives::on_request(&node, ActionKind::new("Heartbeat"), handler);
        assert!(node.request_handler(&ActionKind::new("Heartbeat")).is_some());
    }
}
