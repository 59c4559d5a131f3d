//! End-to-end tests for relaying between stations, hubs and the controller
//!
//! Nodes are linked with the in-memory transport, so every frame still goes
//! through encoding, the connection task, decoding and the routing table.

mod common;

use chargemesh::forwarding::{DefaultPolicy, ForwardingContext, ForwardingDecision};
use chargemesh::protocol::{CodecConfig, CodecSet, Frame, WireFormat, DEFAULT_MAX_PAYLOAD_SIZE};
use chargemesh::{
    Envelope, ErrorCode, Forwards, NextHop, NodeConfig, NodeId, NodeRole, ObserverStage, Payload,
    SendOutcome,
};
use common::{announce_chain, id, link, link_binary, node, node_with_config, settle};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

fn rejection_code(outcome: &SendOutcome) -> ErrorCode {
    match outcome {
        SendOutcome::Rejected(reply) => reply.error().map(|e| e.code).unwrap(),
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_request_relayed_through_hub() {
    let station = node("CS-1", NodeRole::Leaf);
    let hub = node("HUB-1", NodeRole::Hub);
    let controller = node("CSMS", NodeRole::Controller);

    controller.on_request("BootNotification", |request| {
        let vendor = request
            .payload()
            .and_then(|p| p.as_structured())
            .and_then(|v| v.get("chargePointVendor"))
            .cloned()
            .unwrap_or_default();
        Ok(Payload::Structured(json!({"status": "Accepted", "vendor": vendor})))
    });

    link(&station, &hub);
    link_binary(&hub, &controller);
    announce_chain(&[&controller, &hub]).await;

    let outcome = station
        .send(
            NodeId::controller(),
            "BootNotification",
            Payload::Structured(json!({"chargePointVendor": "Acme"})),
            TIMEOUT,
        )
        .await
        .unwrap();

    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
    let reply = outcome.reply().unwrap();
    assert_eq!(
        reply.payload(),
        Some(&Payload::Structured(json!({"status": "Accepted", "vendor": "Acme"})))
    );
    assert_eq!(reply.originator(), Some(&id("CSMS")));
    assert_eq!(hub.relayed_count(), 0);
}

#[tokio::test]
async fn test_multi_hop_over_learned_routes() {
    let station = node("CS-1", NodeRole::Leaf);
    let near = node("HUB-1", NodeRole::Hub);
    let far = node("HUB-2", NodeRole::Hub);
    let controller = node("CSMS", NodeRole::Controller);

    controller.on_request("Heartbeat", |request| {
        let hops: Vec<String> = request.path.iter().map(ToString::to_string).collect();
        Ok(Payload::Structured(json!({ "path": hops })))
    });

    link(&station, &near);
    link(&near, &far);
    link_binary(&far, &controller);
    announce_chain(&[&controller, &far, &near]).await;

    let route = station.routing_table().resolve(&NodeId::controller()).unwrap();
    assert_eq!(route.priority, 3);

    let outcome = station
        .send(NodeId::controller(), "Heartbeat", Payload::empty(), TIMEOUT)
        .await
        .unwrap();
    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
    assert_eq!(
        outcome.reply().and_then(|r| r.payload()),
        Some(&Payload::Structured(json!({"path": ["CS-1", "HUB-1", "HUB-2"]})))
    );
}

#[tokio::test]
async fn test_source_routed_request() {
    let station = node("CS-1", NodeRole::Leaf);
    let hub = node("HUB-1", NodeRole::Hub);
    let controller = node("CSMS", NodeRole::Controller);
    controller.on_request("Heartbeat", |_| Ok(Payload::empty()));

    link(&station, &hub);
    link(&hub, &controller);

    let route = vec![id("HUB-1"), id("CSMS")];
    let outcome = station
        .send(chargemesh::Destination::SourceRoute(route), "Heartbeat", Payload::empty(), TIMEOUT)
        .await
        .unwrap();
    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_response() {
    let station = node("CS-1", NodeRole::Leaf);
    let controller = node("CSMS", NodeRole::Controller);
    controller.on_request("Heartbeat", |_| Ok(Payload::empty()));

    let link = link(&station, &controller);
    // the controller answers, but its replies are lost
    link.b_transport.set_fail_sends(true);

    let call = station
        .begin_request(id("CSMS"), "Heartbeat", Payload::empty(), Duration::from_millis(100))
        .unwrap();
    let call_id = call.id();

    let started = tokio::time::Instant::now();
    let outcome = call.wait().await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome, SendOutcome::TimedOut), "unexpected outcome: {:?}", outcome);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150));

    let request = Envelope::request(call_id, id("CS-1"), id("CSMS"), "Heartbeat", Payload::empty());
    let late = Envelope::response_to(&request, id("CSMS"), Payload::empty());
    let codecs = CodecSet::new(CodecConfig {
        max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
    });
    link.a_handle
        .deliver(codecs.encode(WireFormat::Text, &late).unwrap())
        .unwrap();
    settle().await;

    let stats = station.correlation().stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.late, 1);
    assert_eq!(stats.matched, 0);
}

#[tokio::test]
async fn test_routing_loop_is_reported() {
    let station = node("CS-1", NodeRole::Leaf);
    let west = node("HUB-1", NodeRole::Hub);
    let east = node("HUB-2", NodeRole::Hub);

    let uplink = link(&station, &west);
    let trunk = link(&west, &east);

    let ghost = id("GHOST");
    station.add_static_route(ghost.clone(), NextHop::Channel(uplink.a_channel().clone()), 0, None);
    west.add_static_route(ghost.clone(), NextHop::Channel(trunk.a_channel().clone()), 0, None);
    east.add_static_route(ghost.clone(), NextHop::Channel(trunk.b_channel().clone()), 0, None);

    let outcome = station
        .send(ghost, "Heartbeat", Payload::empty(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(rejection_code(&outcome), ErrorCode::RoutingLoopDetected);
}

#[tokio::test]
async fn test_default_drop_rejects_unfiltered_action() {
    let station = node("CS-1", NodeRole::Leaf);
    let hub = node_with_config(
        "HUB-1",
        NodeConfig {
            default_policy: DefaultPolicy::Drop,
            ..NodeConfig::for_role(NodeRole::Hub)
        },
    );
    let controller = node("CSMS", NodeRole::Controller);

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    controller.on_request("Foo", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Payload::empty())
    });

    link(&station, &hub);
    link(&hub, &controller);
    announce_chain(&[&controller, &hub]).await;

    let outcome = station
        .send(id("CSMS"), "Foo", Payload::empty(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(rejection_code(&outcome), ErrorCode::NotSupported);
    assert_eq!(outcome.reply().unwrap().originator(), Some(&id("HUB-1")));
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    // a filter opts the action in
    Forwards::register_filter(
        &hub,
        "Foo".into(),
        Arc::new(|_: &Envelope, _: &ForwardingContext| Ok(ForwardingDecision::admit())),
    );
    let outcome = station
        .send(id("CSMS"), "Foo", Payload::empty(), TIMEOUT)
        .await
        .unwrap();
    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_destination_is_transport_failure() {
    let station = node("CS-1", NodeRole::Leaf);

    let outcome = station
        .send(id("CSMS"), "Heartbeat", Payload::empty(), TIMEOUT)
        .await
        .unwrap();
    assert!(
        matches!(outcome, SendOutcome::TransportFailure(_)),
        "unexpected outcome: {:?}",
        outcome
    );
}

#[tokio::test]
async fn test_hub_without_route_answers_not_reachable() {
    let station = node("CS-1", NodeRole::Leaf);
    let hub = node("HUB-1", NodeRole::Hub);
    let uplink = link(&station, &hub);
    station.add_static_route(id("CSMS"), NextHop::Channel(uplink.a_channel().clone()), 0, None);

    let outcome = station
        .send(id("CSMS"), "Heartbeat", Payload::empty(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(rejection_code(&outcome), ErrorCode::NotReachable);
    assert_eq!(hub.relayed_count(), 0);
}

#[tokio::test]
async fn test_observers_see_lifecycle() {
    let station = node("CS-1", NodeRole::Leaf);
    let controller = node("CSMS", NodeRole::Controller);
    controller.on_request("Authorize", |_| {
        Ok(Payload::Structured(json!({"idTagInfo": {"status": "Accepted"}})))
    });
    link(&station, &controller);

    let stages = Arc::new(Mutex::new(Vec::new()));
    for (node, stage) in [
        (&station, ObserverStage::RequestSent),
        (&controller, ObserverStage::RequestReceived),
        (&controller, ObserverStage::ResponseSent),
        (&station, ObserverStage::ResponseReceived),
    ] {
        let stages = Arc::clone(&stages);
        node.observe(stage, Some("Authorize".into()), move |_| stages.lock().push(stage));
    }

    let outcome = station
        .send(id("CSMS"), "Authorize", Payload::empty(), TIMEOUT)
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(
        *stages.lock(),
        vec![
            ObserverStage::RequestSent,
            ObserverStage::RequestReceived,
            ObserverStage::ResponseSent,
            ObserverStage::ResponseReceived,
        ]
    );
}

#[tokio::test]
async fn test_notification_relayed_to_controller() {
    let station = node("CS-1", NodeRole::Leaf);
    let hub = node("HUB-1", NodeRole::Hub);
    let controller = node("CSMS", NodeRole::Controller);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    controller.on_notification("StatusNotification", move |envelope| {
        sink.lock().push(envelope.payload().cloned());
    });

    link(&station, &hub);
    link(&hub, &controller);
    announce_chain(&[&controller, &hub]).await;

    station
        .send_notification(
            NodeId::controller(),
            "StatusNotification",
            Payload::Structured(json!({"connectorId": 1, "status": "Available"})),
        )
        .unwrap();
    settle().await;

    assert_eq!(
        *received.lock(),
        vec![Some(Payload::Structured(json!({"connectorId": 1, "status": "Available"})))]
    );
}

#[tokio::test]
async fn test_unknown_kind_answered_with_type_not_supported() {
    let station = node("CS-1", NodeRole::Leaf);
    let hub = node("HUB-1", NodeRole::Hub);
    let link = link(&station, &hub);

    link.b_handle
        .deliver(Frame::Text(r#"[9,"4242","HUB-1",["CS-1"]]"#.to_string()))
        .unwrap();
    settle().await;

    // one rejection went back and the connection survived
    assert_eq!(link.b_transport.frames_sent(), 1);
    assert_eq!(hub.connection_pool().len(), 1);
}
