//! # chargemesh
//!
//! Relayed request/response messaging for charging infrastructure.
//!
//! Charging stations, local hubs and a central controller exchange
//! requests, responses and notifications over persistent bidirectional
//! channels. Nodes relay traffic for each other along routing tables they
//! learn from topology announcements, and the originator of every request
//! gets exactly one outcome: a response, an error reply, a timeout or a
//! transport failure.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chargemesh::{NodeBuilder, NodeId, NodeRole};
//! use chargemesh::network::MemoryTransport;
//! use chargemesh::protocol::{Payload, WireFormat};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = NodeBuilder::new()
//!         .with_node_id(NodeId::new("CSMS")?)
//!         .with_role(NodeRole::Controller)
//!         .build()?;
//!     let station = NodeBuilder::new().with_node_id(NodeId::new("CS-1")?).build()?;
//!
//!     controller.on_request("BootNotification", |_request| {
//!         Ok(Payload::Structured(serde_json::json!({"status": "Accepted"})))
//!     });
//!
//!     MemoryTransport::connect(&station, &controller, WireFormat::Text)?;
//!     controller.start().await?;
//!     station.start().await?;
//!
//!     let outcome = station
//!         .send(
//!             NodeId::new("CSMS")?,
//!             "BootNotification",
//!             Payload::empty(),
//!             Duration::from_secs(5),
//!         )
//!         .await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod addressing;
pub mod api;
pub mod correlation;
pub mod crypto;
pub mod error;
pub mod forwarding;
pub mod maintenance;
pub mod network;
pub mod protocol;
pub mod routing;

// Re-export main types
pub use addressing::{CorrelationKey, NetworkPath, NodeId, RequestId};
pub use api::{
    load_config, save_config, Forwards, Node, NodeBuilder, NodeConfig, NodeRole, NodeState,
    ObserverStage, Receives, Routes, Sends, Signs,
};
pub use correlation::{PendingCall, SendOutcome};
pub use crypto::{Identity, PublicKey, SecureChannel, SignaturePolicy, SignatureRule};
pub use error::{
    ChargemeshError, ConfigError, CorrelationError, CryptoError, DecodeError, ForwardingError,
    NetworkError, ProtocolError, Result, RoutingError, SignatureError,
};
pub use forwarding::{DefaultPolicy, ForwardingDecision, ForwardingEngine};
pub use protocol::{
    ActionKind, Destination, Envelope, ErrorCode, ErrorDetails, MessageKind, Payload, WireFormat,
};
pub use routing::{NextHop, Route, Router, RoutingTable};
